//! Dispatchers — deliver one event to a planned set of observers
//!
//! All dispatchers share the same contract: build a [`ResultCollector`]
//! when the plan has result-wanting observers, reject the dispatch up front
//! when nobody could receive those results, then invoke every planned
//! observer with failures contained per observer.
//!
//! - **sync** — [`SyncDispatcher`], in plan order on the caller's task
//! - **sequential** — [`SequentialDispatcher`], in plan order on one background worker
//! - **parallel** — [`ParallelDispatcher`], one pooled task per observer, joined before returning

use crate::collector::{
    ObserverFailure, OverallCallback, RecordOutcome, ResultAggregator, ResultCollector, SinkSlot,
};
use crate::error::{EventError, ObserverError, Result};
use crate::handler::{report_failure, ExceptionHandler};
use crate::queue::{DispatchPlan, PlannedObserver};
use crate::types::Event;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

mod parallel;
mod sequential;
mod sync;

pub use parallel::{BoundedPool, ParallelDispatcher, PerObserverPool, WorkerPool, WorkerPoolProvider};
pub use sequential::SequentialDispatcher;
pub use sync::SyncDispatcher;

/// Core trait for dispatch strategies
///
/// `aggregator` and `overall` are only consulted when the plan contains
/// observers that want a result. In that case a missing callback is a
/// [`EventError::State`] and a missing aggregator an [`EventError::Config`],
/// both returned before any observer runs.
#[async_trait]
pub trait Dispatcher<A: Send + 'static>: Send + Sync {
    /// Deliver `event` to every observer in `plan`
    async fn dispatch(
        &self,
        event: Arc<Event>,
        plan: DispatchPlan,
        aggregator: Option<Arc<dyn ResultAggregator<A>>>,
        overall: Option<OverallCallback<A>>,
    ) -> Result<()>;

    /// Dispatcher name (e.g., "sync", "sequential", "parallel")
    fn name(&self) -> &str;

    /// Stop accepting events and finish queued work
    async fn shutdown(&self) {}
}

/// Validate the dispatch inputs and build the collector, if one is needed
pub(crate) fn prepare_collector<A: Send + 'static>(
    event: &Event,
    plan: &DispatchPlan,
    aggregator: Option<Arc<dyn ResultAggregator<A>>>,
    overall: Option<OverallCallback<A>>,
) -> Result<Option<Arc<dyn RecordOutcome>>> {
    let expected = plan.wanting_result();
    if expected == 0 {
        return Ok(None);
    }

    let overall = overall.ok_or_else(|| {
        EventError::State(format!(
            "{} observer(s) of '{}' want a result but no overall callback was supplied",
            expected, event.event_type
        ))
    })?;
    let aggregator = aggregator.ok_or_else(|| {
        EventError::Config(format!(
            "{} observer(s) of '{}' want a result but no result aggregator is configured",
            expected, event.event_type
        ))
    })?;

    let collector: Arc<dyn RecordOutcome> =
        Arc::new(ResultCollector::new(expected, aggregator, overall));
    Ok(Some(collector))
}

/// Invoke one planned observer and route its outcome
///
/// Errors and panics become one failure report and, for result-wanting
/// observers, one failure outcome. Nothing escapes to the caller.
pub(crate) async fn deliver(
    mut planned: PlannedObserver,
    event: Arc<Event>,
    recorder: Option<Arc<dyn RecordOutcome>>,
    handler: Arc<dyn ExceptionHandler>,
) {
    let observer = Arc::clone(planned.observer());

    let (slot, sink) = match recorder {
        Some(recorder) if planned.wants_result() => {
            let (slot, sink) = SinkSlot::open(
                recorder,
                Arc::clone(&observer),
                Arc::clone(&event),
                Arc::clone(&handler),
            );
            (Some(slot), Some(sink))
        }
        _ => (None, None),
    };

    planned.mark_invoked();
    let result = AssertUnwindSafe(observer.on_event(Arc::clone(&event), sink))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ObserverError::Panicked(panic_message(&*panic))));
    // Fire-once registrations leave the queue as soon as the invocation returns.
    drop(planned);

    if let Err(error) = result {
        let failure = ObserverFailure {
            observer,
            event,
            error,
        };
        report_failure(handler.as_ref(), &failure);
        if let Some(slot) = &slot {
            slot.fail(failure);
        }
    }

    if let Some(slot) = slot {
        slot.finish();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::collector::Outcome;

    #[test]
    fn test_prepare_without_result_wanting_observers() {
        let event = event("t");
        let plan = DispatchPlan::from_observers(Vec::new());
        let (cb, _rx) = callback();
        assert!(prepare_collector(&event, &plan, aggregator(), cb).unwrap().is_none());
    }

    #[test]
    fn test_prepare_rejects_missing_callback() {
        let event = event("t");
        let plan = DispatchPlan::from_observers(vec![returning("r", serde_json::json!(1))]);
        let err = prepare_collector::<Vec<Outcome>>(&event, &plan, aggregator(), None)
            .err()
            .unwrap();
        assert!(matches!(err, EventError::State(_)));
    }

    #[test]
    fn test_prepare_rejects_missing_aggregator() {
        let event = event("t");
        let plan = DispatchPlan::from_observers(vec![returning("r", serde_json::json!(1))]);
        let (cb, _rx) = callback();
        let err = prepare_collector(&event, &plan, None, cb).err().unwrap();
        assert!(matches!(err, EventError::Config(_)));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*boxed), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }
}
