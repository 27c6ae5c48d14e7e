//! Synchronous dispatcher — plan order, on the caller's task

use super::{deliver, prepare_collector, Dispatcher};
use crate::collector::{OverallCallback, ResultAggregator};
use crate::error::Result;
use crate::handler::{ExceptionHandler, LoggingExceptionHandler};
use crate::queue::DispatchPlan;
use crate::types::Event;
use async_trait::async_trait;
use std::sync::Arc;

/// Invokes each planned observer in order before `dispatch` completes
///
/// A failing observer is reported and recorded; the observers after it
/// still run.
pub struct SyncDispatcher {
    handler: Arc<dyn ExceptionHandler>,
}

impl SyncDispatcher {
    /// Create a dispatcher reporting failures to `handler`
    pub fn new(handler: Arc<dyn ExceptionHandler>) -> Self {
        Self { handler }
    }
}

impl Default for SyncDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(LoggingExceptionHandler))
    }
}

#[async_trait]
impl<A: Send + 'static> Dispatcher<A> for SyncDispatcher {
    async fn dispatch(
        &self,
        event: Arc<Event>,
        plan: DispatchPlan,
        aggregator: Option<Arc<dyn ResultAggregator<A>>>,
        overall: Option<OverallCallback<A>>,
    ) -> Result<()> {
        let recorder = prepare_collector(&event, &plan, aggregator, overall)?;

        tracing::debug!(
            dispatcher = "sync",
            event_id = %event.id,
            event_type = %event.event_type,
            observers = plan.len(),
            wanting_result = plan.wanting_result(),
            "Dispatching event"
        );

        for planned in plan.into_observers() {
            deliver(
                planned,
                Arc::clone(&event),
                recorder.clone(),
                Arc::clone(&self.handler),
            )
            .await;
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "sync"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::collector::Outcome;
    use crate::error::{EventError, ObserverError};
    use crate::handler::MemoryExceptionHandler;
    use crate::observer::{FnObserver, ObserverRef};
    use std::sync::Mutex;

    fn recording(name: &str, log: &Arc<Mutex<Vec<String>>>) -> ObserverRef {
        let log = Arc::clone(log);
        let name = name.to_string();
        FnObserver::returning(name.clone(), move |_| {
            log.lock().unwrap().push(name.clone());
            let value = serde_json::json!(name.clone());
            async move { Ok(value) }
        })
        .arc()
    }

    #[tokio::test]
    async fn test_runs_in_plan_order_before_returning() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = DispatchPlan::from_observers(vec![
            recording("a", &log),
            recording("b", &log),
            recording("c", &log),
        ]);
        let (cb, mut rx) = callback();

        SyncDispatcher::default()
            .dispatch(event("t"), plan, aggregator(), cb)
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        let outcomes = rx.try_recv().unwrap();
        let values: Vec<&str> = outcomes
            .iter()
            .map(|o| o.value().unwrap().as_str().unwrap())
            .collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let handler = Arc::new(MemoryExceptionHandler::default());
        let failing = failing("bad");
        let plan = DispatchPlan::from_observers(vec![
            Arc::clone(&failing),
            returning("good", serde_json::json!(7)),
        ]);
        let (cb, mut rx) = callback();

        SyncDispatcher::new(handler.clone())
            .dispatch(event("t"), plan, aggregator(), cb)
            .await
            .unwrap();

        let outcomes = rx.try_recv().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].failure().unwrap().is_from(&failing));
        assert_eq!(outcomes[1].value(), Some(&serde_json::json!(7)));
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure_outcome() {
        let handler = Arc::new(MemoryExceptionHandler::default());
        let panicking = FnObserver::returning("panicky", |_| async {
            if true {
                panic!("observer blew up");
            }
            Ok(serde_json::json!(null))
        })
        .arc();
        let plan = DispatchPlan::from_observers(vec![panicking]);
        let (cb, mut rx) = callback();

        SyncDispatcher::new(handler.clone())
            .dispatch(event("t"), plan, aggregator(), cb)
            .await
            .unwrap();

        let outcomes = rx.try_recv().unwrap();
        match &outcomes[0] {
            Outcome::Failure(f) => {
                assert!(matches!(&f.error, ObserverError::Panicked(msg) if msg == "observer blew up"))
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_listener_failure_only_reported() {
        let handler = Arc::new(MemoryExceptionHandler::default());
        let listener = FnObserver::listening("listener", |_| async {
            Err(ObserverError::failed("nope"))
        })
        .arc();
        let plan = DispatchPlan::from_observers(vec![listener]);

        Dispatcher::<Vec<Outcome>>::dispatch(
            &SyncDispatcher::new(handler.clone()),
            event("t"),
            plan,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_missing_callback_rejected_before_invocation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plan = DispatchPlan::from_observers(vec![recording("a", &log)]);

        let err = SyncDispatcher::default()
            .dispatch(event("t"), plan, aggregator(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::State(_)));
        assert!(log.lock().unwrap().is_empty());
    }
}
