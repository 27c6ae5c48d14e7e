//! Result collection — outcomes, aggregation, and the one-shot barrier
//!
//! A [`ResultCollector`] is created per trigger when at least one matched
//! observer wants a result. It accepts exactly `expected` outcomes from any
//! number of threads; the record that completes the set reduces them with
//! the [`ResultAggregator`] and hands the aggregate to the overall callback.
//!
//! Observers never touch the collector directly. Each result-wanting
//! invocation gets a [`ResultSink`] bound to a private slot, and the slot
//! guarantees that the invocation contributes exactly one outcome: the
//! delivered value, the invocation error, or
//! [`ObserverError::ResultNotDelivered`].

use crate::error::ObserverError;
use crate::handler::{report_failure, ExceptionHandler};
use crate::observer::{same_observer, ObserverRef};
use crate::types::Event;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Callback receiving the aggregate of one trigger
pub type OverallCallback<A> = Box<dyn FnOnce(A) + Send>;

/// Failure value standing in for an observer's result
#[derive(Clone)]
pub struct ObserverFailure {
    /// The observer whose invocation failed
    pub observer: ObserverRef,

    /// The event being delivered
    pub event: Arc<Event>,

    /// What went wrong
    pub error: ObserverError,
}

impl ObserverFailure {
    /// Name of the failing observer
    pub fn observer_name(&self) -> &str {
        self.observer.name()
    }

    /// Whether this failure came from the given observer instance
    pub fn is_from(&self, observer: &ObserverRef) -> bool {
        same_observer(&self.observer, observer)
    }
}

impl fmt::Debug for ObserverFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverFailure")
            .field("observer", &self.observer_name())
            .field("event_id", &self.event.id)
            .field("event_type", &self.event.event_type)
            .field("error", &self.error)
            .finish()
    }
}

/// One observer's contribution to an aggregate
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The observer's own result
    Value(serde_json::Value),
    /// The observer failed; the failure takes the place of its result
    Failure(ObserverFailure),
}

impl Outcome {
    /// Whether this outcome is a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// The delivered value, if any
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::Failure(_) => None,
        }
    }

    /// The failure, if any
    pub fn failure(&self) -> Option<&ObserverFailure> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Failure(f) => Some(f),
        }
    }
}

/// Pure reduction of all outcomes of one trigger into a single value
///
/// Outcomes arrive in completion order, which is unspecified under parallel
/// dispatch. Any `Fn(Vec<Outcome>) -> A` closure is an aggregator.
pub trait ResultAggregator<A>: Send + Sync {
    /// Reduce the outcomes
    fn reduce(&self, outcomes: Vec<Outcome>) -> A;
}

impl<A, F> ResultAggregator<A> for F
where
    F: Fn(Vec<Outcome>) -> A + Send + Sync,
{
    fn reduce(&self, outcomes: Vec<Outcome>) -> A {
        self(outcomes)
    }
}

/// Aggregator returning the outcomes unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectOutcomes;

impl ResultAggregator<Vec<Outcome>> for CollectOutcomes {
    fn reduce(&self, outcomes: Vec<Outcome>) -> Vec<Outcome> {
        outcomes
    }
}

/// Aggregator keeping only delivered values
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectValues;

impl ResultAggregator<Vec<serde_json::Value>> for CollectValues {
    fn reduce(&self, outcomes: Vec<Outcome>) -> Vec<serde_json::Value> {
        outcomes
            .into_iter()
            .filter_map(|o| match o {
                Outcome::Value(v) => Some(v),
                Outcome::Failure(_) => None,
            })
            .collect()
    }
}

/// Value/failure tally of one trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    /// Outcomes that carried a value
    pub values: usize,

    /// Outcomes that carried a failure
    pub failures: usize,
}

impl OutcomeCounts {
    /// Total number of outcomes
    pub fn total(&self) -> usize {
        self.values + self.failures
    }
}

/// Aggregator counting values and failures
#[derive(Debug, Clone, Copy, Default)]
pub struct CountOutcomes;

impl ResultAggregator<OutcomeCounts> for CountOutcomes {
    fn reduce(&self, outcomes: Vec<Outcome>) -> OutcomeCounts {
        let failures = outcomes.iter().filter(|o| o.is_failure()).count();
        OutcomeCounts {
            values: outcomes.len() - failures,
            failures,
        }
    }
}

/// Object-safe view of a collector, independent of the aggregate type
pub(crate) trait RecordOutcome: Send + Sync {
    fn record(&self, outcome: Outcome);
}

/// One-shot barrier over a fixed number of outcomes
///
/// Outcomes are pushed into the bag before the atomic counter moves, so the
/// record whose increment reaches `expected` sees every outcome. That record
/// alone wins the `fired` compare-and-swap and runs the aggregator and the
/// overall callback, on its own thread.
pub struct ResultCollector<A> {
    expected: usize,
    recorded: AtomicUsize,
    fired: AtomicBool,
    outcomes: Mutex<Vec<Outcome>>,
    aggregator: Arc<dyn ResultAggregator<A>>,
    callback: Mutex<Option<OverallCallback<A>>>,
}

impl<A> ResultCollector<A> {
    /// Create a collector for `expected` outcomes
    ///
    /// # Panics
    /// If `expected` is zero. Triggers without result-wanting observers
    /// never build a collector.
    pub fn new(
        expected: usize,
        aggregator: Arc<dyn ResultAggregator<A>>,
        callback: OverallCallback<A>,
    ) -> Self {
        assert!(expected > 0, "ResultCollector requires at least one expected outcome");
        Self {
            expected,
            recorded: AtomicUsize::new(0),
            fired: AtomicBool::new(false),
            outcomes: Mutex::new(Vec::with_capacity(expected)),
            aggregator,
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Number of outcomes the collector waits for
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Number of outcomes recorded so far
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Acquire)
    }

    /// Whether the aggregate has been delivered
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Record one outcome; the `expected`-th call fires the collector
    ///
    /// # Panics
    /// If called after the collector fired or more than `expected` times.
    pub fn record(&self, outcome: Outcome) {
        if self.is_fired() {
            panic!(
                "outcome recorded after result collector fired (expected {})",
                self.expected
            );
        }

        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
        let count = self.recorded.fetch_add(1, Ordering::AcqRel) + 1;

        if count > self.expected {
            panic!(
                "result collector received {} outcomes, expected {}",
                count, self.expected
            );
        }

        if count == self.expected
            && self
                .fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.fire();
        }
    }

    fn fire(&self) {
        let outcomes =
            std::mem::take(&mut *self.outcomes.lock().unwrap_or_else(PoisonError::into_inner));
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        tracing::debug!(outcomes = outcomes.len(), "Result collector fired");

        let aggregate = self.aggregator.reduce(outcomes);
        if let Some(callback) = callback {
            callback(aggregate);
        }
    }
}

impl<A> RecordOutcome for ResultCollector<A> {
    fn record(&self, outcome: Outcome) {
        ResultCollector::record(self, outcome);
    }
}

impl<A> fmt::Debug for ResultCollector<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCollector")
            .field("expected", &self.expected)
            .field("recorded", &self.recorded())
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Per-invocation slot guaranteeing exactly one outcome
///
/// Three paths can complete it: the sink delivering a value, the dispatcher
/// recording an invocation error, or the not-delivered settlement that runs
/// once the invocation has returned and the sink is gone. The first to win
/// the `completed` swap records; the others are no-ops.
pub(crate) struct SinkSlot {
    recorder: Arc<dyn RecordOutcome>,
    observer: ObserverRef,
    event: Arc<Event>,
    handler: Arc<dyn ExceptionHandler>,
    completed: AtomicBool,
    sink_alive: AtomicBool,
    returned: AtomicBool,
}

impl SinkSlot {
    /// Open a slot and the sink handed to the observer
    pub(crate) fn open(
        recorder: Arc<dyn RecordOutcome>,
        observer: ObserverRef,
        event: Arc<Event>,
        handler: Arc<dyn ExceptionHandler>,
    ) -> (Arc<SinkSlot>, ResultSink) {
        let slot = Arc::new(SinkSlot {
            recorder,
            observer,
            event,
            handler,
            completed: AtomicBool::new(false),
            sink_alive: AtomicBool::new(true),
            returned: AtomicBool::new(false),
        });
        let sink = ResultSink {
            slot: Arc::clone(&slot),
        };
        (slot, sink)
    }

    fn complete_with(&self, outcome: impl FnOnce() -> Outcome) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.recorder.record(outcome());
        true
    }

    fn failure(&self, error: ObserverError) -> ObserverFailure {
        ObserverFailure {
            observer: Arc::clone(&self.observer),
            event: Arc::clone(&self.event),
            error,
        }
    }

    /// Record the invocation's failure unless a value was already delivered
    ///
    /// The caller reports the failure to the exception handler either way.
    pub(crate) fn fail(&self, failure: ObserverFailure) -> bool {
        self.complete_with(|| Outcome::Failure(failure))
    }

    /// Mark the invocation as returned and settle if the sink is already gone
    pub(crate) fn finish(&self) {
        self.returned.store(true, Ordering::SeqCst);
        if !self.sink_alive.load(Ordering::SeqCst) {
            self.settle_undelivered();
        }
    }

    fn settle_undelivered(&self) {
        self.complete_with(|| {
            let failure = self.failure(ObserverError::ResultNotDelivered);
            report_failure(self.handler.as_ref(), &failure);
            Outcome::Failure(failure)
        });
    }
}

/// One-shot handle through which an observer delivers its result
///
/// Consumed by [`ResultSink::deliver`]. Dropping it without delivering,
/// once the observer's `on_event` has returned, records
/// [`ObserverError::ResultNotDelivered`] for that observer. The sink may be
/// moved into another task and delivered later.
pub struct ResultSink {
    slot: Arc<SinkSlot>,
}

impl ResultSink {
    /// Deliver the observer's result
    pub fn deliver(self, value: serde_json::Value) {
        self.slot.complete_with(|| Outcome::Value(value));
    }
}

impl Drop for ResultSink {
    fn drop(&mut self) {
        self.slot.sink_alive.store(false, Ordering::SeqCst);
        if self.slot.returned.load(Ordering::SeqCst) {
            self.slot.settle_undelivered();
        }
    }
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("observer", &self.slot.observer.name())
            .field("completed", &self.slot.completed.load(Ordering::Acquire))
            .finish()
    }
}
