//! Exception handlers — sinks for observer failures
//!
//! Every observer failure is reported to the configured [`ExceptionHandler`]
//! once, in addition to being recorded as a failure outcome when the
//! observer wanted a result. Handlers only observe; they cannot change the
//! outcome of a dispatch.

use crate::collector::ObserverFailure;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{PoisonError, RwLock};

/// Trait for observer-failure sinks (logging, metrics, alerting)
///
/// Implementations must not panic. A panicking handler is caught and logged
/// so that it cannot disturb the dispatch that reported to it.
pub trait ExceptionHandler: Send + Sync {
    /// Handle one observer failure
    fn handle_observing_exception(&self, failure: &ObserverFailure);
}

/// Default handler: logs each failure at `warn` level
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_observing_exception(&self, failure: &ObserverFailure) {
        tracing::warn!(
            observer = %failure.observer_name(),
            event_id = %failure.event.id,
            event_type = %failure.event.event_type,
            kind = failure.error.as_label(),
            error = %failure.error,
            "Observer failed"
        );
    }
}

/// In-memory handler for development and testing
///
/// Keeps the most recent failures up to a configurable capacity.
pub struct MemoryExceptionHandler {
    failures: RwLock<Vec<ObserverFailure>>,
    max_failures: usize,
}

impl MemoryExceptionHandler {
    /// Create a handler keeping at most `max_failures` entries (0 = unbounded)
    pub fn new(max_failures: usize) -> Self {
        Self {
            failures: RwLock::new(Vec::new()),
            max_failures,
        }
    }

    /// Number of failures currently held
    pub fn count(&self) -> usize {
        self.failures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Recent failures, most recent first
    pub fn list(&self, limit: usize) -> Vec<ObserverFailure> {
        let failures = self.failures.read().unwrap_or_else(PoisonError::into_inner);
        failures.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for MemoryExceptionHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ExceptionHandler for MemoryExceptionHandler {
    fn handle_observing_exception(&self, failure: &ObserverFailure) {
        let mut failures = self.failures.write().unwrap_or_else(PoisonError::into_inner);
        failures.push(failure.clone());

        // Enforce max capacity
        if self.max_failures > 0 && failures.len() > self.max_failures {
            let drain_count = failures.len() - self.max_failures;
            failures.drain(..drain_count);
        }
    }
}

/// Report a failure, containing any panic raised by the handler itself
pub(crate) fn report_failure(handler: &dyn ExceptionHandler, failure: &ObserverFailure) {
    let reported = catch_unwind(AssertUnwindSafe(|| {
        handler.handle_observing_exception(failure)
    }));

    if reported.is_err() {
        tracing::error!(
            observer = %failure.observer_name(),
            event_id = %failure.event.id,
            "Exception handler panicked while reporting observer failure"
        );
    }
}
