//! Error types for a3s-observe

use thiserror::Error;

/// Errors surfaced to the caller of a trigger or dispatch
///
/// Configuration and state errors are raised synchronously, before any
/// observer runs. Observer failures never show up here; they travel as
/// [`ObserverError`] inside a failure outcome instead.
#[derive(Debug, Error)]
pub enum EventError {
    /// Invalid construction-time input or missing collaborator
    #[error("Configuration error: {0}")]
    Config(String),

    /// Trigger would produce results that nobody can receive
    #[error("State error: {0}")]
    State(String),

    /// Parallel join exceeded the configured timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Dispatcher was used after it was shut down
    #[error("Dispatcher shut down: {0}")]
    Shutdown(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of a single observer invocation
///
/// Always contained at the dispatcher boundary: it becomes one failure
/// outcome and one exception-handler notification.
#[derive(Debug, Clone, Error)]
pub enum ObserverError {
    /// Observer returned an error
    #[error("observer failed: {0}")]
    Failed(String),

    /// Observer panicked while handling the event
    #[error("observer panicked: {0}")]
    Panicked(String),

    /// Observer wanted a result but dropped its sink without delivering one
    #[error("observer finished without delivering a result")]
    ResultNotDelivered,
}

impl ObserverError {
    /// Create a `Failed` error from any displayable reason
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        ObserverError::Failed(reason.to_string())
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ObserverError::Failed(_) => "observer_failed",
            ObserverError::Panicked(_) => "observer_panicked",
            ObserverError::ResultNotDelivered => "observer_result_not_delivered",
        }
    }
}

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, EventError>;
