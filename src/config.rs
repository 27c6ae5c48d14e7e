//! Dispatch configuration
//!
//! Selects and sizes the dispatcher a manager is built with. The options are
//! plain serde data so they can live in a larger application config file.

use crate::dispatcher::{
    BoundedPool, Dispatcher, ParallelDispatcher, PerObserverPool, SequentialDispatcher,
    SyncDispatcher, WorkerPoolProvider,
};
use crate::error::{EventError, Result};
use crate::handler::ExceptionHandler;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How the observers of one trigger are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchMode {
    /// In plan order on the triggering task
    #[default]
    Sync,
    /// In plan order on one background worker
    Sequential,
    /// Concurrently on a worker pool, joined before the trigger returns
    Parallel,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Dispatcher options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Dispatch strategy
    #[serde(default)]
    pub mode: DispatchMode,

    /// Maximum concurrent observers per parallel dispatch
    ///
    /// `None` runs every planned observer on its own worker.
    /// Ignored by the sync and sequential modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Give up joining a parallel dispatch after this many milliseconds
    ///
    /// `None` waits for every observer, however long it takes. Observers
    /// still running at the deadline are not cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_timeout_ms: Option<u64>,
}

impl DispatchConfig {
    /// Config for the given mode with default options
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject option values no dispatcher can honor
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == Some(0) {
            return Err(EventError::Config(
                "maxWorkers must be at least 1".to_string(),
            ));
        }
        if self.join_timeout_ms == Some(0) {
            return Err(EventError::Config(
                "joinTimeoutMs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Join timeout as a duration
    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_ms.map(Duration::from_millis)
    }

    /// Worker pool provider implied by `max_workers`
    pub fn worker_pool_provider(&self) -> Arc<dyn WorkerPoolProvider> {
        match self.max_workers {
            Some(max) => Arc::new(BoundedPool::new(max)),
            None => Arc::new(PerObserverPool),
        }
    }

    /// Build the configured dispatcher
    ///
    /// `pools` overrides the provider derived from `max_workers`. The
    /// sequential mode spawns its worker, so it needs a tokio runtime.
    pub fn build_dispatcher<A: Send + 'static>(
        &self,
        handler: Arc<dyn ExceptionHandler>,
        pools: Option<Arc<dyn WorkerPoolProvider>>,
    ) -> Result<Arc<dyn Dispatcher<A>>> {
        self.validate()?;

        let dispatcher: Arc<dyn Dispatcher<A>> = match self.mode {
            DispatchMode::Sync => Arc::new(SyncDispatcher::new(handler)),
            DispatchMode::Sequential => Arc::new(SequentialDispatcher::new(handler)),
            DispatchMode::Parallel => {
                let pools = pools.unwrap_or_else(|| self.worker_pool_provider());
                let mut parallel = ParallelDispatcher::new(handler).with_pool_provider(pools);
                if let Some(limit) = self.join_timeout() {
                    parallel = parallel.with_join_timeout(limit);
                }
                Arc::new(parallel)
            }
        };

        tracing::debug!(
            mode = %self.mode,
            max_workers = ?self.max_workers,
            join_timeout_ms = ?self.join_timeout_ms,
            "Built dispatcher"
        );
        Ok(dispatcher)
    }
}
