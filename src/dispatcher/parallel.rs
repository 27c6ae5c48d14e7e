//! Parallel dispatcher — one pooled task per observer

use super::{deliver, prepare_collector, Dispatcher};
use crate::collector::{OverallCallback, ResultAggregator};
use crate::error::{EventError, Result};
use crate::handler::{ExceptionHandler, LoggingExceptionHandler};
use crate::queue::DispatchPlan;
use crate::types::Event;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Supplies a worker pool for each dispatch
pub trait WorkerPoolProvider: Send + Sync {
    /// Build a pool for a dispatch fanning out to `fan_out` observers
    fn pool(&self, fan_out: usize) -> WorkerPool;
}

/// A set of tasks sharing a fixed number of execution permits
///
/// Tasks beyond `size` wait for a permit before running.
pub struct WorkerPool {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` tasks at once (minimum 1)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Maximum number of concurrently running tasks
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks not yet joined
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Submit a task; it starts once a permit is free
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            // The semaphore is never closed, so a permit always arrives.
            let _permit = permits.acquire_owned().await.ok();
            task.await;
        });
    }

    /// Wait for every submitted task
    pub async fn join(mut self) {
        Self::drain(&mut self.tasks).await;
    }

    /// Wait for every submitted task, at most `limit`
    ///
    /// Returns `false` on timeout. Unfinished tasks are detached and keep
    /// running to completion in the background.
    pub async fn join_within(mut self, limit: Duration) -> bool {
        let drained = tokio::time::timeout(limit, Self::drain(&mut self.tasks))
            .await
            .is_ok();
        if !drained {
            self.tasks.detach_all();
        }
        drained
    }

    async fn drain(tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker pool task failed");
            }
        }
    }
}

/// One worker per observer, so every observer starts immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct PerObserverPool;

impl WorkerPoolProvider for PerObserverPool {
    fn pool(&self, fan_out: usize) -> WorkerPool {
        WorkerPool::new(fan_out)
    }
}

/// At most `max_workers` observers of one event run at once
#[derive(Debug, Clone, Copy)]
pub struct BoundedPool {
    /// Upper bound on concurrently running observers
    pub max_workers: usize,
}

impl BoundedPool {
    /// Create a provider capped at `max_workers`
    pub fn new(max_workers: usize) -> Self {
        Self { max_workers }
    }
}

impl WorkerPoolProvider for BoundedPool {
    fn pool(&self, fan_out: usize) -> WorkerPool {
        WorkerPool::new(fan_out.min(self.max_workers))
    }
}

/// Runs the observers of one event concurrently and joins them
///
/// `dispatch` completes once every observer has returned. Without a join
/// timeout, an observer that never returns keeps the dispatch pending.
pub struct ParallelDispatcher {
    handler: Arc<dyn ExceptionHandler>,
    pools: Arc<dyn WorkerPoolProvider>,
    join_timeout: Option<Duration>,
}

impl ParallelDispatcher {
    /// Create a dispatcher with one worker per observer and no join timeout
    pub fn new(handler: Arc<dyn ExceptionHandler>) -> Self {
        Self {
            handler,
            pools: Arc::new(PerObserverPool),
            join_timeout: None,
        }
    }

    /// Use a custom worker pool provider
    pub fn with_pool_provider(mut self, pools: Arc<dyn WorkerPoolProvider>) -> Self {
        self.pools = pools;
        self
    }

    /// Give up waiting for observers after `limit`
    ///
    /// Observers still running are left to finish in the background. Their
    /// outcomes still reach the overall callback.
    pub fn with_join_timeout(mut self, limit: Duration) -> Self {
        self.join_timeout = Some(limit);
        self
    }

    /// Configured join timeout, if any
    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout
    }
}

impl Default for ParallelDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(LoggingExceptionHandler))
    }
}

#[async_trait]
impl<A: Send + 'static> Dispatcher<A> for ParallelDispatcher {
    async fn dispatch(
        &self,
        event: Arc<Event>,
        plan: DispatchPlan,
        aggregator: Option<Arc<dyn ResultAggregator<A>>>,
        overall: Option<OverallCallback<A>>,
    ) -> Result<()> {
        let recorder = prepare_collector(&event, &plan, aggregator, overall)?;

        let mut pool = self.pools.pool(plan.len());
        tracing::debug!(
            dispatcher = "parallel",
            event_id = %event.id,
            event_type = %event.event_type,
            observers = plan.len(),
            wanting_result = plan.wanting_result(),
            workers = pool.size(),
            "Dispatching event"
        );

        for planned in plan.into_observers() {
            pool.spawn(deliver(
                planned,
                Arc::clone(&event),
                recorder.clone(),
                Arc::clone(&self.handler),
            ));
        }

        match self.join_timeout {
            None => {
                pool.join().await;
                Ok(())
            }
            Some(limit) => {
                let still_running = pool.pending();
                if pool.join_within(limit).await {
                    Ok(())
                } else {
                    tracing::warn!(
                        event_id = %event.id,
                        timeout_ms = limit.as_millis() as u64,
                        "Observers still running after join timeout"
                    );
                    Err(EventError::Timeout(format!(
                        "observers of '{}' (event {}) did not finish within {:?}; up to {} left running",
                        event.event_type, event.id, limit, still_running
                    )))
                }
            }
        }
    }

    fn name(&self) -> &str {
        "parallel"
    }
}
