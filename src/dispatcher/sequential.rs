//! Sequential dispatcher — plan order, on one background worker

use super::{deliver, prepare_collector, Dispatcher};
use crate::collector::{OverallCallback, RecordOutcome, ResultAggregator};
use crate::error::{EventError, Result};
use crate::handler::{ExceptionHandler, LoggingExceptionHandler};
use crate::queue::{DispatchPlan, PlannedObserver};
use crate::types::Event;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Job {
    event: Arc<Event>,
    observers: Vec<PlannedObserver>,
    recorder: Option<Arc<dyn RecordOutcome>>,
}

/// Hands each dispatch to a single worker task and returns immediately
///
/// Observers of one event run in plan order, and events run in the order
/// they were dispatched. Nothing from two events ever interleaves.
/// Must be created inside a tokio runtime.
pub struct SequentialDispatcher {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SequentialDispatcher {
    /// Spawn the worker; failures are reported to `handler`
    pub fn new(handler: Arc<dyn ExceptionHandler>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                for planned in job.observers {
                    deliver(
                        planned,
                        Arc::clone(&job.event),
                        job.recorder.clone(),
                        Arc::clone(&handler),
                    )
                    .await;
                }
            }
            tracing::debug!(dispatcher = "sequential", "Worker drained and stopped");
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop accepting events and wait for queued ones to finish
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(dispatcher = "sequential", error = %e, "Worker task failed");
            }
            tracing::info!(dispatcher = "sequential", "Dispatcher shut down");
        }
    }

    /// Whether the dispatcher still accepts events
    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }
}

impl Default for SequentialDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(LoggingExceptionHandler))
    }
}

#[async_trait]
impl<A: Send + 'static> Dispatcher<A> for SequentialDispatcher {
    async fn dispatch(
        &self,
        event: Arc<Event>,
        plan: DispatchPlan,
        aggregator: Option<Arc<dyn ResultAggregator<A>>>,
        overall: Option<OverallCallback<A>>,
    ) -> Result<()> {
        let recorder = prepare_collector(&event, &plan, aggregator, overall)?;

        tracing::debug!(
            dispatcher = "sequential",
            event_id = %event.id,
            event_type = %event.event_type,
            observers = plan.len(),
            wanting_result = plan.wanting_result(),
            "Queueing event"
        );

        let job = Job {
            event,
            observers: plan.into_observers(),
            recorder,
        };

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| EventError::Shutdown("sequential worker has stopped".to_string())),
            None => Err(EventError::Shutdown(
                "sequential dispatcher was shut down".to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        "sequential"
    }

    async fn shutdown(&self) {
        SequentialDispatcher::shutdown(self).await;
    }
}
