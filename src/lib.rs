//! # a3s-observe
//!
//! In-process observer dispatch with exactly-once result aggregation for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-observe` delivers one event to every matching observer, runs them
//! inline, on a background worker, or in parallel, and reduces the outcome of
//! each result-wanting observer into a single aggregate handed to the caller.
//! A failing observer contributes a failure outcome instead of aborting its
//! siblings, so the aggregate always accounts for every observer exactly once.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_observe::{CollectValues, FnObserver, MulticastEventManager};
//!
//! # async fn example() -> a3s_observe::Result<()> {
//! let manager = MulticastEventManager::<Vec<serde_json::Value>>::builder()
//!     .with_aggregator(CollectValues)
//!     .build_multicast()?;
//!
//! manager.register_observer(
//!     FnObserver::returning("pricing", |event| async move {
//!         Ok(serde_json::json!({"quoted": event.payload["sku"]}))
//!     })
//!     .arc(),
//! );
//!
//! let event = manager.event("order.created", serde_json::json!({"sku": "A-1"}));
//! let quotes = manager.trigger_and_wait(event).await?;
//! println!("Quotes: {:?}", quotes);
//! # Ok(())
//! # }
//! ```
//!
//! ## Dispatchers
//!
//! - **sync** — observers run in order on the triggering task
//! - **sequential** — observers run in order on one background worker
//! - **parallel** — observers run concurrently on a worker pool, joined before the trigger returns
//!
//! ## Architecture
//!
//! - **EventTypeRegistry** — interns event-type names into identity-comparable ids
//! - **Observer** trait — async handler, optionally result-wanting or fire-once
//! - **ObserverQueue** — insertion-ordered registrations, snapshotted once per trigger
//! - **ResultCollector** — one-shot barrier over a fixed number of outcomes
//! - **Dispatcher** trait — delivers one event to a snapshot of observers
//! - **Event managers** — unicast, bidirectional unicast and multicast topologies

pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod manager;
pub mod observer;
pub mod queue;
pub mod types;

// Re-export core types
pub use collector::{
    CollectOutcomes, CollectValues, CountOutcomes, ObserverFailure, Outcome, OutcomeCounts,
    OverallCallback, ResultAggregator, ResultCollector, ResultSink,
};
pub use config::{DispatchConfig, DispatchMode};
pub use dispatcher::{
    BoundedPool, Dispatcher, ParallelDispatcher, PerObserverPool, SequentialDispatcher,
    SyncDispatcher, WorkerPool, WorkerPoolProvider,
};
pub use error::{EventError, ObserverError, Result};
pub use handler::{ExceptionHandler, LoggingExceptionHandler, MemoryExceptionHandler};
pub use manager::{
    BidirectionalUnicastEventManager, EventManagerBuilder, MulticastEventManager,
    UnicastEventManager,
};
pub use observer::{same_observer, FireOnce, FnObserver, Observer, ObserverRef};
pub use queue::{DispatchPlan, ObserverId, ObserverQueue, PlannedObserver};
pub use types::{Event, EventTypeId, EventTypeRegistry};
