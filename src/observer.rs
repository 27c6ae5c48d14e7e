//! Observer trait — the handler side of a dispatch
//!
//! An observer declares two capabilities (whether it produces a result and
//! whether it fires only once), a type predicate, and one async `on_event`
//! method. Fire-once behavior is added by wrapping any observer in
//! [`FireOnce`] rather than by a separate trait.

use crate::collector::ResultSink;
use crate::error::ObserverError;
use crate::types::{Event, EventTypeId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Shared handle to a registered observer
pub type ObserverRef = Arc<dyn Observer>;

/// Event observer
///
/// `on_event` receives `Some(sink)` exactly when [`Self::wants_result`] was
/// true at snapshot time. The sink is consumed by
/// [`ResultSink::deliver`], so a result can be delivered at most once.
/// Returning `Err` (or panicking) turns the invocation into a failure
/// outcome; sibling observers are unaffected.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Whether this observer contributes one outcome to the aggregate
    fn wants_result(&self) -> bool {
        false
    }

    /// Whether the observer handles events of this type. Must be pure.
    fn matches(&self, event_type: &EventTypeId) -> bool;

    /// Whether the queue evicts this observer after its first invocation
    fn is_fire_once(&self) -> bool {
        false
    }

    /// Observer name used in logs and failure reports
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one event
    async fn on_event(
        &self,
        event: Arc<Event>,
        sink: Option<ResultSink>,
    ) -> Result<(), ObserverError>;
}

/// Identity comparison for observer handles (data pointer only)
pub fn same_observer(a: &ObserverRef, b: &ObserverRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Decorator that makes any observer fire at most once
///
/// The queue claims a fire-once observer when it enters a snapshot and
/// evicts it once its invocation returns, whether it succeeded or not.
pub struct FireOnce<O> {
    inner: O,
}

impl<O: Observer> FireOnce<O> {
    /// Wrap an observer
    pub fn new(inner: O) -> Self {
        Self { inner }
    }

    /// Wrap and share in one step
    pub fn arc(inner: O) -> ObserverRef
    where
        O: 'static,
    {
        Arc::new(Self::new(inner))
    }

    /// The wrapped observer
    pub fn inner(&self) -> &O {
        &self.inner
    }
}

#[async_trait]
impl<O: Observer> Observer for FireOnce<O> {
    fn wants_result(&self) -> bool {
        self.inner.wants_result()
    }

    fn matches(&self, event_type: &EventTypeId) -> bool {
        self.inner.matches(event_type)
    }

    fn is_fire_once(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn on_event(
        &self,
        event: Arc<Event>,
        sink: Option<ResultSink>,
    ) -> Result<(), ObserverError> {
        self.inner.on_event(event, sink).await
    }
}

type ObserverFuture = BoxFuture<'static, Result<Option<serde_json::Value>, ObserverError>>;
type ObserverFn = dyn Fn(Arc<Event>) -> ObserverFuture + Send + Sync;

/// Observer backed by an async closure
///
/// Matches the event types added with [`FnObserver::for_type`]; with no types
/// added it matches every event.
pub struct FnObserver {
    name: String,
    event_types: Vec<EventTypeId>,
    wants_result: bool,
    func: Box<ObserverFn>,
}

impl FnObserver {
    /// Observer that reacts to events and produces no result
    pub fn listening<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ObserverError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            event_types: Vec::new(),
            wants_result: false,
            func: Box::new(move |event| {
                f(event)
                    .map(|r| r.map(|()| None::<serde_json::Value>))
                    .boxed()
            }),
        }
    }

    /// Observer whose return value becomes its outcome
    pub fn returning<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ObserverError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            event_types: Vec::new(),
            wants_result: true,
            func: Box::new(move |event| f(event).map(|r| r.map(Some)).boxed()),
        }
    }

    /// Restrict matching to an additional event type
    pub fn for_type(mut self, event_type: EventTypeId) -> Self {
        self.event_types.push(event_type);
        self
    }

    /// Share as an [`ObserverRef`]
    pub fn arc(self) -> ObserverRef {
        Arc::new(self)
    }
}

#[async_trait]
impl Observer for FnObserver {
    fn wants_result(&self) -> bool {
        self.wants_result
    }

    fn matches(&self, event_type: &EventTypeId) -> bool {
        self.event_types.is_empty() || self.event_types.contains(event_type)
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(
        &self,
        event: Arc<Event>,
        sink: Option<ResultSink>,
    ) -> Result<(), ObserverError> {
        let value = (self.func)(event).await?;
        if let (Some(value), Some(sink)) = (value, sink) {
            sink.deliver(value);
        }
        Ok(())
    }
}
