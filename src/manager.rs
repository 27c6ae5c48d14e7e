//! Event managers — observer topologies over a dispatcher
//!
//! Each manager owns an [`ObserverQueue`], snapshots it once per trigger and
//! hands the plan to its dispatcher.
//!
//! | Manager | Observers | Trigger |
//! |---|---|---|
//! | [`UnicastEventManager`] | one, no results | `trigger(event)` |
//! | [`BidirectionalUnicastEventManager`] | one, may want a result | `trigger(event, callback)` |
//! | [`MulticastEventManager`] | any number, any mix | `trigger(event, callback)` |

use crate::collector::{OverallCallback, ResultAggregator};
use crate::config::DispatchConfig;
use crate::dispatcher::{Dispatcher, WorkerPoolProvider};
use crate::error::{EventError, Result};
use crate::handler::{ExceptionHandler, LoggingExceptionHandler};
use crate::observer::ObserverRef;
use crate::queue::{ObserverId, ObserverQueue};
use crate::types::{Event, EventTypeRegistry};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Construction-time wiring shared by all managers
///
/// An explicit dispatcher takes precedence over the dispatch config; the
/// exception handler and pool provider then only apply to the config path.
pub struct EventManagerBuilder<A = ()> {
    registry: Option<EventTypeRegistry>,
    aggregator: Option<Arc<dyn ResultAggregator<A>>>,
    handler: Option<Arc<dyn ExceptionHandler>>,
    dispatcher: Option<Arc<dyn Dispatcher<A>>>,
    config: DispatchConfig,
    pools: Option<Arc<dyn WorkerPoolProvider>>,
}

impl<A: Send + 'static> EventManagerBuilder<A> {
    pub fn new() -> Self {
        Self {
            registry: None,
            aggregator: None,
            handler: None,
            dispatcher: None,
            config: DispatchConfig::default(),
            pools: None,
        }
    }

    /// Share an existing type registry instead of creating one
    pub fn with_registry(mut self, registry: EventTypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Reduction applied to the outcomes of each trigger
    pub fn with_aggregator(mut self, aggregator: impl ResultAggregator<A> + 'static) -> Self {
        self.aggregator = Some(Arc::new(aggregator));
        self
    }

    /// Sink for observer failures (default: [`LoggingExceptionHandler`])
    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Use this dispatcher instead of building one from the config
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher<A>>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Pool provider for the parallel mode, overriding `max_workers`
    pub fn with_worker_pool_provider(mut self, pools: Arc<dyn WorkerPoolProvider>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Build a bidirectional manager with a single observer slot
    pub fn build_bidirectional_unicast(self) -> Result<BidirectionalUnicastEventManager<A>> {
        Ok(BidirectionalUnicastEventManager {
            inner: self.compose("bidirectional-unicast")?,
        })
    }

    /// Build a multicast manager
    pub fn build_multicast(self) -> Result<MulticastEventManager<A>> {
        Ok(MulticastEventManager {
            inner: self.compose("multicast")?,
        })
    }

    fn compose(self, topology: &'static str) -> Result<Composition<A>> {
        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => {
                let handler = self
                    .handler
                    .unwrap_or_else(|| Arc::new(LoggingExceptionHandler));
                self.config.build_dispatcher(handler, self.pools)?
            }
        };

        tracing::info!(
            topology,
            dispatcher = dispatcher.name(),
            aggregator = self.aggregator.is_some(),
            "Event manager created"
        );

        Ok(Composition {
            registry: self.registry.unwrap_or_default(),
            queue: ObserverQueue::new(),
            dispatcher,
            aggregator: self.aggregator,
        })
    }
}

impl EventManagerBuilder<()> {
    /// Build a unidirectional manager with a single observer slot
    pub fn build_unicast(self) -> Result<UnicastEventManager> {
        if self.aggregator.is_some() {
            return Err(EventError::Config(
                "a unidirectional unicast manager takes no result aggregator".to_string(),
            ));
        }
        Ok(UnicastEventManager {
            inner: self.compose("unicast")?,
        })
    }
}

impl<A: Send + 'static> Default for EventManagerBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

struct Composition<A> {
    registry: EventTypeRegistry,
    queue: ObserverQueue,
    dispatcher: Arc<dyn Dispatcher<A>>,
    aggregator: Option<Arc<dyn ResultAggregator<A>>>,
}

impl<A: Send + 'static> Composition<A> {
    fn event(&self, event_type: &str, payload: serde_json::Value) -> Event {
        Event::new(self.registry.intern(event_type), payload)
    }

    async fn trigger(&self, event: Event, overall: Option<OverallCallback<A>>) -> Result<()> {
        let event = Arc::new(event);
        let plan = self.queue.snapshot_matching(&event.event_type);
        self.dispatcher
            .dispatch(event, plan, self.aggregator.clone(), overall)
            .await
    }

    async fn trigger_and_wait(&self, event: Event) -> Result<Option<A>> {
        let (tx, rx) = oneshot::channel();
        let overall: OverallCallback<A> = Box::new(move |aggregate| {
            let _ = tx.send(aggregate);
        });
        self.trigger(event, Some(overall)).await?;
        // The callback is dropped unfired when nothing wanted a result.
        Ok(rx.await.ok())
    }
}

/// One observer, fire-and-forget triggers
///
/// The observer is not expected to want a result. If it does, every
/// trigger fails with [`EventError::State`] and the observer is not run.
pub struct UnicastEventManager {
    inner: Composition<()>,
}

impl UnicastEventManager {
    pub fn builder() -> EventManagerBuilder<()> {
        EventManagerBuilder::new()
    }

    /// Install `observer`, replacing any previous one
    pub fn set_observer(&self, observer: ObserverRef) -> ObserverId {
        self.inner.queue.replace(observer)
    }

    /// Remove the observer
    pub fn clear_observer(&self) {
        self.inner.queue.clear();
    }

    pub fn has_observer(&self) -> bool {
        !self.inner.queue.is_empty()
    }

    /// Deliver `event` to the observer, if it matches
    pub async fn trigger(&self, event: Event) -> Result<()> {
        self.inner.trigger(event, None).await
    }

    /// Type registry used by [`event`](Self::event)
    pub fn registry(&self) -> &EventTypeRegistry {
        &self.inner.registry
    }

    /// Build an event of the named type
    pub fn event(&self, event_type: &str, payload: serde_json::Value) -> Event {
        self.inner.event(event_type, payload)
    }

    /// Shut down the underlying dispatcher
    pub async fn shutdown(&self) {
        self.inner.dispatcher.shutdown().await;
    }
}

/// One observer whose result is aggregated and handed to the caller
pub struct BidirectionalUnicastEventManager<A> {
    inner: Composition<A>,
}

impl<A: Send + 'static> BidirectionalUnicastEventManager<A> {
    pub fn builder() -> EventManagerBuilder<A> {
        EventManagerBuilder::new()
    }

    /// Install `observer`, replacing any previous one
    pub fn set_observer(&self, observer: ObserverRef) -> ObserverId {
        self.inner.queue.replace(observer)
    }

    /// Remove the observer
    pub fn clear_observer(&self) {
        self.inner.queue.clear();
    }

    pub fn has_observer(&self) -> bool {
        !self.inner.queue.is_empty()
    }

    /// Deliver `event`; `overall` receives the aggregate
    ///
    /// Fails with [`EventError::State`] before the observer runs when the
    /// observer wants a result and `overall` is `None`.
    pub async fn trigger(&self, event: Event, overall: Option<OverallCallback<A>>) -> Result<()> {
        self.inner.trigger(event, overall).await
    }

    /// Deliver `event` and wait for the aggregate
    ///
    /// `None` when the observer does not want a result or does not match.
    pub async fn trigger_and_wait(&self, event: Event) -> Result<Option<A>> {
        self.inner.trigger_and_wait(event).await
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.inner.registry
    }

    pub fn event(&self, event_type: &str, payload: serde_json::Value) -> Event {
        self.inner.event(event_type, payload)
    }

    pub async fn shutdown(&self) {
        self.inner.dispatcher.shutdown().await;
    }
}

/// Any number of observers; all result-wanting outcomes reduce to one aggregate
pub struct MulticastEventManager<A> {
    inner: Composition<A>,
}

impl<A: Send + 'static> MulticastEventManager<A> {
    pub fn builder() -> EventManagerBuilder<A> {
        EventManagerBuilder::new()
    }

    /// Add `observer`; registering the same observer again is a no-op
    pub fn register_observer(&self, observer: ObserverRef) -> ObserverId {
        self.inner.queue.register(observer)
    }

    /// Remove `observer`, returning whether it was registered
    pub fn unregister_observer(&self, observer: &ObserverRef) -> bool {
        self.inner.queue.unregister(observer)
    }

    /// Remove the observer registered under `id`
    pub fn unregister_id(&self, id: ObserverId) -> bool {
        self.inner.queue.unregister_id(id)
    }

    pub fn is_registered(&self, observer: &ObserverRef) -> bool {
        self.inner.queue.contains(observer)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Remove every observer
    pub fn clear_observers(&self) {
        self.inner.queue.clear();
    }

    /// Deliver `event` to every matching observer; `overall` receives the aggregate
    ///
    /// Fails with [`EventError::State`] before any observer runs when at
    /// least one matching observer wants a result and `overall` is `None`.
    pub async fn trigger(&self, event: Event, overall: Option<OverallCallback<A>>) -> Result<()> {
        self.inner.trigger(event, overall).await
    }

    /// Deliver `event` and wait for the aggregate
    ///
    /// `None` when no matching observer wants a result.
    pub async fn trigger_and_wait(&self, event: Event) -> Result<Option<A>> {
        self.inner.trigger_and_wait(event).await
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.inner.registry
    }

    pub fn event(&self, event_type: &str, payload: serde_json::Value) -> Event {
        self.inner.event(event_type, payload)
    }

    pub async fn shutdown(&self) {
        self.inner.dispatcher.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectValues, CountOutcomes, Outcome, OutcomeCounts};
    use crate::config::DispatchMode;
    use crate::error::ObserverError;
    use crate::handler::MemoryExceptionHandler;
    use crate::observer::{FireOnce, FnObserver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(calls: &Arc<AtomicUsize>) -> ObserverRef {
        let calls = Arc::clone(calls);
        FnObserver::listening("counting", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .arc()
    }

    fn echo(name: &str) -> FnObserver {
        FnObserver::returning(name.to_string(), |event| async move {
            Ok(event.payload.clone())
        })
    }

    #[tokio::test]
    async fn test_unicast_replaces_observer() {
        let manager = UnicastEventManager::builder().build_unicast().unwrap();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        manager.set_observer(counting(&first));
        manager.set_observer(counting(&second));
        assert!(manager.has_observer());

        manager
            .trigger(manager.event("ping", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        manager.clear_observer();
        assert!(!manager.has_observer());
        manager
            .trigger(manager.event("ping", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unicast_rejects_result_wanting_observer() {
        let manager = UnicastEventManager::builder().build_unicast().unwrap();
        manager.set_observer(echo("echo").arc());

        let err = manager
            .trigger(manager.event("ping", serde_json::json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::State(_)));
    }

    #[test]
    fn test_unicast_rejects_aggregator() {
        let result = UnicastEventManager::builder()
            .with_aggregator(|_: Vec<Outcome>| ())
            .build_unicast();
        assert!(matches!(result, Err(EventError::Config(_))));
    }

    #[tokio::test]
    async fn test_bidirectional_unicast_trigger_and_wait() {
        let manager = BidirectionalUnicastEventManager::<Vec<serde_json::Value>>::builder()
            .with_aggregator(CollectValues)
            .build_bidirectional_unicast()
            .unwrap();
        manager.set_observer(echo("echo").arc());

        let values = manager
            .trigger_and_wait(manager.event("ping", serde_json::json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(values, Some(vec![serde_json::json!({"x": 1})]));
    }

    #[tokio::test]
    async fn test_bidirectional_unicast_missing_callback_is_state_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let manager = BidirectionalUnicastEventManager::<Vec<serde_json::Value>>::builder()
            .with_aggregator(CollectValues)
            .build_bidirectional_unicast()
            .unwrap();
        manager.set_observer(
            FnObserver::returning("counted", move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok(serde_json::json!(1)) }
            })
            .arc(),
        );

        let err = manager
            .trigger(manager.event("ping", serde_json::json!({})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::State(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_aggregator_is_config_error() {
        let manager = MulticastEventManager::<Vec<Outcome>>::builder()
            .build_multicast()
            .unwrap();
        manager.register_observer(echo("echo").arc());

        let err = manager
            .trigger_and_wait(manager.event("ping", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Config(_)));
    }

    #[tokio::test]
    async fn test_multicast_filters_by_type() {
        let registry = EventTypeRegistry::new();
        let manager = MulticastEventManager::<OutcomeCounts>::builder()
            .with_registry(registry.clone())
            .with_aggregator(CountOutcomes)
            .build_multicast()
            .unwrap();
        manager.register_observer(echo("any").arc());
        manager.register_observer(echo("orders").for_type(registry.intern("order.created")).arc());

        let counts = manager
            .trigger_and_wait(manager.event("order.created", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(counts, Some(OutcomeCounts { values: 2, failures: 0 }));

        let counts = manager
            .trigger_and_wait(manager.event("user.created", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(counts, Some(OutcomeCounts { values: 1, failures: 0 }));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_multicast_register_is_idempotent() {
        let manager = MulticastEventManager::<OutcomeCounts>::builder()
            .with_aggregator(CountOutcomes)
            .build_multicast()
            .unwrap();
        let observer = echo("echo").arc();

        let id = manager.register_observer(Arc::clone(&observer));
        assert_eq!(manager.register_observer(Arc::clone(&observer)), id);
        assert_eq!(manager.observer_count(), 1);
        assert!(manager.is_registered(&observer));

        assert!(manager.unregister_observer(&observer));
        assert!(!manager.unregister_observer(&observer));
        assert_eq!(manager.observer_count(), 0);

        let id = manager.register_observer(observer);
        assert!(manager.unregister_id(id));
        manager.register_observer(echo("other").arc());
        manager.clear_observers();
        assert_eq!(manager.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_and_wait_without_result_wanting_observers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = MulticastEventManager::<OutcomeCounts>::builder()
            .with_aggregator(CountOutcomes)
            .build_multicast()
            .unwrap();
        manager.register_observer(counting(&calls));

        let aggregate = manager
            .trigger_and_wait(manager.event("ping", serde_json::json!({})))
            .await
            .unwrap();
        assert!(aggregate.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fire_once_sizes_across_triggers() {
        let manager = MulticastEventManager::<OutcomeCounts>::builder()
            .with_aggregator(CountOutcomes)
            .build_multicast()
            .unwrap();
        manager.register_observer(FireOnce::arc(echo("once")));
        manager.register_observer(echo("always").arc());

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let counts = manager
                .trigger_and_wait(manager.event("ping", serde_json::json!({})))
                .await
                .unwrap()
                .unwrap();
            sizes.push(counts.total());
        }
        assert_eq!(sizes, vec![2, 1, 1]);
        assert_eq!(manager.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_builder_wires_handler_and_mode() {
        let handler = Arc::new(MemoryExceptionHandler::default());
        let manager = MulticastEventManager::<OutcomeCounts>::builder()
            .with_aggregator(CountOutcomes)
            .with_exception_handler(handler.clone())
            .with_config(DispatchConfig::new(DispatchMode::Sequential))
            .build_multicast()
            .unwrap();
        manager.register_observer(
            FnObserver::returning("bad", |_| async { Err(ObserverError::failed("nope")) }).arc(),
        );
        manager.register_observer(echo("good").arc());

        let counts = manager
            .trigger_and_wait(manager.event("ping", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(counts, Some(OutcomeCounts { values: 1, failures: 1 }));
        assert_eq!(handler.count(), 1);

        manager.shutdown().await;
        manager.clear_observers();
        let err = manager
            .trigger(manager.event("ping", serde_json::json!({})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Shutdown(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_build() {
        let result = MulticastEventManager::<OutcomeCounts>::builder()
            .with_config(DispatchConfig {
                mode: DispatchMode::Parallel,
                max_workers: Some(0),
                join_timeout_ms: None,
            })
            .build_multicast();
        assert!(matches!(result, Err(EventError::Config(_))));
    }
}
