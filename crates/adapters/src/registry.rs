//! Registry that starts, stops and observes a set of adapters.

use std::sync::{Arc, RwLock};

use {
    switchyard_common::{BusEvent, Error, EventHub, EventKind, EventObserver, ObserverId, Result},
    tracing::{info, warn},
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{adapter as adapter_metrics, gauge};

use crate::adapter::{AdapterStatus, ChannelAdapter, Direction};

const LIFECYCLE: &[EventKind] = &[
    EventKind::AdapterStarted,
    EventKind::AdapterStopped,
    EventKind::MessagePublished,
    EventKind::MessageDelivered,
    EventKind::MessageForwarded,
];

/// Re-emits one adapter's notifications on the registry hub.
///
/// Errors are only claimed while the registry hub itself has an error
/// observer, so an unobserved registry leaves adapter errors unhandled.
struct Forwarder {
    name: String,
    target: Arc<EventHub>,
}

impl EventObserver for Forwarder {
    fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> &[EventKind] {
        if self.target.has_observers(EventKind::Error) {
            EventKind::ALL
        } else {
            LIFECYCLE
        }
    }

    fn on_event(&self, event: &BusEvent) {
        self.target.emit(event.clone());
    }

    fn on_error(&self, source: &str, error: &Error) {
        self.target.notify_error(source, error);
    }
}

struct Entry {
    adapter: Arc<dyn ChannelAdapter>,
    forwarder: ObserverId,
}

/// Starts and stops registered adapters and funnels their notifications into
/// one hub.
pub struct AdapterRegistry {
    adapters: RwLock<Vec<Entry>>,
    events: Arc<EventHub>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(Vec::new()),
            events: EventHub::shared("adapters"),
        }
    }

    /// The hub every registered adapter's notifications are forwarded to.
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Register an adapter. Names must be unique (case-insensitive).
    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        if adapters
            .iter()
            .any(|entry| entry.adapter.name().eq_ignore_ascii_case(adapter.name()))
        {
            return Err(Error::adapter(adapter.name(), "an adapter with this name is already registered"));
        }
        let forwarder = adapter.events().subscribe(Arc::new(Forwarder {
            name: format!("registry:{}", adapter.name()),
            target: Arc::clone(&self.events),
        }));
        adapters.push(Entry { adapter, forwarder });
        Ok(())
    }

    /// Unregister an adapter. It is not stopped.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        let index = adapters
            .iter()
            .position(|entry| entry.adapter.name().eq_ignore_ascii_case(name))?;
        let entry = adapters.remove(index);
        entry.adapter.events().unsubscribe(entry.forwarder);
        Some(entry.adapter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|entry| entry.adapter.name().eq_ignore_ascii_case(name))
            .map(|entry| Arc::clone(&entry.adapter))
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| entry.adapter.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, direction: Option<Direction>) -> Vec<Arc<dyn ChannelAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| direction.is_none_or(|d| entry.adapter.direction() == d))
            .map(|entry| Arc::clone(&entry.adapter))
            .collect()
    }

    pub fn status(&self) -> Vec<AdapterStatus> {
        self.snapshot(None).iter().map(|adapter| adapter.status()).collect()
    }

    /// Start every adapter in registration order. If one fails, the adapters
    /// started so far are stopped again and the failure is returned.
    pub async fn start_all(&self) -> Result<()> {
        self.start_adapters(self.snapshot(None)).await
    }

    /// Start only the adapters moving envelopes in `direction`.
    pub async fn start_direction(&self, direction: Direction) -> Result<()> {
        self.start_adapters(self.snapshot(Some(direction))).await
    }

    async fn start_adapters(&self, adapters: Vec<Arc<dyn ChannelAdapter>>) -> Result<()> {
        let mut started: Vec<Arc<dyn ChannelAdapter>> = Vec::new();
        for adapter in adapters {
            if adapter.is_running() {
                continue;
            }
            if let Err(err) = adapter.start().await {
                warn!(adapter = %adapter.name(), error = %err, rollback = started.len(), "adapter failed to start, rolling back");
                for running in started.iter().rev() {
                    if let Err(stop_err) = running.stop().await {
                        warn!(adapter = %running.name(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(err);
            }
            started.push(adapter);
        }
        self.record_running();
        info!(count = started.len(), "adapters started");
        Ok(())
    }

    /// Stop every adapter, input adapters first. All adapters are stopped even
    /// when some fail; the first failure is returned.
    pub async fn stop_all(&self) -> Result<()> {
        let first = self.stop_direction(Direction::In).await;
        let second = self.stop_direction(Direction::Out).await;
        first.and(second)
    }

    pub async fn stop_direction(&self, direction: Direction) -> Result<()> {
        let mut first_error = None;
        for adapter in self.snapshot(Some(direction)).iter().rev() {
            if let Err(err) = adapter.stop().await {
                warn!(adapter = %adapter.name(), error = %err, "adapter stopped with error");
                first_error.get_or_insert(err);
            }
        }
        self.record_running();
        first_error.map_or(Ok(()), Err)
    }

    fn record_running(&self) {
        #[cfg(feature = "metrics")]
        {
            let running = self
                .snapshot(None)
                .iter()
                .filter(|adapter| adapter.is_running())
                .count();
            gauge!(adapter_metrics::RUNNING).set(running as f64);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            adapter::Polling,
            factory::{AdapterDefinition, AdapterFactories},
            schemes::memory::MemoryBroker,
            transport::RawMessage,
        },
        std::time::Duration,
        switchyard_channels::ChannelRegistry,
        switchyard_common::{JsonCodec, RecordingObserver},
        url::Url,
    };

    struct Fixture {
        channels: Arc<ChannelRegistry>,
        broker: Arc<MemoryBroker>,
        factories: AdapterFactories,
        registry: AdapterRegistry,
    }

    fn fixture() -> Fixture {
        let channels = ChannelRegistry::shared();
        let broker = MemoryBroker::shared();
        let factories = AdapterFactories::with_builtins(
            Arc::clone(&channels),
            Arc::clone(&broker),
            Arc::new(JsonCodec::new()),
        );
        Fixture {
            channels,
            broker,
            factories,
            registry: AdapterRegistry::new(),
        }
    }

    impl Fixture {
        fn add(&self, name: &str, uri: &str, direction: Direction, channel: Option<&str>) {
            let mut definition = AdapterDefinition::new(name, Url::parse(uri).unwrap(), direction)
                .polling(Polling::every(Duration::from_millis(50)));
            if let Some(channel) = channel {
                definition = definition.channel(channel);
            }
            let adapter = self
                .factories
                .build(definition, Arc::clone(&self.channels), None)
                .unwrap();
            self.registry.register(adapter).unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_aggregated() {
        let f = fixture();
        f.add("in", "memory://inbox", Direction::In, Some("orders"));
        f.add("out", "memory://outbox", Direction::Out, Some("orders"));
        let recorder = RecordingObserver::new("recorder");
        f.registry.events().subscribe(recorder.clone());

        f.broker.push("inbox", RawMessage::new("hello"));
        f.registry.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        f.registry.stop_all().await.unwrap();

        assert_eq!(recorder.events_of(EventKind::AdapterStarted).len(), 2);
        assert_eq!(recorder.events_of(EventKind::AdapterStopped).len(), 2);
        assert_eq!(recorder.events_of(EventKind::MessagePublished).len(), 1);
        assert_eq!(recorder.events_of(EventKind::MessageDelivered).len(), 1);
        assert_eq!(f.broker.len("outbox"), 1);
        assert!(f.registry.status().iter().all(|s| !s.running));
    }

    #[tokio::test]
    async fn failed_start_rolls_back() {
        let f = fixture();
        f.add("first", "memory://a", Direction::In, Some("orders"));
        f.add("unbound", "memory://b", Direction::In, None);
        let err = f.registry.start_all().await.unwrap_err();
        assert!(matches!(err, Error::Adapter { .. }));
        assert!(!f.registry.get("first").unwrap().is_running());
    }

    #[test]
    fn duplicate_names_rejected() {
        let f = fixture();
        f.add("in", "memory://a", Direction::In, Some("orders"));
        let dup = f
            .factories
            .build(
                AdapterDefinition::new("IN", Url::parse("memory://b").unwrap(), Direction::In),
                Arc::clone(&f.channels),
                None,
            )
            .unwrap();
        assert!(f.registry.register(dup).is_err());
        assert!(f.registry.unregister("in").is_some());
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn errors_stay_unhandled_without_registry_observer() {
        let f = fixture();
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let unwritable = Url::from_file_path(blocker.join("out")).unwrap();
        f.add("out", unwritable.as_str(), Direction::Out, Some("outbound"));
        let adapter = f.registry.get("out").unwrap();
        f.channels.find_or_create("outbound").send(switchyard_common::Envelope::new("x".to_string())).unwrap();
        assert!(adapter.perform_action().await.is_err());

        let recorder = RecordingObserver::new("recorder");
        f.registry.events().subscribe(recorder.clone());
        f.channels.find_or_create("outbound").send(switchyard_common::Envelope::new("y".to_string())).unwrap();
        assert!(adapter.perform_action().await.is_ok());
        assert_eq!(recorder.errors().len(), 1);
        assert_eq!(recorder.errors()[0].0, "out");
    }
}
