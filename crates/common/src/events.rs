//! Lifecycle notifications and the callback-or-throw error policy.
//!
//! Every bus component owns (or shares) an [`EventHub`]. Components emit
//! [`BusEvent`]s for lifecycle milestones and hand their failures to
//! [`EventHub::raise`]: when at least one observer subscribes to
//! [`EventKind::Error`] the error counts as handled, is logged at its severity
//! and processing continues. Otherwise `raise` returns the error so the caller
//! propagates it.

use std::{
    fmt,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    serde::Serialize,
    tracing::{debug, error, info, warn},
};

use crate::{
    envelope::Envelope,
    error::{Error, Result, Severity},
};

// ── EventKind ───────────────────────────────────────────────────────────────

/// Notification categories observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    AdapterStarted,
    AdapterStopped,
    MessagePublished,
    MessageDelivered,
    MessageForwarded,
    BeginInvoke,
    EndInvoke,
    StrategyCompleted,
    ItemCompleted,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl EventKind {
    /// All variants, for iteration.
    pub const ALL: &'static [EventKind] = &[
        Self::AdapterStarted,
        Self::AdapterStopped,
        Self::MessagePublished,
        Self::MessageDelivered,
        Self::MessageForwarded,
        Self::BeginInvoke,
        Self::EndInvoke,
        Self::StrategyCompleted,
        Self::ItemCompleted,
        Self::Error,
    ];
}

// ── BusEvent ────────────────────────────────────────────────────────────────

/// Typed notification payloads.
#[derive(Debug, Clone)]
pub enum BusEvent {
    AdapterStarted {
        adapter: String,
    },
    AdapterStopped {
        adapter: String,
    },
    MessagePublished {
        adapter: String,
        channel: String,
        message_id: String,
    },
    MessageDelivered {
        adapter: String,
        message_id: String,
        attempts: u32,
    },
    /// A message that could not be delivered was redirected to the failure
    /// address.
    MessageForwarded {
        adapter: String,
        address: String,
        message_id: String,
    },
    BeginInvoke {
        endpoint: String,
        method: String,
        message_id: String,
    },
    EndInvoke {
        endpoint: String,
        method: String,
        message_id: String,
        result: Option<Envelope>,
    },
    StrategyCompleted {
        strategy: String,
        endpoint: String,
        channel: Option<String>,
        envelope: Option<Envelope>,
    },
    ItemCompleted {
        item: String,
        envelope: Option<Envelope>,
    },
}

impl BusEvent {
    /// Returns the [`EventKind`] variant that matches this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AdapterStarted { .. } => EventKind::AdapterStarted,
            Self::AdapterStopped { .. } => EventKind::AdapterStopped,
            Self::MessagePublished { .. } => EventKind::MessagePublished,
            Self::MessageDelivered { .. } => EventKind::MessageDelivered,
            Self::MessageForwarded { .. } => EventKind::MessageForwarded,
            Self::BeginInvoke { .. } => EventKind::BeginInvoke,
            Self::EndInvoke { .. } => EventKind::EndInvoke,
            Self::StrategyCompleted { .. } => EventKind::StrategyCompleted,
            Self::ItemCompleted { .. } => EventKind::ItemCompleted,
        }
    }
}

// ── EventObserver trait ─────────────────────────────────────────────────────

/// Receives bus notifications. Called synchronously on the emitting task, so
/// implementations should hand heavy work off elsewhere.
pub trait EventObserver: Send + Sync {
    /// A human-readable name for this observer.
    fn name(&self) -> &str;

    /// Which notifications this observer subscribes to.
    fn events(&self) -> &[EventKind] {
        EventKind::ALL
    }

    /// Priority for ordering. Higher values run first. Default is 0.
    fn priority(&self) -> i32 {
        0
    }

    fn on_event(&self, _event: &BusEvent) {}

    /// Called for every raised error when subscribed to [`EventKind::Error`].
    fn on_error(&self, _source: &str, _error: &Error) {}
}

// ── ObserverStats ───────────────────────────────────────────────────────────

/// Per-observer delivery counters.
#[derive(Debug, Default)]
pub struct ObserverStats {
    pub events_delivered: AtomicU64,
    pub errors_delivered: AtomicU64,
}

impl ObserverStats {
    pub fn events(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_delivered.load(Ordering::Relaxed)
    }
}

/// Handle returned by [`EventHub::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct ObserverEntry {
    id: ObserverId,
    observer: Arc<dyn EventObserver>,
    stats: Arc<ObserverStats>,
}

// ── EventHub ────────────────────────────────────────────────────────────────

/// Observer registry and dispatcher for bus notifications.
pub struct EventHub {
    name: String,
    observers: RwLock<Vec<ObserverEntry>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("name", &self.name)
            .field("observers", &self.observer_names())
            .finish()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new("bus")
    }
}

impl EventHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an observer. Observers are kept sorted by priority
    /// (descending).
    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = observer.name().to_string();
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.push(ObserverEntry {
            id,
            observer,
            stats: Arc::new(ObserverStats::default()),
        });
        observers.sort_by_key(|entry| std::cmp::Reverse(entry.observer.priority()));
        debug!(hub = %self.name, observer = %name, "observer subscribed");
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|entry| entry.id != id);
        before != observers.len()
    }

    /// Drop every observer. Used by components on stop.
    pub fn clear(&self) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Returns true if any observer subscribes to `kind`.
    pub fn has_observers(&self, kind: EventKind) -> bool {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|entry| entry.observer.events().contains(&kind))
    }

    pub fn observer_names(&self) -> Vec<String> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| entry.observer.name().to_string())
            .collect()
    }

    pub fn observer_stats(&self, name: &str) -> Option<Arc<ObserverStats>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|entry| entry.observer.name() == name)
            .map(|entry| Arc::clone(&entry.stats))
    }

    fn subscribers(&self, kind: EventKind) -> Vec<(Arc<dyn EventObserver>, Arc<ObserverStats>)> {
        // Snapshot so observers may (un)subscribe from inside a callback.
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| entry.observer.events().contains(&kind))
            .map(|entry| (Arc::clone(&entry.observer), Arc::clone(&entry.stats)))
            .collect()
    }

    /// Deliver a notification to all subscribed observers.
    pub fn emit(&self, event: BusEvent) {
        let kind = event.kind();
        let subscribers = self.subscribers(kind);
        if subscribers.is_empty() {
            return;
        }
        debug!(hub = %self.name, event = %kind, count = subscribers.len(), "dispatching bus event");
        for (observer, stats) in subscribers {
            observer.on_event(&event);
            stats.events_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Callback-or-throw: hand `error` to the error observers and return
    /// `Ok(())`, or return it unchanged when nobody listens.
    pub fn raise(&self, source: &str, error: Error) -> Result<()> {
        if self.notify_error(source, &error) {
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Deliver `error` to the error observers. Returns false when there are
    /// none, leaving the caller responsible for the error.
    pub fn notify_error(&self, source: &str, error: &Error) -> bool {
        let subscribers = self.subscribers(EventKind::Error);
        if subscribers.is_empty() {
            return false;
        }
        log_handled(source, error);
        for (observer, stats) in subscribers {
            observer.on_error(source, error);
            stats.errors_delivered.fetch_add(1, Ordering::Relaxed);
        }
        true
    }
}

/// Log a handled error at the level matching its severity.
pub fn log_handled(source: &str, error: &Error) {
    let kind = error.kind();
    match error.severity() {
        Severity::Debug => debug!(source, ?kind, error = %error, "handled bus error"),
        Severity::Info => info!(source, ?kind, error = %error, "handled bus error"),
        Severity::Warn => warn!(source, ?kind, error = %error, "handled bus error"),
        Severity::Error => error!(source, ?kind, error = %error, "handled bus error"),
        Severity::Fatal => error!(source, ?kind, fatal = true, error = %error, "handled bus error"),
    }
}

// ── RecordingObserver ───────────────────────────────────────────────────────

/// Observer that keeps everything it sees. Handy for tests and diagnostics.
#[derive(Default)]
pub struct RecordingObserver {
    name: String,
    events: std::sync::Mutex<Vec<BusEvent>>,
    errors: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingObserver {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events_of(&self, kind: EventKind) -> Vec<BusEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }

    /// `(source, message)` pairs of every error seen.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventObserver for RecordingObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &BusEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }

    fn on_error(&self, source: &str, error: &Error) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((source.to_string(), error.to_string()));
    }
}
