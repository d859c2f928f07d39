//! Timer service: one recurring timer per scheduled item.

use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use {
    chrono::Utc,
    switchyard_channels::ChannelRegistry,
    switchyard_common::{BusEvent, Envelope, Error, EventHub, Result},
    switchyard_dispatch::{HandlerMethod, Parameter},
    tokio::{
        sync::Mutex,
        task::JoinHandle,
        time::{self, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{counter, gauge, histogram, labels, scheduler as scheduler_metrics};

use crate::types::{ItemState, ItemStatus, RunStatus, ScheduledItem, SchedulerStatus};

struct Entry {
    item: ScheduledItem,
    state: ItemState,
}

struct Inner {
    channels: Arc<ChannelRegistry>,
    events: Arc<EventHub>,
    entries: RwLock<Vec<Entry>>,
    running: AtomicBool,
}

struct Timers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Invokes zero-argument handler methods on a fixed period and dispatches
/// their results into channels.
pub struct Scheduler {
    inner: Arc<Inner>,
    timers: Mutex<Option<Timers>>,
}

impl Scheduler {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Self::with_events(channels, Arc::new(EventHub::new("scheduler")))
    }

    pub fn with_events(channels: Arc<ChannelRegistry>, events: Arc<EventHub>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels,
                events,
                entries: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            timers: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Add an item. The method must exist on the endpoint and take no
    /// argument.
    pub fn add(&self, item: ScheduledItem) -> Result<()> {
        if self.is_running() {
            return Err(Error::scheduler(&item.name, "cannot add items while running"));
        }
        if item.frequency.is_zero() {
            return Err(Error::scheduler(&item.name, "frequency must be greater than zero"));
        }
        let Some(method) = item.endpoint.method_named(&item.method) else {
            return Err(Error::scheduler(
                &item.name,
                format!("endpoint {} has no method {}", item.endpoint.name(), item.method),
            ));
        };
        if method.parameter() != Parameter::None {
            return Err(Error::scheduler(
                &item.name,
                format!("method {} must take no argument", item.method),
            ));
        }

        let mut entries = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|entry| entry.item.name.eq_ignore_ascii_case(&item.name)) {
            return Err(Error::scheduler(&item.name, "an item with this name already exists"));
        }
        debug!(item = %item.name, frequency_ms = item.frequency.as_millis() as u64, "scheduled item added");
        entries.push(Entry {
            item,
            state: ItemState::default(),
        });
        Ok(())
    }

    /// Remove an item by name. Returns whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        if self.is_running() {
            return Err(Error::scheduler(name, "cannot remove items while running"));
        }
        let mut entries = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| !entry.item.name.eq_ignore_ascii_case(name));
        Ok(entries.len() != before)
    }

    /// Arm one timer per item.
    pub async fn start(&self) -> Result<()> {
        let mut timers = self.timers.lock().await;
        if timers.is_some() {
            return Ok(());
        }

        let items: Vec<ScheduledItem> = self
            .inner
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| entry.item.clone())
            .collect();

        let cancel = CancellationToken::new();
        let handles = items
            .into_iter()
            .map(|item| {
                let inner = Arc::clone(&self.inner);
                let cancel = cancel.clone();
                tokio::spawn(async move { run_timer(inner, item, cancel).await })
            })
            .collect::<Vec<_>>();

        #[cfg(feature = "metrics")]
        gauge!(scheduler_metrics::ITEMS_SCHEDULED).set(handles.len() as f64);

        info!(items = handles.len(), "scheduler started");
        self.inner.running.store(true, Ordering::SeqCst);
        *timers = Some(Timers { cancel, handles });
        Ok(())
    }

    /// Disarm every timer, let in-flight invocations finish, and drop all
    /// observers.
    pub async fn stop(&self) {
        let Some(timers) = self.timers.lock().await.take() else {
            return;
        };
        timers.cancel.cancel();
        for handle in timers.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler timer task panicked");
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.events.clear();

        #[cfg(feature = "metrics")]
        gauge!(scheduler_metrics::ITEMS_SCHEDULED).set(0.0);

        info!("scheduler stopped");
    }

    /// Run an item immediately, outside its timer. Failures follow the
    /// callback-or-throw rule.
    pub async fn run_now(&self, name: &str) -> Result<Option<Envelope>> {
        let item = self.inner.item(name).ok_or_else(|| Error::scheduler(name, "unknown item"))?;
        match self.inner.execute(&item).await {
            Ok(envelope) => Ok(envelope),
            Err(err) => self.inner.events.raise(&item.name, err).map(|()| None),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let entries = self.inner.entries.read().unwrap_or_else(|e| e.into_inner());
        let items = entries
            .iter()
            .map(|entry| ItemStatus {
                name: entry.item.name.clone(),
                endpoint: entry.item.endpoint.name().to_string(),
                method: entry.item.method.clone(),
                frequency_ms: entry.item.frequency.as_millis() as u64,
                output_channel: Inner::output_for(&entry.item, entry.item.endpoint.method_named(&entry.item.method)),
                state: entry.state.clone(),
            })
            .collect::<Vec<_>>();
        SchedulerStatus {
            running: self.is_running(),
            item_count: items.len(),
            items,
        }
    }
}

async fn run_timer(inner: Arc<Inner>, item: ScheduledItem, cancel: CancellationToken) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        () = time::sleep(item.initial_delay) => {},
    }

    let mut interval = time::interval(item.frequency);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {},
        }
        if let Err(err) = inner.execute(&item).await
            && !inner.events.notify_error(&item.name, &err)
        {
            error!(item = %item.name, error = %err, "scheduled item failed");
        }
    }
    debug!(item = %item.name, "timer disarmed");
}

impl Inner {
    fn item(&self, name: &str) -> Option<ScheduledItem> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|entry| entry.item.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.item.clone())
    }

    fn output_for(item: &ScheduledItem, method: Option<&HandlerMethod>) -> Option<String> {
        item.output_channel
            .as_deref()
            .or_else(|| method.and_then(HandlerMethod::declared_output))
            .or_else(|| item.endpoint.declared_output())
            .map(str::to_string)
    }

    async fn execute(&self, item: &ScheduledItem) -> Result<Option<Envelope>> {
        let method = item
            .endpoint
            .method_named(&item.method)
            .cloned()
            .ok_or_else(|| Error::scheduler(&item.name, format!("method {} is gone", item.method)))?;
        let output = Self::output_for(item, Some(&method));

        let started = Instant::now();
        let outcome = self.invoke(item, &method, output.as_deref()).await;
        let elapsed = started.elapsed();

        #[cfg(feature = "metrics")]
        {
            let success = if outcome.is_ok() { "true" } else { "false" };
            counter!(
                scheduler_metrics::EXECUTIONS_TOTAL,
                labels::ITEM => item.name.clone(),
                labels::SUCCESS => success
            )
            .increment(1);
            histogram!(scheduler_metrics::EXECUTION_DURATION_SECONDS, labels::ITEM => item.name.clone())
                .record(elapsed.as_secs_f64());
            if outcome.is_err() {
                counter!(scheduler_metrics::ERRORS_TOTAL, labels::ITEM => item.name.clone()).increment(1);
            }
        }

        let update_state = |status: RunStatus, error: Option<String>| {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.iter_mut().find(|entry| entry.item.name == item.name) {
                entry.state.last_run = Some(Utc::now());
                entry.state.last_status = Some(status);
                entry.state.last_duration_ms = Some(elapsed.as_millis() as u64);
                entry.state.run_count += 1;
                if error.is_some() {
                    entry.state.error_count += 1;
                    entry.state.last_error = error;
                }
            }
        };

        match outcome {
            Ok(envelope) => {
                update_state(RunStatus::Ok, None);
                info!(
                    item = %item.name,
                    duration_ms = elapsed.as_millis() as u64,
                    produced = envelope.is_some(),
                    "scheduled item completed"
                );
                Ok(envelope)
            },
            Err(err) => {
                update_state(RunStatus::Error, Some(err.to_string()));
                Err(Error::scheduler(&item.name, err))
            },
        }
    }

    async fn invoke(
        &self,
        item: &ScheduledItem,
        method: &HandlerMethod,
        output: Option<&str>,
    ) -> Result<Option<Envelope>> {
        let reply = method.invoke(Envelope::empty()).await?;
        let envelope = reply.map(|payload| {
            let mut envelope = Envelope::from_payload(payload);
            envelope.header.output_channel = output.map(str::to_string);
            envelope
        });

        self.events.emit(BusEvent::ItemCompleted {
            item: item.name.clone(),
            envelope: envelope.clone(),
        });

        if let Some(envelope) = &envelope {
            match output {
                Some(channel) => self.channels.find_or_create(channel).send(envelope.clone())?,
                None => warn!(item = %item.name, "result dropped, no output channel"),
            }
        }
        Ok(envelope)
    }
}
