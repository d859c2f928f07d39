//! Pull-and-publish adapter: source → receive pipeline → channel.

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    switchyard_channels::{Channel, ChannelRegistry},
    switchyard_common::{BusEvent, Error, EventHub, Result},
    tracing::{debug, info, warn},
    url::Url,
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{adapter as adapter_metrics, counter, labels};

use crate::{
    adapter::{AdapterStatus, ChannelAdapter, Direction, Polling, Workers, adapter_error},
    pipeline::Pipeline,
    transport::MessageSource,
    unit_of_work::UnitOfWork,
};

/// Extracts messages from a [`MessageSource`] and publishes them on a
/// channel inside a [`UnitOfWork`].
pub struct InputChannelAdapter {
    inner: Arc<InputInner>,
    workers: tokio::sync::Mutex<Option<Workers>>,
}

struct InputInner {
    name: String,
    uri: Url,
    channel_name: Option<String>,
    channels: Arc<ChannelRegistry>,
    source: Arc<dyn MessageSource>,
    pipeline: Pipeline,
    polling: Polling,
    events: Arc<EventHub>,
    channel: RwLock<Option<Arc<Channel>>>,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Builder for [`InputChannelAdapter`].
pub struct InputAdapterBuilder {
    name: String,
    uri: Url,
    source: Arc<dyn MessageSource>,
    channel_name: Option<String>,
    pipeline: Pipeline,
    polling: Polling,
    events: Option<Arc<EventHub>>,
}

impl InputAdapterBuilder {
    #[must_use]
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channel_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    #[must_use]
    pub fn polling(mut self, polling: Polling) -> Self {
        self.polling = polling;
        self
    }

    /// Share a hub instead of creating one per adapter.
    #[must_use]
    pub fn events(mut self, events: Arc<EventHub>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self, channels: Arc<ChannelRegistry>) -> InputChannelAdapter {
        let events = self
            .events
            .unwrap_or_else(|| EventHub::shared(self.name.clone()));
        InputChannelAdapter {
            inner: Arc::new(InputInner {
                name: self.name,
                uri: self.uri,
                channel_name: self.channel_name,
                channels,
                source: self.source,
                pipeline: self.pipeline,
                polling: self.polling,
                events,
                channel: RwLock::new(None),
                running: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            workers: tokio::sync::Mutex::new(None),
        }
    }
}

impl InputChannelAdapter {
    pub fn builder(
        name: impl Into<String>,
        uri: Url,
        source: Arc<dyn MessageSource>,
    ) -> InputAdapterBuilder {
        InputAdapterBuilder {
            name: name.into(),
            uri,
            source,
            channel_name: None,
            pipeline: Pipeline::new(),
            polling: Polling::default(),
            events: None,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }
}

impl InputInner {
    fn bound_channel(&self) -> Result<Arc<Channel>> {
        if let Some(channel) = self
            .channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            return Ok(Arc::clone(channel));
        }
        let name = self
            .channel_name
            .as_deref()
            .ok_or_else(|| Error::adapter(&self.name, "no channel bound"))?;
        let channel = self.channels.find_or_create(name);
        *self.channel.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn perform_action(&self) -> Result<bool> {
        match self.poll_once().await {
            Ok(published) => Ok(published),
            Err(err) if err.is_cancelled() => {
                debug!(adapter = %self.name, "poll cancelled, waiting for next cycle");
                Ok(false)
            },
            Err(err) => {
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
                #[cfg(feature = "metrics")]
                counter!(
                    adapter_metrics::ERRORS_TOTAL,
                    labels::ADAPTER => self.name.clone(),
                    labels::ERROR_TYPE => format!("{:?}", err.kind())
                )
                .increment(1);
                self.events.raise(&self.name, err).map(|()| false)
            },
        }
    }

    async fn poll_once(&self) -> Result<bool> {
        let channel = self.bound_channel()?;
        let Some(raw) = self
            .source
            .receive()
            .await
            .map_err(|e| adapter_error(&self.name, e))?
        else {
            return Ok(false);
        };

        let envelope = match self.pipeline.execute(raw.to_envelope()).await {
            Ok(envelope) => envelope,
            Err(err) => {
                self.reject(&raw).await;
                return Err(err);
            },
        };
        if envelope.is_empty() {
            debug!(adapter = %self.name, "empty message skipped");
            self.source
                .acknowledge(&raw)
                .await
                .map_err(|e| adapter_error(&self.name, e))?;
            return Ok(false);
        }

        let message_id = envelope.header.message_id().to_string();
        let mut unit = UnitOfWork::begin(&self.name);
        unit.stage(Arc::clone(&channel), envelope);
        if let Err(err) = unit.commit() {
            self.reject(&raw).await;
            return Err(adapter_error(&self.name, err));
        }
        self.source
            .acknowledge(&raw)
            .await
            .map_err(|e| adapter_error(&self.name, e))?;

        debug!(adapter = %self.name, channel = %channel.name(), message_id = %message_id, "message published");
        #[cfg(feature = "metrics")]
        counter!(
            adapter_metrics::MESSAGES_PUBLISHED_TOTAL,
            labels::ADAPTER => self.name.clone(),
            labels::CHANNEL => channel.name().to_string()
        )
        .increment(1);
        self.events.emit(BusEvent::MessagePublished {
            adapter: self.name.clone(),
            channel: channel.name().to_string(),
            message_id,
        });
        Ok(true)
    }

    async fn reject(&self, raw: &crate::transport::RawMessage) {
        if let Err(err) = self.source.reject(raw).await {
            warn!(adapter = %self.name, error = %err, "source failed to reject message");
        }
    }
}

#[async_trait]
impl ChannelAdapter for InputChannelAdapter {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn direction(&self) -> Direction {
        Direction::In
    }

    fn uri(&self) -> &Url {
        &self.inner.uri
    }

    fn channel_name(&self) -> Option<&str> {
        self.inner.channel_name.as_deref()
    }

    fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            name: self.inner.name.clone(),
            direction: Direction::In,
            uri: self.inner.uri.to_string(),
            channel: self.inner.channel_name.clone(),
            running: self.is_running(),
            last_error: self
                .inner
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Ok(());
        }
        let channel = self.inner.bound_channel()?;
        self.inner
            .source
            .on_start()
            .await
            .map_err(|e| adapter_error(&self.inner.name, e))?;

        let inner = Arc::clone(&self.inner);
        *workers = Some(Workers::spawn(&self.inner.name, self.inner.polling, move || {
            let inner = Arc::clone(&inner);
            async move { inner.perform_action().await }
        }));
        self.inner.running.store(true, Ordering::Release);
        info!(
            adapter = %self.inner.name,
            uri = %self.inner.uri,
            channel = %channel.name(),
            source = %self.inner.source.describe(),
            "input adapter started"
        );
        self.inner.events.emit(BusEvent::AdapterStarted {
            adapter: self.inner.name.clone(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(workers) = self.workers.lock().await.take() else {
            return Ok(());
        };
        let outcome = workers.shutdown().await;
        if let Err(err) = self.inner.source.on_stop().await {
            warn!(adapter = %self.inner.name, error = %err, "source stop hook failed");
        }
        self.inner.running.store(false, Ordering::Release);
        info!(adapter = %self.inner.name, "input adapter stopped");
        self.inner.events.emit(BusEvent::AdapterStopped {
            adapter: self.inner.name.clone(),
        });
        outcome
    }

    async fn perform_action(&self) -> Result<bool> {
        self.inner.perform_action().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            pipeline::{stage, utf8_stage},
            schemes::memory::{MemoryBroker, MemorySource},
            transport::RawMessage,
        },
        std::time::Duration,
        switchyard_common::{EventKind, RecordingObserver},
    };

    fn setup(pipeline: Pipeline) -> (Arc<MemoryBroker>, Arc<ChannelRegistry>, InputChannelAdapter) {
        let broker = MemoryBroker::shared();
        let channels = ChannelRegistry::shared();
        let source = Arc::new(MemorySource::new(Arc::clone(&broker), "inbox"));
        let adapter = InputChannelAdapter::builder("orders-in", Url::parse("memory://inbox").unwrap(), source)
            .channel("orders")
            .pipeline(pipeline)
            .polling(Polling::every(Duration::from_millis(100)))
            .build(Arc::clone(&channels));
        (broker, channels, adapter)
    }

    fn upper_pipeline() -> Pipeline {
        Pipeline::new().with_stage(stage("upper", |mut envelope| {
            let text = envelope.body().as_text().unwrap_or_default().to_uppercase();
            envelope.set_payload(text);
            Ok(envelope)
        }))
    }

    #[tokio::test]
    async fn publishes_through_receive_pipeline() {
        let (broker, channels, adapter) = setup(upper_pipeline());
        broker.push("inbox", RawMessage::new("hello"));
        assert!(adapter.perform_action().await.unwrap());
        let orders = channels.get("orders").unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders.try_receive().unwrap().payload::<String>().unwrap(), "HELLO");
        assert_eq!(broker.len("inbox"), 0);
    }

    #[tokio::test]
    async fn idle_source_is_a_no_op() {
        let (_broker, channels, adapter) = setup(Pipeline::new());
        assert!(!adapter.perform_action().await.unwrap());
        assert!(channels.get("orders").unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_requires_channel() {
        let broker = MemoryBroker::shared();
        let source = Arc::new(MemorySource::new(broker, "inbox"));
        let adapter = InputChannelAdapter::builder("unbound", Url::parse("memory://inbox").unwrap(), source)
            .build(ChannelRegistry::shared());
        let err = adapter.start().await.unwrap_err();
        assert!(matches!(err, Error::Adapter { .. }));
        assert!(!adapter.is_running());
    }

    #[tokio::test]
    async fn pipeline_failure_without_observer_propagates() {
        let failing = Pipeline::new().with_stage(stage("reject", |_| Err(Error::message("malformed"))));
        let (broker, channels, adapter) = setup(failing);
        broker.push("inbox", RawMessage::new("hello"));
        let err = adapter.perform_action().await.unwrap_err();
        assert!(matches!(err, Error::Pipeline { .. }));
        assert!(channels.get("orders").unwrap().is_empty());
        assert!(adapter.status().last_error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn pipeline_failure_with_observer_is_handled() {
        let failing = Pipeline::new().with_stage(stage("reject", |_| Err(Error::message("malformed"))));
        let (broker, _channels, adapter) = setup(failing);
        let recorder = RecordingObserver::new("recorder");
        adapter.events().subscribe(recorder.clone());
        broker.push("inbox", RawMessage::new("hello"));
        assert!(!adapter.perform_action().await.unwrap());
        assert_eq!(recorder.errors().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_benign() {
        let cancelled = Pipeline::new().with_stage(stage("cancel", |_| Err(Error::Cancelled)));
        let (broker, _channels, adapter) = setup(cancelled);
        broker.push("inbox", RawMessage::new("hello"));
        assert!(!adapter.perform_action().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_loop_publishes_and_stops() {
        let (broker, channels, adapter) = setup(Pipeline::new().with_stage(utf8_stage()));
        let recorder = RecordingObserver::new("recorder");
        adapter.events().subscribe(recorder.clone());
        broker.push("inbox", RawMessage::new("a"));
        broker.push("inbox", RawMessage::new("b"));

        adapter.start().await.unwrap();
        assert!(adapter.is_running());
        tokio::time::sleep(Duration::from_millis(350)).await;
        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());

        let payloads: Vec<String> = channels
            .get("orders")
            .unwrap()
            .drain()
            .iter()
            .map(|e| e.payload::<String>().unwrap().clone())
            .collect();
        assert_eq!(payloads, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(recorder.events_of(EventKind::AdapterStarted).len(), 1);
        assert_eq!(recorder.events_of(EventKind::MessagePublished).len(), 2);
        assert_eq!(recorder.events_of(EventKind::AdapterStopped).len(), 1);
    }
}
