//! Drain-and-deliver adapter: channel → send pipeline → sink, with retry and
//! failure forwarding.

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    chrono::Utc,
    switchyard_channels::{Channel, ChannelRegistry},
    switchyard_common::{BusEvent, Envelope, Error, EventHub, Result},
    tracing::{debug, error, info, trace, warn},
    url::Url,
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{adapter as adapter_metrics, counter, histogram, labels};

use crate::{
    adapter::{AdapterStatus, ChannelAdapter, Direction, Polling, Workers, adapter_error},
    pipeline::Pipeline,
    retry::RetryPolicy,
    transport::MessageSink,
};

/// Drains envelopes from a channel and delivers them to a [`MessageSink`].
///
/// Failed deliveries are retried per the [`RetryPolicy`]. Once retries are
/// exhausted the envelope is forwarded to the failure address (when one is
/// configured) and a [`Error::NonDelivered`] is raised.
pub struct OutputChannelAdapter {
    inner: Arc<OutputInner>,
    workers: tokio::sync::Mutex<Option<Workers>>,
}

struct OutputInner {
    name: String,
    uri: Url,
    channel_name: Option<String>,
    channels: Arc<ChannelRegistry>,
    sink: Arc<dyn MessageSink>,
    pipeline: Pipeline,
    retry: RetryPolicy,
    failure_sink: Option<Arc<dyn MessageSink>>,
    polling: Polling,
    events: Arc<EventHub>,
    channel: RwLock<Option<Arc<Channel>>>,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Builder for [`OutputChannelAdapter`].
pub struct OutputAdapterBuilder {
    name: String,
    uri: Url,
    sink: Arc<dyn MessageSink>,
    channel_name: Option<String>,
    pipeline: Pipeline,
    retry: RetryPolicy,
    failure_sink: Option<Arc<dyn MessageSink>>,
    polling: Polling,
    events: Option<Arc<EventHub>>,
}

impl OutputAdapterBuilder {
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
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sink reached through the retry policy's failure delivery address.
    #[must_use]
    pub fn failure_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn polling(mut self, polling: Polling) -> Self {
        self.polling = polling;
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<EventHub>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self, channels: Arc<ChannelRegistry>) -> OutputChannelAdapter {
        let events = self
            .events
            .unwrap_or_else(|| EventHub::shared(self.name.clone()));
        OutputChannelAdapter {
            inner: Arc::new(OutputInner {
                name: self.name,
                uri: self.uri,
                channel_name: self.channel_name,
                channels,
                sink: self.sink,
                pipeline: self.pipeline,
                retry: self.retry,
                failure_sink: self.failure_sink,
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

impl OutputChannelAdapter {
    pub fn builder(name: impl Into<String>, uri: Url, sink: Arc<dyn MessageSink>) -> OutputAdapterBuilder {
        OutputAdapterBuilder {
            name: name.into(),
            uri,
            sink,
            channel_name: None,
            pipeline: Pipeline::new(),
            retry: RetryPolicy::none(),
            failure_sink: None,
            polling: Polling::default(),
            events: None,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Deliver one envelope directly, bypassing the channel. Failures follow
    /// the callback-or-throw policy.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.inner.send(envelope).await
    }
}

impl OutputInner {
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
        let channel = match self.bound_channel() {
            Ok(channel) => channel,
            Err(err) => return self.fail(err).map(|()| false),
        };
        let Some(envelope) = channel.try_receive_as(Some(&self.name)) else {
            return Ok(false);
        };
        self.send(envelope).await.map(|()| true)
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        match self.deliver(envelope).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => {
                debug!(adapter = %self.name, "delivery cancelled");
                Ok(())
            },
            Err(err) => self.fail(err),
        }
    }

    fn fail(&self, err: Error) -> Result<()> {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
        #[cfg(feature = "metrics")]
        counter!(
            adapter_metrics::ERRORS_TOTAL,
            labels::ADAPTER => self.name.clone(),
            labels::ERROR_TYPE => format!("{:?}", err.kind())
        )
        .increment(1);
        self.events.raise(&self.name, err)
    }

    /// Expiry check, send pipeline, retried delivery, then forwarding on
    /// exhaustion. Never drops an envelope without surfacing it.
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        if envelope.header.is_expired(Utc::now()) {
            return Err(self.undeliverable(envelope, 0, "envelope expired").await);
        }
        let prepared = match self.pipeline.execute(envelope.clone()).await {
            Ok(prepared) => prepared,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => return Err(self.undeliverable(envelope, 0, err).await),
        };

        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let prepared_ref = &prepared;
        let outcome = self
            .retry
            .execute(|attempt| async move {
                trace!(adapter = %self.name, attempt, message_id = prepared_ref.header.message_id(), "delivery attempt");
                #[cfg(feature = "metrics")]
                counter!(adapter_metrics::DELIVERY_ATTEMPTS_TOTAL, labels::ADAPTER => self.name.clone())
                    .increment(1);
                self.deliver_once(prepared_ref).await
            })
            .await;
        #[cfg(feature = "metrics")]
        histogram!(adapter_metrics::DELIVERY_DURATION_SECONDS, labels::ADAPTER => self.name.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(((), attempts)) => {
                debug!(adapter = %self.name, message_id = prepared.header.message_id(), attempts, "message delivered");
                #[cfg(feature = "metrics")]
                counter!(adapter_metrics::MESSAGES_DELIVERED_TOTAL, labels::ADAPTER => self.name.clone())
                    .increment(1);
                self.events.emit(BusEvent::MessageDelivered {
                    adapter: self.name.clone(),
                    message_id: prepared.header.message_id().to_string(),
                    attempts,
                });
                Ok(())
            },
            Err(exhausted) => Err(self
                .undeliverable(prepared, exhausted.attempts, exhausted.last_error)
                .await),
        }
    }

    /// One delivery wrapped in the sink's per-send hooks.
    async fn deliver_once(&self, envelope: &Envelope) -> Result<()> {
        self.sink
            .on_start()
            .await
            .map_err(|e| adapter_error(&self.name, e))?;
        let delivered = self.sink.deliver(envelope).await;
        let stopped = self.sink.on_stop().await;
        delivered.map_err(|e| adapter_error(&self.name, e))?;
        stopped.map_err(|e| adapter_error(&self.name, e))
    }

    /// Forward to the failure address, once, then build the `NonDelivered`.
    async fn undeliverable(
        &self,
        envelope: Envelope,
        attempts: u32,
        reason: impl std::fmt::Display,
    ) -> Error {
        #[cfg(feature = "metrics")]
        counter!(adapter_metrics::NON_DELIVERED_TOTAL, labels::ADAPTER => self.name.clone())
            .increment(1);
        let address = self.retry.failure_delivery_address.as_ref();
        let forwarded_to = match (&self.failure_sink, address) {
            (Some(sink), Some(address)) => match sink.deliver(&envelope).await {
                Ok(()) => {
                    warn!(
                        adapter = %self.name,
                        message_id = envelope.header.message_id(),
                        address = %address,
                        attempts,
                        "undeliverable message forwarded to failure address"
                    );
                    #[cfg(feature = "metrics")]
                    counter!(adapter_metrics::FORWARDED_TOTAL, labels::ADAPTER => self.name.clone())
                        .increment(1);
                    self.events.emit(BusEvent::MessageForwarded {
                        adapter: self.name.clone(),
                        address: address.to_string(),
                        message_id: envelope.header.message_id().to_string(),
                    });
                    Some(address.to_string())
                },
                Err(err) => {
                    error!(
                        adapter = %self.name,
                        message_id = envelope.header.message_id(),
                        address = %address,
                        error = %err,
                        "forwarding to failure address failed"
                    );
                    None
                },
            },
            _ => None,
        };
        Error::non_delivered(envelope, attempts, reason, forwarded_to)
    }
}

#[async_trait]
impl ChannelAdapter for OutputChannelAdapter {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn direction(&self) -> Direction {
        Direction::Out
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
            direction: Direction::Out,
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
            .sink
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
            sink = %self.inner.sink.describe(),
            max_retries = self.inner.retry.max_retries,
            "output adapter started"
        );
        self.inner.events.emit(BusEvent::AdapterStarted {
            adapter: self.inner.name.clone(),
        });
        Ok(())
    }

    /// Stops the loops, then flushes whatever is still queued through the
    /// normal delivery path. Flush failures are logged, not raised.
    async fn stop(&self) -> Result<()> {
        let Some(workers) = self.workers.lock().await.take() else {
            return Ok(());
        };
        let outcome = workers.shutdown().await;

        if let Ok(channel) = self.inner.bound_channel() {
            let mut flushed = 0usize;
            while let Some(envelope) = channel.try_receive_as(Some(&self.inner.name)) {
                match self.inner.deliver(envelope).await {
                    Ok(()) => flushed += 1,
                    Err(err) => {
                        warn!(adapter = %self.inner.name, error = %err, "flush on stop failed");
                    },
                }
            }
            if flushed > 0 {
                debug!(adapter = %self.inner.name, flushed, "flushed remaining messages on stop");
            }
        }

        if let Err(err) = self.inner.sink.on_stop().await {
            warn!(adapter = %self.inner.name, error = %err, "sink stop hook failed");
        }
        self.inner.running.store(false, Ordering::Release);
        info!(adapter = %self.inner.name, "output adapter stopped");
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
            pipeline::stage,
            schemes::memory::{MemoryBroker, MemorySink},
        },
        chrono::Duration as ChronoDuration,
        std::{
            sync::atomic::{AtomicU32, Ordering as AtomicOrdering},
            time::Duration,
        },
        switchyard_common::{EventKind, JsonCodec, RecordingObserver},
    };

    /// Sink that fails until `succeed_on` attempts have been made (0 = never).
    #[derive(Default)]
    struct FlakySink {
        attempts: AtomicU32,
        starts: AtomicU32,
        stops: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl MessageSink for FlakySink {
        fn describe(&self) -> String {
            "flaky".into()
        }

        async fn on_start(&self) -> Result<()> {
            self.starts.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn on_stop(&self) -> Result<()> {
            self.stops.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn deliver(&self, _envelope: &Envelope) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if self.succeed_on != 0 && attempt >= self.succeed_on {
                Ok(())
            } else {
                Err(Error::message("connection refused"))
            }
        }
    }

    struct Fixture {
        channels: Arc<ChannelRegistry>,
        broker: Arc<MemoryBroker>,
        sink: Arc<FlakySink>,
        adapter: OutputChannelAdapter,
    }

    fn fixture(succeed_on: u32, retry: RetryPolicy) -> Fixture {
        let channels = ChannelRegistry::shared();
        let broker = MemoryBroker::shared();
        let sink = Arc::new(FlakySink {
            succeed_on,
            ..FlakySink::default()
        });
        let dead = Arc::new(MemorySink::new(Arc::clone(&broker), "dead", Arc::new(JsonCodec::new())));
        let adapter = OutputChannelAdapter::builder("orders-out", Url::parse("memory://out").unwrap(), sink.clone())
            .channel("outbound")
            .retry(retry)
            .failure_sink(dead)
            .polling(Polling::every(Duration::from_millis(100)))
            .build(Arc::clone(&channels));
        Fixture {
            channels,
            broker,
            sink,
            adapter,
        }
    }

    fn retry_with_dead_letter(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, 1).with_failure_address(Url::parse("memory://dead").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_forward_once_and_raise() {
        let f = fixture(0, retry_with_dead_letter(3));
        f.channels
            .find_or_create("outbound")
            .send(Envelope::new("order-1".to_string()))
            .unwrap();

        let err = f.adapter.perform_action().await.unwrap_err();
        assert_eq!(f.sink.attempts.load(AtomicOrdering::SeqCst), 3);
        match &err {
            Error::NonDelivered {
                attempts,
                forwarded_to,
                ..
            } => {
                assert_eq!(*attempts, 3);
                assert_eq!(forwarded_to.as_deref(), Some("memory://dead"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.broker.len("dead"), 1);
        assert_eq!(
            err.into_envelope().unwrap().payload::<String>().unwrap(),
            "order-1"
        );
    }

    #[tokio::test]
    async fn zero_retries_attempts_once() {
        let f = fixture(0, RetryPolicy::none());
        let err = f.adapter.send(Envelope::new(1u32)).await.unwrap_err();
        assert_eq!(f.sink.attempts.load(AtomicOrdering::SeqCst), 1);
        // No failure address configured, so nothing is forwarded.
        assert!(matches!(err, Error::NonDelivered { forwarded_to: None, .. }));
        assert_eq!(f.broker.len("dead"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_retry_budget() {
        let f = fixture(2, retry_with_dead_letter(3));
        let recorder = RecordingObserver::new("recorder");
        f.adapter.events().subscribe(recorder.clone());
        f.adapter.send(Envelope::new(1u32)).await.unwrap();
        assert_eq!(f.sink.attempts.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(f.broker.len("dead"), 0);
        match &recorder.events_of(EventKind::MessageDelivered)[0] {
            BusEvent::MessageDelivered { attempts, .. } => assert_eq!(*attempts, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_send_hooks_wrap_each_attempt() {
        let f = fixture(1, RetryPolicy::none());
        f.adapter.send(Envelope::new(1u32)).await.unwrap();
        f.adapter.send(Envelope::new(2u32)).await.unwrap();
        assert_eq!(f.sink.starts.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(f.sink.stops.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_delivered_with_observer_is_handled() {
        let f = fixture(0, retry_with_dead_letter(0));
        let recorder = RecordingObserver::new("recorder");
        f.adapter.events().subscribe(recorder.clone());
        f.adapter.send(Envelope::new(1u32)).await.unwrap();
        assert_eq!(recorder.errors().len(), 1);
        assert_eq!(recorder.events_of(EventKind::MessageForwarded).len(), 1);
        assert!(f.adapter.status().last_error.is_some());
    }

    #[tokio::test]
    async fn expired_envelope_is_forwarded_not_delivered() {
        let f = fixture(1, retry_with_dead_letter(3));
        let mut envelope = Envelope::new(1u32);
        envelope.header.expires_on = Some(Utc::now() - ChronoDuration::seconds(5));
        let err = f.adapter.send(envelope).await.unwrap_err();
        assert!(matches!(err, Error::NonDelivered { attempts: 0, .. }));
        assert_eq!(f.sink.attempts.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(f.broker.len("dead"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unencodable_payload_is_not_retried() {
        #[derive(Debug, PartialEq)]
        struct Opaque;

        let broker = MemoryBroker::shared();
        let codec = Arc::new(JsonCodec::new());
        let out = Arc::new(MemorySink::new(Arc::clone(&broker), "out", codec.clone()));
        let dead = Arc::new(MemorySink::new(Arc::clone(&broker), "dead", codec));
        let adapter = OutputChannelAdapter::builder("out", Url::parse("memory://out").unwrap(), out)
            .channel("outbound")
            .retry(retry_with_dead_letter(5))
            .failure_sink(dead)
            .build(ChannelRegistry::shared());

        let started = tokio::time::Instant::now();
        let err = adapter.send(Envelope::new(Opaque)).await.unwrap_err();
        assert!(matches!(err, Error::NonDelivered { attempts: 1, forwarded_to: None, .. }), "{err}");
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(broker.is_empty("out"));
    }

    #[tokio::test]
    async fn send_pipeline_failure_is_not_retried() {
        let channels = ChannelRegistry::shared();
        let sink = Arc::new(FlakySink {
            succeed_on: 1,
            ..FlakySink::default()
        });
        let adapter = OutputChannelAdapter::builder("out", Url::parse("memory://out").unwrap(), sink.clone())
            .channel("outbound")
            .retry(RetryPolicy::new(3, 0))
            .pipeline(Pipeline::new().with_stage(stage("encode", |_| Err(Error::message("bad")))))
            .build(channels);
        let err = adapter.send(Envelope::new(1u32)).await.unwrap_err();
        assert!(matches!(err, Error::NonDelivered { attempts: 0, .. }));
        assert_eq!(sink.attempts.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_remaining_messages() {
        let f = fixture(1, RetryPolicy::none());
        f.adapter.start().await.unwrap();
        let outbound = f.channels.get("outbound").unwrap();
        // Let the first tick pass on an empty channel, then queue work.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for n in 0..3u32 {
            outbound.send(Envelope::new(n)).unwrap();
        }
        f.adapter.stop().await.unwrap();
        assert!(outbound.is_empty());
        assert_eq!(f.sink.attempts.load(AtomicOrdering::SeqCst), 3);
    }
}
