//! Endpoint activation: deliver envelopes from an input channel to an
//! endpoint method and forward the reply.

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use {
    chrono::Utc,
    serde::{Deserialize, Serialize},
    switchyard_channels::{Channel, ChannelEvent, ChannelEventKind, ChannelRegistry},
    switchyard_common::{BusEvent, Envelope, Error, EventHub, Result},
    tokio::{sync::broadcast, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, trace, warn},
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{counter, endpoint as endpoint_metrics, histogram, labels};

use crate::{
    endpoint::{Endpoint, InstanceResolver},
    handler::HandlerMethod,
    strategy::StrategyContext,
};

/// Which channel notifications trigger an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStyle {
    /// Consume envelopes as they are sent.
    #[default]
    OnSend,
    /// Observe envelopes other consumers receive, without consuming.
    OnReceive,
    /// Both of the above. The activator's own receipts are not observed.
    Both,
}

impl ActivationStyle {
    fn consumes(self) -> bool {
        matches!(self, Self::OnSend | Self::Both)
    }

    fn observes(self) -> bool {
        matches!(self, Self::OnReceive | Self::Both)
    }
}

/// The endpoint a binding delivers to.
#[derive(Debug, Clone)]
pub enum EndpointTarget {
    Instance(Arc<Endpoint>),
    /// Resolved through the [`InstanceResolver`] on first use.
    TypeKey(String),
}

/// Registration of one endpoint on one input channel.
#[derive(Debug, Clone)]
pub struct EndpointBinding {
    pub input_channel: String,
    pub output_channel: Option<String>,
    pub target: EndpointTarget,
    pub method: Option<String>,
    pub style: ActivationStyle,
}

impl EndpointBinding {
    pub fn new(input_channel: impl Into<String>, endpoint: Arc<Endpoint>) -> Self {
        Self::with_target(input_channel, EndpointTarget::Instance(endpoint))
    }

    /// Bind a type key; the instance is looked up when the first envelope
    /// arrives.
    pub fn deferred(input_channel: impl Into<String>, type_key: impl Into<String>) -> Self {
        Self::with_target(input_channel, EndpointTarget::TypeKey(type_key.into()))
    }

    fn with_target(input_channel: impl Into<String>, target: EndpointTarget) -> Self {
        Self {
            input_channel: input_channel.into(),
            output_channel: None,
            target,
            method: None,
            style: ActivationStyle::default(),
        }
    }

    #[must_use]
    pub fn output_channel(mut self, channel: impl Into<String>) -> Self {
        self.output_channel = Some(channel.into());
        self
    }

    /// Always invoke `method` instead of matching on the payload type.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn style(mut self, style: ActivationStyle) -> Self {
        self.style = style;
        self
    }

    fn target_name(&self) -> &str {
        match &self.target {
            EndpointTarget::Instance(endpoint) => endpoint.name(),
            EndpointTarget::TypeKey(key) => key,
        }
    }
}

/// Keep the kinds callers distinguish, wrap everything else.
fn activation_error(endpoint: &str, err: Error) -> Error {
    match err {
        Error::Activation { .. } | Error::Strategy { .. } | Error::Unroutable { .. } | Error::Cancelled => err,
        other => Error::activation(endpoint, other),
    }
}

// ── Activator ───────────────────────────────────────────────────────────────

/// Runs one consumer task that activates an endpoint for envelopes arriving
/// on the bound input channel.
pub struct EndpointActivator {
    inner: Arc<ActivatorInner>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

struct ActivatorInner {
    name: String,
    consumer: String,
    binding: EndpointBinding,
    channels: Arc<ChannelRegistry>,
    resolver: Option<Arc<dyn InstanceResolver>>,
    events: Arc<EventHub>,
    resolved: RwLock<Option<Arc<Endpoint>>>,
    running: AtomicBool,
    invocations: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Builder for [`EndpointActivator`].
pub struct ActivatorBuilder {
    binding: EndpointBinding,
    resolver: Option<Arc<dyn InstanceResolver>>,
    events: Option<Arc<EventHub>>,
}

impl ActivatorBuilder {
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn InstanceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<EventHub>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self, channels: Arc<ChannelRegistry>) -> EndpointActivator {
        let name = format!("{}@{}", self.binding.target_name(), self.binding.input_channel);
        let events = self
            .events
            .unwrap_or_else(|| EventHub::shared(name.clone()));
        EndpointActivator {
            inner: Arc::new(ActivatorInner {
                consumer: format!("activator:{}", uuid::Uuid::new_v4()),
                name,
                binding: self.binding,
                channels,
                resolver: self.resolver,
                events,
                resolved: RwLock::new(None),
                running: AtomicBool::new(false),
                invocations: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            worker: tokio::sync::Mutex::new(None),
        }
    }
}

impl ActivatorInner {
    fn endpoint(&self) -> Result<Arc<Endpoint>> {
        let key = match &self.binding.target {
            EndpointTarget::Instance(endpoint) => return Ok(Arc::clone(endpoint)),
            EndpointTarget::TypeKey(key) => key,
        };
        if let Some(endpoint) = self.resolved.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Ok(Arc::clone(endpoint));
        }
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| Error::activation(&self.name, format!("no resolver for type key '{key}'")))?;
        let endpoint = resolver.resolve(key)?;
        debug!(activator = %self.name, type_key = %key, "endpoint resolved");
        *self.resolved.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// The binding's output channel, else the method's, else the endpoint's.
    fn output_channel(&self, endpoint: &Endpoint, method: &HandlerMethod) -> Option<String> {
        self.binding
            .output_channel
            .as_deref()
            .or(method.declared_output())
            .or(endpoint.declared_output())
            .map(str::to_string)
    }

    async fn activate(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        match self.invoke(envelope).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
                #[cfg(feature = "metrics")]
                counter!(
                    endpoint_metrics::ERRORS_TOTAL,
                    labels::ENDPOINT => self.name.clone(),
                    labels::ERROR_TYPE => format!("{:?}", err.kind())
                )
                .increment(1);
                self.events.raise(&self.name, err).map(|()| None)
            },
        }
    }

    async fn invoke(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        let message_id = envelope.header.message_id().to_string();
        if envelope.header.is_expired(Utc::now()) {
            warn!(
                activator = %self.name,
                message_id = %message_id,
                expires_on = ?envelope.header.expires_on,
                "skipping expired envelope"
            );
            #[cfg(feature = "metrics")]
            counter!(endpoint_metrics::EXPIRED_TOTAL, labels::ENDPOINT => self.name.clone()).increment(1);
            return Ok(None);
        }

        let endpoint = self.endpoint()?;
        let method = endpoint
            .resolve(self.binding.method.as_deref(), envelope.body())?
            .clone();
        let output = self.output_channel(&endpoint, &method);

        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.events.emit(BusEvent::BeginInvoke {
            endpoint: endpoint.name().to_string(),
            method: method.name().to_string(),
            message_id: message_id.clone(),
        });

        if let Some(strategy) = method.handling_strategy().cloned() {
            trace!(activator = %self.name, strategy = %strategy.kind(), "delegating to strategy");
            let context = StrategyContext {
                endpoint: Arc::clone(&endpoint),
                method,
                channels: Arc::clone(&self.channels),
                output_channel: output,
                events: Arc::clone(&self.events),
            };
            strategy.handle(&context, envelope).await?;
            return Ok(None);
        }

        let started = Instant::now();
        let outcome = method.invoke(envelope.clone()).await;
        let elapsed = started.elapsed();

        #[cfg(feature = "metrics")]
        {
            counter!(
                endpoint_metrics::INVOCATIONS_TOTAL,
                labels::ENDPOINT => endpoint.name().to_string(),
                labels::METHOD => method.name().to_string(),
                labels::SUCCESS => outcome.is_ok().to_string()
            )
            .increment(1);
            histogram!(
                endpoint_metrics::INVOCATION_DURATION_SECONDS,
                labels::ENDPOINT => endpoint.name().to_string()
            )
            .record(elapsed.as_secs_f64());
        }

        let reply = outcome.map_err(|err| activation_error(endpoint.name(), err))?;
        let destination = output.or_else(|| envelope.header.return_address.clone());
        let result = reply.map(|body| {
            let mut result = envelope.correlated(body);
            result.header.output_channel = destination.clone();
            result
        });

        debug!(
            activator = %self.name,
            method = %method.name(),
            message_id = %message_id,
            elapsed_ms = elapsed.as_millis() as u64,
            replied = result.is_some(),
            "endpoint invoked"
        );
        self.events.emit(BusEvent::EndInvoke {
            endpoint: endpoint.name().to_string(),
            method: method.name().to_string(),
            message_id,
            result: result.clone(),
        });

        if let Some(result) = &result {
            match &destination {
                Some(channel) => self.channels.find_or_create(channel).send(result.clone())?,
                None => debug!(activator = %self.name, "reply has no output channel or return address"),
            }
        }
        Ok(result)
    }
}

/// Next envelope some other consumer took off the channel.
async fn next_receipt(receiver: &mut Option<broadcast::Receiver<ChannelEvent>>, own: &str) -> Option<Envelope> {
    let Some(receiver) = receiver.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(event) if event.kind == ChannelEventKind::Received && event.consumer.as_deref() != Some(own) => {
                return Some(event.envelope);
            },
            Ok(_) => {},
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "activator lagged behind channel notifications");
            },
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn consume(
    inner: Arc<ActivatorInner>,
    channel: Arc<Channel>,
    mut receipts: Option<broadcast::Receiver<ChannelEvent>>,
    cancel: CancellationToken,
) -> Result<()> {
    let consumes = inner.binding.style.consumes();
    loop {
        let envelope = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(activator = %inner.name, "consumer cancelled");
                return Ok(());
            },
            received = channel.receive_as(Some(&inner.consumer)), if consumes => match received {
                Some(envelope) => envelope,
                None => {
                    debug!(activator = %inner.name, "input channel closed");
                    return Ok(());
                },
            },
            observed = next_receipt(&mut receipts, &inner.consumer) => match observed {
                Some(envelope) => envelope,
                None => return Ok(()),
            },
        };
        if let Err(err) = inner.activate(envelope).await {
            error!(activator = %inner.name, error = %err, "activator stopped by unhandled error");
            return Err(err);
        }
    }
}

impl EndpointActivator {
    pub fn builder(binding: EndpointBinding) -> ActivatorBuilder {
        ActivatorBuilder {
            binding,
            resolver: None,
            events: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn binding(&self) -> &EndpointBinding {
        &self.inner.binding
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.inner.events
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn invocations(&self) -> u64 {
        self.inner.invocations.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Activate the endpoint for one envelope, outside the consumer task.
    ///
    /// Returns the reply envelope, if the method produced one. Errors go to
    /// the error observers and come back as `Err` only when there are none.
    pub async fn activate(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        self.inner.activate(envelope).await
    }

    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        let channel = self.inner.channels.find_or_create(&self.inner.binding.input_channel);
        // Subscribe before spawning so no receipt after start() is missed.
        let receipts = self.inner.binding.style.observes().then(|| channel.subscribe());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consume(
            Arc::clone(&self.inner),
            Arc::clone(&channel),
            receipts,
            cancel.clone(),
        ));
        *worker = Some(Worker { cancel, handle });
        self.inner.running.store(true, Ordering::Release);
        info!(
            activator = %self.inner.name,
            channel = %channel.name(),
            style = ?self.inner.binding.style,
            "endpoint activator started"
        );
        Ok(())
    }

    /// Stop the consumer task after any in-flight activation. Returns the
    /// error that ended the task, if one did.
    pub async fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };
        worker.cancel.cancel();
        let outcome = match worker.handle.await {
            Ok(outcome) => outcome,
            Err(join) => Err(Error::activation(&self.inner.name, format!("consumer task failed: {join}"))),
        };
        self.inner.running.store(false, Ordering::Release);
        info!(activator = %self.inner.name, "endpoint activator stopped");
        outcome
    }
}
