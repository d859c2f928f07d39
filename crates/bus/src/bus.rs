//! The bus facade: channels, adapters, activators and the scheduler owned by
//! one object, built from configuration plus code registrations.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    serde::Serialize,
    switchyard_adapters::{
        AdapterDefinition, AdapterFactories, AdapterRegistry, AdapterStatus, Direction, MemoryBroker,
        MessageSink, MessageSource, PipelineStage, Polling, RetryPolicy, StageRegistry,
    },
    switchyard_channels::{Channel, ChannelRegistry, ChannelStats},
    switchyard_common::{Envelope, Error, EventHub, EventObserver, JsonCodec, PayloadCodec, Result},
    switchyard_config::{
        ActivatorConfig, ActivatorStyle, AdapterConfig, AdapterDirection, BusConfig, PollingConfig,
        ScheduledItemConfig, Severity, check_config,
    },
    switchyard_dispatch::{
        ActivationStyle, Endpoint, EndpointActivator, EndpointBinding, EndpointRegistry, InstanceResolver,
    },
    switchyard_scheduler::{ScheduledItem, Scheduler, SchedulerStatus},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
    url::Url,
};

type FactoryHook = Box<dyn FnOnce(&mut AdapterFactories) + Send>;

// ── Builder ─────────────────────────────────────────────────────────────────

/// Collects configuration and registrations, then wires a [`Bus`].
pub struct BusBuilder {
    config: BusConfig,
    channels: Arc<ChannelRegistry>,
    broker: Arc<MemoryBroker>,
    codec: Arc<dyn PayloadCodec>,
    endpoints: Arc<EndpointRegistry>,
    stages: StageRegistry,
    factory_hooks: Vec<FactoryHook>,
    adapters: Vec<AdapterDefinition>,
    bindings: Vec<EndpointBinding>,
    items: Vec<ScheduledItem>,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl BusBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            channels: ChannelRegistry::shared(),
            broker: MemoryBroker::shared(),
            codec: Arc::new(JsonCodec::new()),
            endpoints: EndpointRegistry::shared(),
            stages: StageRegistry::with_builtins(),
            factory_hooks: Vec::new(),
            adapters: Vec::new(),
            bindings: Vec::new(),
            items: Vec::new(),
        }
    }

    /// The registry endpoints resolve from, for registering instances whose
    /// handle the caller wants to keep.
    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    /// The memory broker behind `memory://` adapters.
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Codec used by adapters that write payloads out.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn endpoint(self, endpoint: Endpoint) -> Self {
        self.endpoints.register(endpoint);
        self
    }

    #[must_use]
    pub fn endpoint_factory<F>(self, type_key: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Endpoint> + Send + Sync + 'static,
    {
        self.endpoints.register_factory(type_key, factory);
        self
    }

    /// Make a pipeline stage available to configured adapters by name.
    #[must_use]
    pub fn stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.register(stage);
        self
    }

    #[must_use]
    pub fn source_factory<F>(mut self, scheme: &str, factory: F) -> Self
    where
        F: Fn(&Url) -> Result<Arc<dyn MessageSource>> + Send + Sync + 'static,
    {
        let scheme = scheme.to_string();
        self.factory_hooks
            .push(Box::new(move |factories| factories.register_source(&scheme, factory)));
        self
    }

    #[must_use]
    pub fn sink_factory<F>(mut self, scheme: &str, factory: F) -> Self
    where
        F: Fn(&Url) -> Result<Arc<dyn MessageSink>> + Send + Sync + 'static,
    {
        let scheme = scheme.to_string();
        self.factory_hooks
            .push(Box::new(move |factories| factories.register_sink(&scheme, factory)));
        self
    }

    #[must_use]
    pub fn adapter(mut self, definition: AdapterDefinition) -> Self {
        self.adapters.push(definition);
        self
    }

    #[must_use]
    pub fn activator(mut self, binding: EndpointBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    #[must_use]
    pub fn scheduled(mut self, item: ScheduledItem) -> Self {
        self.items.push(item);
        self
    }

    /// Validate the configuration and build every component. Nothing is
    /// started.
    pub fn build(self) -> Result<Bus> {
        let mut errors = Vec::new();
        for diagnostic in check_config(&self.config) {
            match diagnostic.severity {
                Severity::Error => errors.push(diagnostic.to_string()),
                Severity::Warning => warn!(%diagnostic, "configuration warning"),
                Severity::Info => debug!(%diagnostic, "configuration note"),
            }
        }
        if !errors.is_empty() {
            return Err(Error::message(format!("invalid configuration: {}", errors.join("; "))));
        }

        for name in &self.config.channels {
            self.channels.find_or_create(name);
        }

        let mut factories = AdapterFactories::with_builtins(
            Arc::clone(&self.channels),
            Arc::clone(&self.broker),
            Arc::clone(&self.codec),
        );
        for hook in self.factory_hooks {
            hook(&mut factories);
        }

        let adapters = AdapterRegistry::new();
        let configured = self
            .config
            .adapters
            .iter()
            .map(|config| adapter_definition(config, &self.stages))
            .collect::<Result<Vec<_>>>()?;
        for definition in configured.into_iter().chain(self.adapters) {
            let adapter = factories.build(definition, Arc::clone(&self.channels), None)?;
            adapters.register(adapter)?;
        }

        let events = EventHub::shared("bus");
        let resolver: Arc<dyn InstanceResolver> = Arc::clone(&self.endpoints) as Arc<dyn InstanceResolver>;
        let activators = self
            .config
            .activators
            .iter()
            .map(binding)
            .chain(self.bindings)
            .map(|binding| {
                EndpointActivator::builder(binding)
                    .resolver(Arc::clone(&resolver))
                    .events(Arc::clone(&events))
                    .build(Arc::clone(&self.channels))
            })
            .collect::<Vec<_>>();

        let scheduler = Scheduler::new(Arc::clone(&self.channels));
        let initial_delay = Duration::from_millis(self.config.scheduler.initial_delay_ms);
        for config in &self.config.scheduler.items {
            scheduler.add(scheduled_item(config, self.endpoints.as_ref(), initial_delay)?)?;
        }
        for item in self.items {
            scheduler.add(item)?;
        }

        info!(
            channels = self.channels.list().len(),
            adapters = adapters.len(),
            activators = activators.len(),
            items = scheduler.status().item_count,
            "bus built"
        );

        Ok(Bus {
            config: self.config,
            channels: self.channels,
            broker: self.broker,
            endpoints: self.endpoints,
            adapters,
            activators,
            scheduler,
            events,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        })
    }
}

fn seconds(value: Option<u64>) -> Duration {
    Duration::from_secs(value.unwrap_or(PollingConfig::DEFAULT_SECS))
}

fn polling(config: &PollingConfig) -> Polling {
    match config.concurrency {
        Some(concurrency) => Polling::Concurrent {
            concurrency,
            frequency: seconds(config.frequency_secs),
        },
        None => Polling::every(seconds(config.interval_secs)),
    }
}

fn adapter_definition(config: &AdapterConfig, stages: &StageRegistry) -> Result<AdapterDefinition> {
    let parse = |value: &str| {
        Url::parse(value).map_err(|e| Error::adapter(&config.name, format!("invalid uri {value}: {e}")))
    };
    let direction = match config.direction {
        AdapterDirection::In => Direction::In,
        AdapterDirection::Out => Direction::Out,
    };
    let retry = RetryPolicy {
        max_retries: config.retry.max_retries,
        wait_interval_secs: config.retry.wait_interval_secs,
        failure_delivery_address: config
            .retry
            .failure_delivery_address
            .as_deref()
            .map(&parse)
            .transpose()?,
    };

    let mut definition = AdapterDefinition::new(&config.name, parse(&config.uri)?, direction)
        .polling(polling(&config.polling))
        .retry(retry)
        .pipeline(stages.build(&config.pipeline)?);
    if let Some(channel) = &config.channel {
        definition = definition.channel(channel);
    }
    Ok(definition)
}

fn binding(config: &ActivatorConfig) -> EndpointBinding {
    let style = match config.style {
        ActivatorStyle::OnSend => ActivationStyle::OnSend,
        ActivatorStyle::OnReceive => ActivationStyle::OnReceive,
        ActivatorStyle::Both => ActivationStyle::Both,
    };
    let mut binding = EndpointBinding::deferred(&config.input_channel, &config.endpoint).style(style);
    if let Some(method) = &config.method {
        binding = binding.method(method);
    }
    if let Some(output) = &config.output_channel {
        binding = binding.output_channel(output);
    }
    binding
}

fn scheduled_item(
    config: &ScheduledItemConfig,
    endpoints: &dyn InstanceResolver,
    initial_delay: Duration,
) -> Result<ScheduledItem> {
    let endpoint = endpoints.resolve(&config.endpoint)?;
    let mut item = ScheduledItem::new(endpoint, &config.method, Duration::from_secs(config.frequency_secs))
        .initial_delay(initial_delay);
    if let Some(name) = &config.name {
        item = item.named(name);
    }
    if let Some(output) = &config.output_channel {
        item = item.output_channel(output);
    }
    Ok(item)
}

// ── Bus ─────────────────────────────────────────────────────────────────────

/// Point-in-time counters for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    #[serde(flatten)]
    pub stats: ChannelStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivatorStatus {
    pub name: String,
    pub input_channel: String,
    pub running: bool,
    pub invocations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    pub running: bool,
    pub channels: Vec<ChannelStatus>,
    pub adapters: Vec<AdapterStatus>,
    pub activators: Vec<ActivatorStatus>,
    pub scheduler: SchedulerStatus,
}

/// A process-local message bus.
///
/// Components keep their own notification hubs: adapters report through
/// [`Bus::adapter_events`], activators through [`Bus::events`] and scheduled
/// items through [`Bus::scheduler_events`]. [`Bus::subscribe`] attaches one
/// observer to all three.
pub struct Bus {
    config: BusConfig,
    channels: Arc<ChannelRegistry>,
    broker: Arc<MemoryBroker>,
    endpoints: Arc<EndpointRegistry>,
    adapters: AdapterRegistry,
    activators: Vec<EndpointActivator>,
    scheduler: Scheduler,
    events: Arc<EventHub>,
    running: AtomicBool,
    lifecycle: Mutex<()>,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    /// A builder preloaded with `config`. Add code registrations, then call
    /// [`BusBuilder::build`].
    pub fn from_config(config: BusConfig) -> BusBuilder {
        BusBuilder::new(config)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Find or create a channel.
    pub fn channel(&self, name: &str) -> Arc<Channel> {
        self.channels.find_or_create(name)
    }

    /// Send an envelope into a channel.
    pub fn send(&self, channel: &str, envelope: Envelope) -> Result<()> {
        self.channel(channel).send(envelope)
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn activators(&self) -> &[EndpointActivator] {
        &self.activators
    }

    pub fn activator(&self, name: &str) -> Option<&EndpointActivator> {
        self.activators
            .iter()
            .find(|activator| activator.name().eq_ignore_ascii_case(name))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn adapter_events(&self) -> &Arc<EventHub> {
        self.adapters.events()
    }

    pub fn scheduler_events(&self) -> &Arc<EventHub> {
        self.scheduler.events()
    }

    /// Attach `observer` to the activator, adapter and scheduler hubs.
    ///
    /// Stopping the bus drops the scheduler's observers, so subscribe again
    /// after a restart.
    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) {
        self.events.subscribe(Arc::clone(&observer));
        self.adapter_events().subscribe(Arc::clone(&observer));
        self.scheduler_events().subscribe(observer);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start output adapters, then activators, then input adapters, then the
    /// scheduler. A failure stops whatever already started.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        if let Err(err) = self.start_components().await {
            warn!(error = %err, "bus failed to start, stopping started components");
            if let Err(stop_err) = self.stop_components().await {
                warn!(error = %stop_err, "rollback stop failed");
            }
            return Err(err);
        }
        self.running.store(true, Ordering::SeqCst);
        info!(
            adapters = self.adapters.len(),
            activators = self.activators.len(),
            "bus started"
        );
        Ok(())
    }

    async fn start_components(&self) -> Result<()> {
        self.adapters.start_direction(Direction::Out).await?;
        for activator in &self.activators {
            activator.start().await?;
        }
        self.adapters.start_direction(Direction::In).await?;
        if self.config.scheduler.enabled {
            self.scheduler.start().await?;
        }
        Ok(())
    }

    /// Stop the scheduler and input adapters, then activators, then output
    /// adapters, which flush what is still queued. Every component is stopped
    /// even when some fail; the first failure is returned.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        let outcome = self.stop_components().await;
        self.running.store(false, Ordering::SeqCst);
        info!("bus stopped");
        outcome
    }

    async fn stop_components(&self) -> Result<()> {
        self.scheduler.stop().await;
        let mut first_error = self.adapters.stop_direction(Direction::In).await.err();
        for activator in self.activators.iter().rev() {
            if let Err(err) = activator.stop().await {
                warn!(activator = %activator.name(), error = %err, "activator stopped with error");
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.adapters.stop_direction(Direction::Out).await {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn status(&self) -> BusStatus {
        BusStatus {
            running: self.is_running(),
            channels: self
                .channels
                .stats()
                .into_iter()
                .map(|(name, stats)| ChannelStatus { name, stats })
                .collect(),
            adapters: self.adapters.status(),
            activators: self
                .activators
                .iter()
                .map(|activator| ActivatorStatus {
                    name: activator.name().to_string(),
                    input_channel: activator.binding().input_channel.clone(),
                    running: activator.is_running(),
                    invocations: activator.invocations(),
                    last_error: activator.last_error(),
                })
                .collect(),
            scheduler: self.scheduler.status(),
        }
    }
}
