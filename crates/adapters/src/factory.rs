//! Scheme-keyed construction of sources, sinks and whole adapters.
//!
//! Factories are registered under `{scheme}-in` and `{scheme}-out` keys; an
//! adapter URI's scheme picks the factory.

use std::{collections::HashMap, sync::Arc};

use {
    switchyard_channels::ChannelRegistry,
    switchyard_common::{Error, EventHub, PayloadCodec, Result},
    tracing::debug,
    url::Url,
};

use crate::{
    adapter::{ChannelAdapter, Direction, Polling},
    input::InputChannelAdapter,
    output::OutputChannelAdapter,
    pipeline::Pipeline,
    retry::RetryPolicy,
    schemes::{
        channel::ChannelSink,
        file::{FileSink, FileSource, directory},
        log::LogSink,
        memory::{MemoryBroker, MemorySink, MemorySource},
        target,
    },
    transport::{MessageSink, MessageSource},
};

pub type SourceFactory = Arc<dyn Fn(&Url) -> Result<Arc<dyn MessageSource>> + Send + Sync>;
pub type SinkFactory = Arc<dyn Fn(&Url) -> Result<Arc<dyn MessageSink>> + Send + Sync>;

/// Everything needed to build one adapter.
#[derive(Debug, Clone)]
pub struct AdapterDefinition {
    pub name: String,
    pub uri: Url,
    pub direction: Direction,
    pub channel: Option<String>,
    pub polling: Polling,
    pub retry: RetryPolicy,
    pub pipeline: Pipeline,
}

impl AdapterDefinition {
    pub fn new(name: impl Into<String>, uri: Url, direction: Direction) -> Self {
        Self {
            name: name.into(),
            uri,
            direction,
            channel: None,
            polling: Polling::default(),
            retry: RetryPolicy::none(),
            pipeline: Pipeline::new(),
        }
    }

    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn polling(mut self, polling: Polling) -> Self {
        self.polling = polling;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }
}

/// Registry of source/sink factories by `{scheme}-{direction}` key.
#[derive(Default)]
pub struct AdapterFactories {
    sources: HashMap<String, SourceFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl std::fmt::Debug for AdapterFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterFactories")
            .field("keys", &self.keys())
            .finish()
    }
}

/// The lookup key for a scheme and direction, e.g. `file-in`.
pub fn factory_key(scheme: &str, direction: Direction) -> String {
    format!("{}-{}", scheme.to_ascii_lowercase(), direction.suffix())
}

impl AdapterFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories for `memory`, `file`, `log` and `channel`.
    pub fn with_builtins(
        channels: Arc<ChannelRegistry>,
        broker: Arc<MemoryBroker>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        let mut factories = Self::new();

        let memory_in = Arc::clone(&broker);
        factories.register_source("memory", move |uri| {
            Ok(Arc::new(MemorySource::new(Arc::clone(&memory_in), target(uri)?)) as Arc<dyn MessageSource>)
        });
        let memory_codec = Arc::clone(&codec);
        factories.register_sink("memory", move |uri| {
            Ok(Arc::new(MemorySink::new(
                Arc::clone(&broker),
                target(uri)?,
                Arc::clone(&memory_codec),
            )) as Arc<dyn MessageSink>)
        });

        factories.register_source("file", |uri| {
            Ok(Arc::new(FileSource::new(directory(uri)?)) as Arc<dyn MessageSource>)
        });
        factories.register_sink("file", move |uri| {
            Ok(Arc::new(FileSink::new(directory(uri)?, Arc::clone(&codec))) as Arc<dyn MessageSink>)
        });

        factories.register_sink("log", |uri| {
            Ok(Arc::new(LogSink::from_uri(uri)?) as Arc<dyn MessageSink>)
        });

        factories.register_sink("channel", move |uri| {
            Ok(Arc::new(ChannelSink::new(Arc::clone(&channels), target(uri)?)) as Arc<dyn MessageSink>)
        });

        factories
    }

    pub fn register_source<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Url) -> Result<Arc<dyn MessageSource>> + Send + Sync + 'static,
    {
        self.sources
            .insert(factory_key(scheme, Direction::In), Arc::new(factory));
    }

    pub fn register_sink<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Url) -> Result<Arc<dyn MessageSink>> + Send + Sync + 'static,
    {
        self.sinks
            .insert(factory_key(scheme, Direction::Out), Arc::new(factory));
    }

    pub fn supports(&self, scheme: &str, direction: Direction) -> bool {
        let key = factory_key(scheme, direction);
        match direction {
            Direction::In => self.sources.contains_key(&key),
            Direction::Out => self.sinks.contains_key(&key),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sources.keys().chain(self.sinks.keys()).cloned().collect();
        keys.sort();
        keys
    }

    pub fn source(&self, uri: &Url) -> Result<Arc<dyn MessageSource>> {
        let key = factory_key(uri.scheme(), Direction::In);
        let factory = self
            .sources
            .get(&key)
            .ok_or_else(|| Error::adapter(uri.as_str(), format!("no factory registered for {key}")))?;
        factory(uri)
    }

    pub fn sink(&self, uri: &Url) -> Result<Arc<dyn MessageSink>> {
        let key = factory_key(uri.scheme(), Direction::Out);
        let factory = self
            .sinks
            .get(&key)
            .ok_or_else(|| Error::adapter(uri.as_str(), format!("no factory registered for {key}")))?;
        factory(uri)
    }

    /// Build an adapter from its definition. Output adapters whose retry
    /// policy names a failure address get a sink for it too.
    pub fn build(
        &self,
        definition: AdapterDefinition,
        channels: Arc<ChannelRegistry>,
        events: Option<Arc<EventHub>>,
    ) -> Result<Arc<dyn ChannelAdapter>> {
        debug!(
            adapter = %definition.name,
            uri = %definition.uri,
            direction = %definition.direction,
            "building adapter"
        );
        let adapter: Arc<dyn ChannelAdapter> = match definition.direction {
            Direction::In => {
                let source = self.source(&definition.uri)?;
                let mut builder = InputChannelAdapter::builder(definition.name, definition.uri, source)
                    .pipeline(definition.pipeline)
                    .polling(definition.polling);
                if let Some(channel) = definition.channel {
                    builder = builder.channel(channel);
                }
                if let Some(events) = events {
                    builder = builder.events(events);
                }
                Arc::new(builder.build(channels))
            },
            Direction::Out => {
                let sink = self.sink(&definition.uri)?;
                let failure_sink = definition
                    .retry
                    .failure_delivery_address
                    .as_ref()
                    .map(|address| self.sink(address))
                    .transpose()?;
                let mut builder = OutputChannelAdapter::builder(definition.name, definition.uri, sink)
                    .pipeline(definition.pipeline)
                    .polling(definition.polling)
                    .retry(definition.retry);
                if let Some(failure_sink) = failure_sink {
                    builder = builder.failure_sink(failure_sink);
                }
                if let Some(channel) = definition.channel {
                    builder = builder.channel(channel);
                }
                if let Some(events) = events {
                    builder = builder.events(events);
                }
                Arc::new(builder.build(channels))
            },
        };
        Ok(adapter)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::transport::RawMessage,
        switchyard_common::{Envelope, JsonCodec},
    };

    fn factories() -> (Arc<ChannelRegistry>, Arc<MemoryBroker>, AdapterFactories) {
        let channels = ChannelRegistry::shared();
        let broker = MemoryBroker::shared();
        let factories = AdapterFactories::with_builtins(
            Arc::clone(&channels),
            Arc::clone(&broker),
            Arc::new(JsonCodec::new()),
        );
        (channels, broker, factories)
    }

    #[test]
    fn builtin_keys() {
        let (_, _, factories) = factories();
        assert_eq!(factories.keys(), vec![
            "channel-out",
            "file-in",
            "file-out",
            "log-out",
            "memory-in",
            "memory-out",
        ]);
        assert!(factories.supports("FILE", Direction::In));
        assert!(!factories.supports("log", Direction::In));
    }

    #[test]
    fn unknown_scheme_is_an_adapter_error() {
        let (_, _, factories) = factories();
        let err = factories
            .source(&Url::parse("amqp://broker/queue").unwrap())
            .err()
            .unwrap();
        assert!(err.to_string().contains("amqp-in"));
    }

    #[tokio::test]
    async fn builds_input_adapter_bound_to_scheme() {
        let (channels, broker, factories) = factories();
        let definition = AdapterDefinition::new("in", Url::parse("memory://inbox").unwrap(), Direction::In)
            .channel("orders");
        let adapter = factories.build(definition, Arc::clone(&channels), None).unwrap();
        broker.push("inbox", RawMessage::new("x"));
        assert!(adapter.perform_action().await.unwrap());
        assert_eq!(channels.get("orders").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn output_adapter_gets_failure_sink() {
        let (channels, _broker, factories) = factories();
        // A regular file where the output directory should be.
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let unwritable = Url::from_file_path(blocker.join("out")).unwrap();
        let retry = RetryPolicy::none().with_failure_address(Url::parse("channel://dead").unwrap());
        let definition = AdapterDefinition::new("out", unwritable, Direction::Out)
            .channel("outbound")
            .retry(retry);
        let adapter = factories.build(definition, Arc::clone(&channels), None).unwrap();
        channels.find_or_create("outbound").send(Envelope::new("x".to_string())).unwrap();
        let err = adapter.perform_action().await.unwrap_err();
        assert!(matches!(err, Error::NonDelivered { .. }));
        assert_eq!(channels.get("dead").unwrap().len(), 1);
    }
}
