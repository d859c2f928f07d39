//! Message handling strategies a handler method can delegate to.
//!
//! | strategy | behaviour |
//! |---|---|
//! | [`Aggregator`] | split a list payload, select per item, combine once |
//! | [`Accumulator`] | buffer invocations and flush by count, predicate or time window |
//! | [`Router`] | pick a channel by rule or by the method's return value |

mod accumulator;
mod aggregator;
mod router;

pub use {
    accumulator::{Accumulator, AccumulatorConfig, TimeWindow},
    aggregator::{Aggregator, TRUNCATED_ITEM},
    router::{RouteRule, Router},
};

use std::{fmt, sync::Arc};

use {
    async_trait::async_trait,
    switchyard_channels::ChannelRegistry,
    switchyard_common::{BusEvent, Envelope, Error, EventHub, Result},
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{counter, labels, strategy as strategy_metrics};

use crate::{endpoint::Endpoint, handler::HandlerMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Aggregator,
    Accumulator,
    Router,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregator => "aggregator",
            Self::Accumulator => "accumulator",
            Self::Router => "router",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a strategy gets to work with for one envelope.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub endpoint: Arc<Endpoint>,
    pub method: HandlerMethod,
    pub channels: Arc<ChannelRegistry>,
    /// The static output channel: the binding's, else the method's, else the
    /// endpoint's.
    pub output_channel: Option<String>,
    pub events: Arc<EventHub>,
}

impl StrategyContext {
    /// Send into the named channel, creating it if needed.
    pub fn send(&self, channel: &str, envelope: Envelope) -> Result<()> {
        self.channels.find_or_create(channel).send(envelope)
    }

    /// The static output channel or a strategy error.
    pub fn require_output(&self, kind: StrategyKind) -> Result<&str> {
        self.output_channel
            .as_deref()
            .ok_or_else(|| Error::strategy(kind.as_str(), format!("endpoint {} has no output channel", self.endpoint.name())))
    }

    pub fn completed(&self, kind: StrategyKind, channel: Option<String>, envelope: Option<Envelope>) {
        #[cfg(feature = "metrics")]
        counter!(
            strategy_metrics::COMPLETIONS_TOTAL,
            labels::STRATEGY => kind.as_str(),
            labels::ENDPOINT => self.endpoint.name().to_string()
        )
        .increment(1);

        self.events.emit(BusEvent::StrategyCompleted {
            strategy: kind.as_str().to_string(),
            endpoint: self.endpoint.name().to_string(),
            channel,
            envelope,
        });
    }
}

/// Takes over handling of envelopes routed to a method.
///
/// Stateful strategies serialize their own invocations.
#[async_trait]
pub trait MessageHandlingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn handle(&self, context: &StrategyContext, envelope: Envelope) -> Result<()>;

    /// Discard any buffered state.
    fn cleanup(&self) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use {super::*, switchyard_common::Payload};

    pub(crate) fn context(method: HandlerMethod, output: Option<&str>) -> StrategyContext {
        let endpoint = Endpoint::new("test-endpoint").method(method.clone());
        StrategyContext {
            endpoint: Arc::new(endpoint),
            method,
            channels: ChannelRegistry::shared(),
            output_channel: output.map(str::to_string),
            events: EventHub::shared("test"),
        }
    }

    pub(crate) fn passthrough() -> HandlerMethod {
        HandlerMethod::envelope("select", |envelope: Envelope| async move {
            Ok::<Option<Payload>, Error>(Some(envelope.into_body()))
        })
    }
}
