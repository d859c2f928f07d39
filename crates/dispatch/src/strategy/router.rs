//! Content-based routing.
//!
//! In rule mode the first matching rule names the channel. In method-return
//! mode the handler method is invoked and a non-blank text result names the
//! channel. Either way the fallback is the router's own channel, then the
//! endpoint's output channel; with neither the envelope is unroutable.

use std::{fmt, sync::Arc};

use {
    async_trait::async_trait,
    regex::Regex,
    switchyard_common::{Envelope, Error, Result},
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{counter, labels, strategy as strategy_metrics};

use super::{MessageHandlingStrategy, StrategyContext, StrategyKind};

type Predicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// One routing rule: a predicate and the channel it selects.
#[derive(Clone)]
pub struct RouteRule {
    channel: String,
    description: String,
    predicate: Predicate,
}

impl fmt::Debug for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteRule")
            .field("channel", &self.channel)
            .field("description", &self.description)
            .finish()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| Error::strategy(StrategyKind::Router.as_str(), err))
}

impl RouteRule {
    pub fn when<F>(channel: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        Self {
            channel: channel.into(),
            description: "custom predicate".into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Match text payloads against a regular expression.
    pub fn payload_matches(channel: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = compile(pattern)?;
        Ok(Self {
            channel: channel.into(),
            description: format!("payload ~ {pattern}"),
            predicate: Arc::new(move |envelope: &Envelope| {
                envelope.body().as_text().is_some_and(|text| regex.is_match(text))
            }),
        })
    }

    /// Match a header item's value against a regular expression.
    pub fn header_matches(channel: impl Into<String>, item: &str, pattern: &str) -> Result<Self> {
        let regex = compile(pattern)?;
        let item = item.to_string();
        Ok(Self {
            channel: channel.into(),
            description: format!("header {item} ~ {pattern}"),
            predicate: Arc::new(move |envelope: &Envelope| {
                envelope.header.item(&item).is_some_and(|value| regex.is_match(value))
            }),
        })
    }

    /// Match payloads of type `T`.
    pub fn payload_is<T: 'static>(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            description: format!("payload is {}", std::any::type_name::<T>()),
            predicate: Arc::new(|envelope: &Envelope| envelope.body().is::<T>()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        (self.predicate)(envelope)
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Rules(Vec<RouteRule>),
    MethodReturn,
}

#[derive(Debug, Clone)]
pub struct Router {
    mode: Mode,
    fallback: Option<String>,
}

impl Router {
    /// Route by the first matching rule.
    pub fn rules(rules: Vec<RouteRule>) -> Self {
        Self {
            mode: Mode::Rules(rules),
            fallback: None,
        }
    }

    /// Route by the channel name the handler method returns.
    pub fn method_return() -> Self {
        Self {
            mode: Mode::MethodReturn,
            fallback: None,
        }
    }

    /// Channel used when nothing else names one.
    #[must_use]
    pub fn fallback(mut self, channel: impl Into<String>) -> Self {
        self.fallback = Some(channel.into());
        self
    }

    fn static_channel(&self, context: &StrategyContext, envelope: &Envelope) -> Result<String> {
        if let Some(channel) = self.fallback.as_ref().or(context.output_channel.as_ref()) {
            #[cfg(feature = "metrics")]
            counter!(strategy_metrics::ROUTE_FALLBACK_TOTAL, labels::ENDPOINT => context.endpoint.name().to_string())
                .increment(1);
            return Ok(channel.clone());
        }
        #[cfg(feature = "metrics")]
        counter!(strategy_metrics::UNROUTABLE_TOTAL, labels::ENDPOINT => context.endpoint.name().to_string())
            .increment(1);
        warn!(
            endpoint = %context.endpoint.name(),
            message_id = envelope.header.message_id(),
            "no route and no fallback channel"
        );
        Err(Error::unroutable(envelope.header.message_id()))
    }

    /// The channel `envelope` should go to.
    pub async fn route(&self, context: &StrategyContext, envelope: &Envelope) -> Result<String> {
        match &self.mode {
            Mode::Rules(rules) => match rules.iter().find(|rule| rule.matches(envelope)) {
                Some(rule) => Ok(rule.channel.clone()),
                None => self.static_channel(context, envelope),
            },
            Mode::MethodReturn => {
                let reply = context.method.invoke(envelope.clone()).await?;
                let named = reply
                    .as_ref()
                    .and_then(|payload| payload.as_text())
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string);
                match named {
                    Some(channel) => Ok(channel),
                    None => self.static_channel(context, envelope),
                }
            },
        }
    }
}

#[async_trait]
impl MessageHandlingStrategy for Router {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Router
    }

    async fn handle(&self, context: &StrategyContext, envelope: Envelope) -> Result<()> {
        let channel = self.route(context, &envelope).await?;
        debug!(
            endpoint = %context.endpoint.name(),
            message_id = envelope.header.message_id(),
            channel = %channel,
            "envelope routed"
        );
        context.send(&channel, envelope)?;
        context.completed(self.kind(), Some(channel), None);
        Ok(())
    }
}
