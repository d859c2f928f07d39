//! Handler methods: named, typed entry points an endpoint exposes.
//!
//! A method is registered with the payload type it accepts. The activator
//! picks the method whose parameter type matches the payload's runtime type,
//! unless the binding names one up front.

use std::{
    any::TypeId,
    fmt,
    future::Future,
    sync::Arc,
};

use {
    futures::future::{BoxFuture, FutureExt},
    switchyard_common::{Envelope, Error, Payload, PayloadValue, Result},
};

use crate::strategy::MessageHandlingStrategy;

pub type HandlerFuture = BoxFuture<'static, Result<Option<Payload>>>;

type Invoke = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// What a handler method takes as its single argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    /// No argument. Only scheduled items call these.
    None,
    /// The payload, downcast to one concrete type.
    Typed { id: TypeId, name: &'static str },
    /// The whole envelope, whatever the payload.
    Envelope,
}

impl Parameter {
    pub fn of<T: 'static>() -> Self {
        Self::Typed {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Turn a handler's return value into an optional reply payload. `()` and
/// empty payloads mean "no reply".
fn reply<R: PayloadValue>(value: R) -> Option<Payload> {
    if TypeId::of::<R>() == TypeId::of::<()>() {
        return None;
    }
    let payload = Payload::new(value);
    (!payload.is_empty()).then_some(payload)
}

/// One invocable method of an endpoint.
#[derive(Clone)]
pub struct HandlerMethod {
    name: String,
    parameter: Parameter,
    output_channel: Option<String>,
    strategy: Option<Arc<dyn MessageHandlingStrategy>>,
    invoke: Invoke,
}

impl fmt::Debug for HandlerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMethod")
            .field("name", &self.name)
            .field("parameter", &self.parameter)
            .field("output_channel", &self.output_channel)
            .field("strategy", &self.strategy.as_ref().map(|s| s.kind()))
            .finish()
    }
}

impl HandlerMethod {
    /// A method taking the payload as `T`. Returning `()` produces no reply;
    /// returning a [`Payload`] lets the method decide per call.
    pub fn new<T, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        T: PayloadValue + Clone,
        R: PayloadValue,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = name.into();
        let method = name.clone();
        let handler = Arc::new(handler);
        let invoke: Invoke = Arc::new(move |envelope: Envelope| {
            let argument = envelope.payload::<T>().cloned();
            let handler = Arc::clone(&handler);
            let method = method.clone();
            async move {
                let argument = argument.ok_or_else(|| {
                    Error::activation(&method, format!("payload is not a {}", std::any::type_name::<T>()))
                })?;
                Ok::<_, Error>(reply(handler(argument).await?))
            }
            .boxed()
        });
        Self::from_parts(name, Parameter::of::<T>(), invoke)
    }

    /// A method that sees the whole envelope and accepts any payload.
    pub fn envelope<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Payload>>> + Send + 'static,
    {
        let invoke: Invoke = Arc::new(move |envelope: Envelope| handler(envelope).boxed());
        Self::from_parts(name.into(), Parameter::Envelope, invoke)
    }

    /// A method taking no argument, for scheduled items.
    pub fn nullary<R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        R: PayloadValue,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoke: Invoke = Arc::new(move |_envelope: Envelope| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, Error>(reply(handler().await?)) }.boxed()
        });
        Self::from_parts(name.into(), Parameter::None, invoke)
    }

    fn from_parts(name: String, parameter: Parameter, invoke: Invoke) -> Self {
        Self {
            name,
            parameter,
            output_channel: None,
            strategy: None,
            invoke,
        }
    }

    /// Channel this method's replies go to when the binding names none.
    #[must_use]
    pub fn output_channel(mut self, channel: impl Into<String>) -> Self {
        self.output_channel = Some(channel.into());
        self
    }

    /// Hand envelopes for this method to `strategy` instead of invoking it
    /// directly.
    #[must_use]
    pub fn strategy(mut self, strategy: Arc<dyn MessageHandlingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter(&self) -> Parameter {
        self.parameter
    }

    pub fn declared_output(&self) -> Option<&str> {
        self.output_channel.as_deref()
    }

    pub fn handling_strategy(&self) -> Option<&Arc<dyn MessageHandlingStrategy>> {
        self.strategy.as_ref()
    }

    /// Whether the payload's runtime type is exactly this method's parameter.
    pub fn accepts(&self, payload: &Payload) -> bool {
        match self.parameter {
            Parameter::Typed { id, .. } => payload.type_id() == Some(id),
            Parameter::None | Parameter::Envelope => false,
        }
    }

    pub fn invoke(&self, envelope: Envelope) -> HandlerFuture {
        (self.invoke)(envelope)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typed_method_replies() {
        let method = HandlerMethod::new("shout", |s: String| async move { Ok::<_, Error>(s.to_uppercase()) });
        assert!(method.accepts(&Payload::new("x".to_string())));
        assert!(!method.accepts(&Payload::new(1_u32)));
        let reply = method.invoke(Envelope::new("hi".to_string())).await.unwrap();
        assert_eq!(reply.unwrap().get::<String>().unwrap(), "HI");
    }

    #[tokio::test]
    async fn unit_return_is_no_reply() {
        let method = HandlerMethod::new("sink", |_: u32| async { Ok::<_, Error>(()) });
        assert!(method.invoke(Envelope::new(3_u32)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_payload_return_is_no_reply() {
        let method = HandlerMethod::new("maybe", |n: u32| async move {
            Ok::<_, Error>(if n > 1 { Payload::new(n) } else { Payload::empty() })
        });
        assert!(method.invoke(Envelope::new(1_u32)).await.unwrap().is_none());
        assert!(method.invoke(Envelope::new(2_u32)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wrong_payload_type_is_activation_error() {
        let method = HandlerMethod::new("count", |n: u32| async move { Ok::<_, Error>(n + 1) });
        let err = method.invoke(Envelope::new("nope".to_string())).await.unwrap_err();
        assert!(matches!(err, Error::Activation { .. }));
    }

    #[tokio::test]
    async fn nullary_ignores_the_envelope() {
        let method = HandlerMethod::nullary("tick", || async { Ok::<_, Error>(7_u64) });
        assert_eq!(method.parameter(), Parameter::None);
        let reply = method.invoke(Envelope::empty()).await.unwrap();
        assert_eq!(reply.unwrap().get::<u64>(), Some(&7));
    }
}
