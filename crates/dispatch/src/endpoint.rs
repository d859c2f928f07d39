//! Endpoints: named groups of handler methods, and the resolver that finds
//! them by type key.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {
    switchyard_common::{Error, Payload, Result},
    tracing::debug,
};

use crate::handler::{HandlerMethod, Parameter};

/// A message handling component: its methods plus an optional default
/// output channel.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    output_channel: Option<String>,
    methods: Vec<HandlerMethod>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output_channel: None,
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn output_channel(mut self, channel: impl Into<String>) -> Self {
        self.output_channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn method(mut self, method: HandlerMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_output(&self) -> Option<&str> {
        self.output_channel.as_deref()
    }

    pub fn methods(&self) -> &[HandlerMethod] {
        &self.methods
    }

    pub fn method_named(&self, name: &str) -> Option<&HandlerMethod> {
        self.methods
            .iter()
            .find(|method| method.name().eq_ignore_ascii_case(name))
    }

    /// Pick the method for a payload: the named one when `preferred` is set,
    /// otherwise the first method typed for the payload, falling back to a
    /// method taking the whole envelope.
    pub fn resolve(&self, preferred: Option<&str>, payload: &Payload) -> Result<&HandlerMethod> {
        if let Some(name) = preferred {
            return self
                .method_named(name)
                .ok_or_else(|| Error::activation(&self.name, format!("no method named '{name}'")));
        }
        self.methods
            .iter()
            .find(|method| method.accepts(payload))
            .or_else(|| {
                self.methods
                    .iter()
                    .find(|method| method.parameter() == Parameter::Envelope)
            })
            .ok_or_else(|| {
                Error::activation(
                    &self.name,
                    format!(
                        "no method accepts a payload of type {}",
                        payload.type_name().unwrap_or("<empty>")
                    ),
                )
            })
    }
}

/// Looks up endpoint instances by type key.
pub trait InstanceResolver: Send + Sync {
    fn resolve(&self, type_key: &str) -> Result<Arc<Endpoint>>;
}

pub type EndpointFactory = Arc<dyn Fn() -> Result<Endpoint> + Send + Sync>;

/// Instances and lazy factories keyed by case-insensitive type key.
#[derive(Default)]
pub struct EndpointRegistry {
    instances: RwLock<HashMap<String, Arc<Endpoint>>>,
    factories: RwLock<HashMap<String, EndpointFactory>>,
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

fn key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a ready instance under its own name.
    pub fn register(&self, endpoint: Endpoint) -> Arc<Endpoint> {
        let endpoint = Arc::new(endpoint);
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key(endpoint.name()), Arc::clone(&endpoint));
        endpoint
    }

    /// Register a factory run on the first resolve of `type_key`.
    pub fn register_factory<F>(&self, type_key: &str, factory: F)
    where
        F: Fn() -> Result<Endpoint> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key(type_key), Arc::new(factory));
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .chain(self.factories.read().unwrap_or_else(|e| e.into_inner()).keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl InstanceResolver for EndpointRegistry {
    fn resolve(&self, type_key: &str) -> Result<Arc<Endpoint>> {
        let k = key(type_key);
        if let Some(endpoint) = self.instances.read().unwrap_or_else(|e| e.into_inner()).get(&k) {
            return Ok(Arc::clone(endpoint));
        }
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::activation(type_key, "no endpoint registered for this type key"))?;
        let built = Arc::new(factory()?);
        debug!(type_key, endpoint = %built.name(), "endpoint instantiated");
        // Another caller may have won the race; keep the first instance.
        let endpoint = self
            .instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(k)
            .or_insert(built)
            .clone();
        Ok(endpoint)
    }
}
