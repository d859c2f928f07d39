//! Ordered envelope transformations run by adapters on receive or send.

use std::{collections::HashMap, fmt, sync::Arc};

use {
    async_trait::async_trait,
    switchyard_common::{Envelope, Error, Result},
    tracing::trace,
};

/// One transformation step.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, envelope: Envelope) -> Result<Envelope>;
}

type StageFn = dyn Fn(Envelope) -> Result<Envelope> + Send + Sync;

/// A stage backed by a synchronous closure.
pub struct FnStage {
    name: String,
    f: Box<StageFn>,
}

impl FnStage {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Envelope) -> Result<Envelope> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl PipelineStage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, envelope: Envelope) -> Result<Envelope> {
        (self.f)(envelope)
    }
}

/// Convenience constructor for an `Arc<dyn PipelineStage>` from a closure.
pub fn stage<F>(name: impl Into<String>, f: F) -> Arc<dyn PipelineStage>
where
    F: Fn(Envelope) -> Result<Envelope> + Send + Sync + 'static,
{
    Arc::new(FnStage::new(name, f))
}

/// Stages applied in order. An empty pipeline passes envelopes through.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|stage| stage.name()))
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Arc<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage. Failures come back as [`Error::Pipeline`] naming the
    /// stage, except cancellation which passes through unchanged.
    pub async fn execute(&self, mut envelope: Envelope) -> Result<Envelope> {
        for stage in &self.stages {
            trace!(stage = stage.name(), message_id = envelope.header.message_id(), "pipeline stage");
            envelope = match stage.process(envelope).await {
                Ok(envelope) => envelope,
                Err(err @ (Error::Cancelled | Error::Pipeline { .. })) => return Err(err),
                Err(err) => return Err(Error::pipeline(stage.name(), err)),
            };
        }
        Ok(envelope)
    }
}

// ── Built-in stages ─────────────────────────────────────────────────────────

/// Decode a `Vec<u8>` body as UTF-8 text. Other bodies pass through.
pub fn utf8_stage() -> Arc<dyn PipelineStage> {
    stage("utf8", |mut envelope| {
        if let Some(bytes) = envelope.payload::<Vec<u8>>() {
            let text = String::from_utf8(bytes.clone()).map_err(Error::codec)?;
            envelope.set_payload(text);
        }
        Ok(envelope)
    })
}

/// Parse a text or byte body into a `serde_json::Value`.
pub fn json_decode_stage() -> Arc<dyn PipelineStage> {
    stage("json-decode", |mut envelope| {
        if let Some(bytes) = envelope.body().to_bytes() {
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            envelope.set_payload(value);
        }
        Ok(envelope)
    })
}

/// Render a `serde_json::Value` body as compact JSON text.
pub fn json_encode_stage() -> Arc<dyn PipelineStage> {
    stage("json-encode", |mut envelope| {
        if let Some(value) = envelope.payload::<serde_json::Value>() {
            let text = serde_json::to_string(value)?;
            envelope.set_payload(text);
        }
        Ok(envelope)
    })
}

/// Trim surrounding whitespace from text bodies.
pub fn trim_stage() -> Arc<dyn PipelineStage> {
    stage("trim", |mut envelope| {
        if let Some(text) = envelope.body().as_text() {
            let trimmed = text.trim().to_string();
            envelope.set_payload(trimmed);
        }
        Ok(envelope)
    })
}

// ── StageRegistry ───────────────────────────────────────────────────────────

/// Named stages, so pipelines can be assembled from configuration.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn PipelineStage>>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `utf8`, `json-decode`, `json-encode` and `trim`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for stage in [utf8_stage(), json_decode_stage(), json_encode_stage(), trim_stage()] {
            registry.register(stage);
        }
        registry
    }

    pub fn register(&mut self, stage: Arc<dyn PipelineStage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PipelineStage>> {
        self.stages.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    /// Assemble a pipeline from stage names, failing on the first unknown one.
    pub fn build<S: AsRef<str>>(&self, names: &[S]) -> Result<Pipeline> {
        names.iter().try_fold(Pipeline::new(), |pipeline, name| {
            let name = name.as_ref();
            self.get(name)
                .map(|stage| pipeline.with_stage(stage))
                .ok_or_else(|| Error::pipeline(name, "no stage registered under this name"))
        })
    }
}
