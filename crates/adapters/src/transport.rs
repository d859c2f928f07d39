//! Source and sink abstractions bound to a URI scheme.
//!
//! An input adapter pulls [`RawMessage`]s from a [`MessageSource`]; an output
//! adapter hands envelopes to a [`MessageSink`]. Concrete transports live in
//! [`crate::schemes`].

use {
    async_trait::async_trait,
    switchyard_common::{Envelope, Header, Payload, PayloadCodec, Result},
};

/// Bytes plus header as extracted from a physical source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub header: Header,
    /// Source-specific handle used to acknowledge or reject the message.
    pub receipt: Option<String>,
}

impl RawMessage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            header: Header::new(),
            receipt: None,
        }
    }

    #[must_use]
    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    /// Wrap into an envelope. Valid UTF-8 becomes a `String` body, anything
    /// else stays `Vec<u8>`. Empty bytes produce an empty body.
    pub fn to_envelope(&self) -> Envelope {
        let body = if self.bytes.is_empty() {
            Payload::empty()
        } else {
            match std::str::from_utf8(&self.bytes) {
                Ok(text) => Payload::new(text.to_string()),
                Err(_) => Payload::new(self.bytes.clone()),
            }
        };
        Envelope::with_header(self.header.clone(), body)
    }
}

/// Bytes for a sink that writes raw content: the payload's natural byte form,
/// else the codec's serialization.
pub fn envelope_bytes(envelope: &Envelope, codec: &dyn PayloadCodec) -> Result<Vec<u8>> {
    match envelope.body().to_bytes() {
        Some(bytes) => Ok(bytes),
        None => codec.serialize(envelope.body()),
    }
}

/// Where an input adapter extracts messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn describe(&self) -> String;

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Extract the next message, or `None` when the source is idle.
    async fn receive(&self) -> Result<Option<RawMessage>>;

    /// The message was published. Sources with at-least-once semantics drop it
    /// here.
    async fn acknowledge(&self, _message: &RawMessage) -> Result<()> {
        Ok(())
    }

    /// The message failed before publish.
    async fn reject(&self, _message: &RawMessage) -> Result<()> {
        Ok(())
    }
}

/// Where an output adapter delivers envelopes to.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn describe(&self) -> String;

    /// Runs at adapter start and before every delivery.
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Runs at adapter stop and after every delivery.
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()>;
}
