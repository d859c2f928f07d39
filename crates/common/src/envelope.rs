//! The envelope: a header plus a type-erased payload.
//!
//! Payload access is always a checked cast. Asking for the wrong type yields
//! `None` (or the type's default), never a panic.

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::error::{Error, Result};

// ── Payload ─────────────────────────────────────────────────────────────────

/// Any value that can ride in an [`Envelope`].
///
/// Blanket-implemented for every `'static` type that is `Send + Sync + Debug +
/// PartialEq`. Equality is needed for unique-only batching.
pub trait PayloadValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_value(&self, other: &dyn PayloadValue) -> bool;
    fn value_type_name(&self) -> &'static str;
}

impl<T> PayloadValue for T
where
    T: Any + Send + Sync + fmt::Debug + PartialEq,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_value(&self, other: &dyn PayloadValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn value_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Type-erased, cheaply clonable message body.
#[derive(Clone, Default)]
pub struct Payload(Option<Arc<dyn PayloadValue>>);

impl Payload {
    /// Wrap a value. Passing a `Payload` returns it unchanged instead of
    /// nesting it.
    pub fn new<T: PayloadValue>(value: T) -> Self {
        if let Some(payload) = (&value as &dyn Any).downcast_ref::<Payload>() {
            return payload.clone();
        }
        Self(Some(Arc::new(value)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Checked cast to `T`.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.0
            .as_deref()
            .and_then(|value| value.as_any().downcast_ref::<T>())
    }

    /// Checked cast returning `T::default()` on mismatch or empty body.
    pub fn value_or_default<T: Clone + Default + 'static>(&self) -> T {
        self.get::<T>().cloned().unwrap_or_default()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.get::<T>().is_some()
    }

    /// Runtime type of the carried value.
    pub fn type_id(&self) -> Option<TypeId> {
        self.0
            .as_deref()
            .map(|value| Any::type_id(value.as_any()))
    }

    pub fn type_name(&self) -> Option<&'static str> {
        self.0.as_deref().map(PayloadValue::value_type_name)
    }

    /// Raw bytes for payloads with an obvious byte form: `String`, `&'static
    /// str`, `Vec<u8>` and JSON values.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        if let Some(text) = self.get::<String>() {
            return Some(text.clone().into_bytes());
        }
        if let Some(text) = self.get::<&'static str>() {
            return Some(text.as_bytes().to_vec());
        }
        if let Some(bytes) = self.get::<Vec<u8>>() {
            return Some(bytes.clone());
        }
        self.get::<serde_json::Value>()
            .and_then(|value| serde_json::to_vec(value).ok())
    }

    /// Text view for `String` and `&'static str` payloads.
    pub fn as_text(&self) -> Option<&str> {
        self.get::<String>()
            .map(String::as_str)
            .or_else(|| self.get::<&'static str>().copied())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("<empty>"),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_value(b.as_ref()),
            _ => false,
        }
    }
}

// ── Header ──────────────────────────────────────────────────────────────────

/// A named header entry. Names are unique per header, compared
/// case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderItem {
    pub name: String,
    pub value: String,
}

/// Envelope routing and sequencing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    message_id: String,
    #[serde(default)]
    message_id_overridden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sequence_number: u32,
    #[serde(default)]
    pub sequence_size: u32,
    #[serde(default)]
    items: Vec<HeaderItem>,
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl Header {
    pub fn new() -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            message_id_overridden: false,
            correlation_id: None,
            input_channel: None,
            output_channel: None,
            destination: None,
            return_address: None,
            expires_on: None,
            sequence_number: 0,
            sequence_size: 0,
            items: Vec::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Replace the generated message id. Allowed once per header.
    pub fn override_message_id(&mut self, id: impl Into<String>) -> Result<()> {
        if self.message_id_overridden {
            return Err(Error::message(format!(
                "message id {} was already overridden",
                self.message_id
            )));
        }
        self.message_id = id.into();
        self.message_id_overridden = true;
        Ok(())
    }

    /// Set a named item, replacing an existing one in place.
    pub fn set_item(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .items
            .iter_mut()
            .find(|item| item.name.eq_ignore_ascii_case(&name))
        {
            Some(item) => item.value = value,
            None => self.items.push(HeaderItem { name, value }),
        }
    }

    pub fn item(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.name.eq_ignore_ascii_case(name))
            .map(|item| item.value.as_str())
    }

    pub fn remove_item(&mut self, name: &str) -> Option<HeaderItem> {
        let index = self
            .items
            .iter()
            .position(|item| item.name.eq_ignore_ascii_case(name))?;
        Some(self.items.remove(index))
    }

    pub fn items(&self) -> &[HeaderItem] {
        &self.items
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_some_and(|at| at <= now)
    }

    /// Position within a correlated batch, if one was assigned.
    pub fn set_sequence(&mut self, number: u32, size: u32) {
        self.sequence_number = number.min(size);
        self.sequence_size = size;
    }
}

// ── Envelope ────────────────────────────────────────────────────────────────

/// The unit exchanged between channels, adapters and endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    body: Payload,
}

impl Envelope {
    pub fn new<T: PayloadValue>(value: T) -> Self {
        Self::from_payload(Payload::new(value))
    }

    pub fn from_payload(body: Payload) -> Self {
        Self {
            header: Header::new(),
            body,
        }
    }

    pub fn empty() -> Self {
        Self::from_payload(Payload::empty())
    }

    pub fn with_header(header: Header, body: Payload) -> Self {
        Self { header, body }
    }

    pub fn body(&self) -> &Payload {
        &self.body
    }

    pub fn into_body(self) -> Payload {
        self.body
    }

    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.body.get::<T>()
    }

    pub fn set_payload<T: PayloadValue>(&mut self, value: T) {
        self.body = Payload::new(value);
    }

    pub fn set_body(&mut self, body: Payload) {
        self.body = body;
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The id related messages share: the correlation id when set, else this
    /// message's own id.
    pub fn correlation_key(&self) -> &str {
        self.header
            .correlation_id
            .as_deref()
            .unwrap_or_else(|| self.header.message_id())
    }

    /// A fresh envelope correlated to this one.
    pub fn correlated(&self, body: Payload) -> Self {
        let mut header = Header::new();
        header.correlation_id = Some(self.correlation_key().to_string());
        header.return_address = self.header.return_address.clone();
        Self { header, body }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::empty()
    }
}
