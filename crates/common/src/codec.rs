//! Payload serialization collaborator.

use std::{any::TypeId, collections::HashMap, fmt, sync::RwLock};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    envelope::{Payload, PayloadValue},
    error::{Error, Result},
};

/// Serialize and deserialize type-erased payloads.
///
/// `type_hint` names the payload type on the way back in. Codecs fall back to
/// an untyped representation when the hint is missing or unknown.
pub trait PayloadCodec: Send + Sync {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8], type_hint: Option<&str>) -> Result<Payload>;

    /// Name to pass as `type_hint` for this payload, when the codec knows it.
    fn type_hint(&self, payload: &Payload) -> Option<String>;
}

type EncodeFn = Box<dyn Fn(&Payload) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Payload> + Send + Sync>;

struct Registration {
    name: String,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// JSON codec with an explicit type registry.
///
/// Registered types round-trip exactly. The std scalars (integers, floats,
/// `bool`, `char`) are registered up front under their Rust names.
/// Unregistered `String`, `Vec<u8>` and `serde_json::Value` payloads are
/// handled natively; anything else is rejected on serialize. Unknown hints
/// decode to `serde_json::Value`.
pub struct JsonCodec {
    by_type: RwLock<HashMap<TypeId, Registration>>,
    by_name: RwLock<HashMap<String, TypeId>>,
}

impl fmt::Debug for JsonCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .by_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        f.debug_struct("JsonCodec").field("types", &names).finish()
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        let codec = Self {
            by_type: RwLock::default(),
            by_name: RwLock::default(),
        };
        codec
            .register::<bool>("bool")
            .register::<char>("char")
            .register::<i8>("i8")
            .register::<i16>("i16")
            .register::<i32>("i32")
            .register::<i64>("i64")
            .register::<isize>("isize")
            .register::<u8>("u8")
            .register::<u16>("u16")
            .register::<u32>("u32")
            .register::<u64>("u64")
            .register::<usize>("usize")
            .register::<f32>("f32")
            .register::<f64>("f64");
        codec
    }
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `name`. Re-registering a name replaces it.
    pub fn register<T>(&self, name: impl Into<String>) -> &Self
    where
        T: PayloadValue + Serialize + DeserializeOwned,
    {
        let name = name.into();
        let registration = Registration {
            name: name.clone(),
            encode: Box::new(|payload| {
                let value = payload
                    .get::<T>()
                    .ok_or_else(|| Error::codec("payload type changed during encode"))?;
                Ok(serde_json::to_vec(value)?)
            }),
            decode: Box::new(|bytes| Ok(Payload::new(serde_json::from_slice::<T>(bytes)?))),
        };
        let type_id = TypeId::of::<T>();
        self.by_type
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(type_id, registration);
        self.by_name
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, type_id);
        self
    }

    /// Encode a concrete value without going through the registry.
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl PayloadCodec for JsonCodec {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>> {
        let Some(type_id) = payload.type_id() else {
            return Ok(b"null".to_vec());
        };
        if let Some(registration) = self
            .by_type
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_id)
        {
            return (registration.encode)(payload);
        }
        if let Some(text) = payload.as_text() {
            return Self::encode(&text);
        }
        if let Some(bytes) = payload.get::<Vec<u8>>() {
            return Self::encode(bytes);
        }
        if let Some(value) = payload.get::<serde_json::Value>() {
            return Self::encode(value);
        }
        Err(Error::codec(format!(
            "no serializer registered for {}",
            payload.type_name().unwrap_or("<unknown>")
        )))
    }

    fn deserialize(&self, bytes: &[u8], type_hint: Option<&str>) -> Result<Payload> {
        if let Some(hint) = type_hint {
            let type_id = self
                .by_name
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(hint)
                .copied();
            if let Some(type_id) = type_id
                && let Some(registration) = self
                    .by_type
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&type_id)
            {
                return (registration.decode)(bytes);
            }
            match hint {
                "string" => return Ok(Payload::new(Self::decode::<String>(bytes)?)),
                "bytes" => return Ok(Payload::new(Self::decode::<Vec<u8>>(bytes)?)),
                _ => {},
            }
        }
        let value: serde_json::Value = Self::decode(bytes)?;
        if value.is_null() {
            return Ok(Payload::empty());
        }
        Ok(Payload::new(value))
    }

    fn type_hint(&self, payload: &Payload) -> Option<String> {
        let type_id = payload.type_id()?;
        if let Some(registration) = self
            .by_type
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&type_id)
        {
            return Some(registration.name.clone());
        }
        if payload.as_text().is_some() {
            Some("string".into())
        } else if payload.is::<Vec<u8>>() {
            Some("bytes".into())
        } else {
            None
        }
    }
}
