//! Envelope, error taxonomy, event hub and payload codec shared by all
//! switchyard crates.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod events;

pub use {
    codec::{JsonCodec, PayloadCodec},
    envelope::{Envelope, Header, HeaderItem, Payload, PayloadValue},
    error::{Error, ErrorKind, FromMessage, Result, Severity},
    events::{BusEvent, EventHub, EventKind, EventObserver, ObserverId, RecordingObserver},
};
