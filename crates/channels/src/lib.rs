//! Named, process-local envelope channels.
//!
//! A [`Channel`] is a thread-safe FIFO of [`Envelope`](switchyard_common::Envelope)s
//! that broadcasts a [`ChannelEvent`] whenever an envelope is sent or received.
//! Channels are looked up by name, case-insensitively, through the
//! [`ChannelRegistry`].

pub mod channel;
pub mod registry;

pub use {
    channel::{Channel, ChannelEvent, ChannelEventKind, ChannelStats},
    registry::ChannelRegistry,
};
