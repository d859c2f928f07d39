//! Channel adapters: the bus's boundary to files, queues and logs.
//!
//! An [`InputChannelAdapter`] polls a [`MessageSource`], runs the receive
//! [`Pipeline`] and publishes onto a channel inside a [`UnitOfWork`]. An
//! [`OutputChannelAdapter`] drains a channel, runs the send pipeline and
//! delivers through a [`MessageSink`] under a [`RetryPolicy`]. Transports are
//! picked by URI scheme through [`AdapterFactories`], and an
//! [`AdapterRegistry`] starts and stops them as a group.

pub mod adapter;
pub mod factory;
pub mod input;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod schemes;
pub mod transport;
pub mod unit_of_work;

pub use {
    adapter::{AdapterStatus, ChannelAdapter, Direction, Polling},
    factory::{AdapterDefinition, AdapterFactories, factory_key},
    input::InputChannelAdapter,
    output::OutputChannelAdapter,
    pipeline::{Pipeline, PipelineStage, StageRegistry, stage},
    registry::AdapterRegistry,
    retry::RetryPolicy,
    schemes::{
        channel::ChannelSink,
        file::{FileSink, FileSource},
        log::{LogLevel, LogSink},
        memory::{MemoryBroker, MemorySink, MemorySource},
    },
    transport::{MessageSink, MessageSource, RawMessage},
    unit_of_work::UnitOfWork,
};
