//! Scheduled invocation of zero-argument endpoint methods.
//!
//! Each item gets its own recurring timer. A firing invokes the method and,
//! when it returns something, sends the result to the item's output channel.

pub mod service;
pub mod types;

pub use {
    service::Scheduler,
    types::{ItemState, ItemStatus, RunStatus, ScheduledItem, SchedulerStatus},
};
