//! Scheduled item definitions and their runtime state.

use std::{sync::Arc, time::Duration};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    switchyard_dispatch::Endpoint,
};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// One recurring invocation: which method of which endpoint, how often, and
/// where its result goes.
#[derive(Debug, Clone)]
pub struct ScheduledItem {
    pub name: String,
    pub endpoint: Arc<Endpoint>,
    pub method: String,
    pub frequency: Duration,
    /// Falls back to the method's, then the endpoint's, declared output.
    pub output_channel: Option<String>,
    pub initial_delay: Duration,
}

impl ScheduledItem {
    /// An item named `<endpoint>.<method>`.
    pub fn new(endpoint: Arc<Endpoint>, method: impl Into<String>, frequency: Duration) -> Self {
        let method = method.into();
        Self {
            name: format!("{}.{}", endpoint.name(), method),
            endpoint,
            method,
            frequency,
            output_channel: None,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn output_channel(mut self, channel: impl Into<String>) -> Self {
        self.output_channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// Outcome of a single run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Ok,
    Error,
}

/// Mutable runtime state of an item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
    pub run_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatus {
    pub name: String,
    pub endpoint: String,
    pub method: String,
    pub frequency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<String>,
    pub state: ItemState,
}

/// Scheduler status summary.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub item_count: usize,
    pub items: Vec<ItemStatus>,
}
