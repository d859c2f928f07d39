/// Config schema types (telemetry, channels, adapters, activators, scheduler).
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub telemetry: TelemetryConfig,
    /// Channels created up front, before any adapter or activator asks for
    /// them.
    pub channels: Vec<String>,
    pub adapters: Vec<AdapterConfig>,
    pub activators: Vec<ActivatorConfig>,
    pub scheduler: SchedulerConfig,
}

/// Logging and metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Labels added to every metric.
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterDirection {
    #[default]
    In,
    Out,
}

/// One channel adapter.
///
/// ```toml
/// [[adapters]]
/// name = "orders-in"
/// uri = "file:///var/spool/orders"
/// direction = "in"
/// channel = "orders"
/// pipeline = ["utf8", "trim"]
/// polling = { interval_secs = 5 }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    pub name: String,
    /// Transport address; the scheme picks the adapter factory.
    pub uri: String,
    pub direction: AdapterDirection,
    /// Channel published to (input) or drained (output).
    pub channel: Option<String>,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    /// Named pipeline stages, run in order.
    pub pipeline: Vec<String>,
}

/// Either one loop every `interval_secs`, or `concurrency` loops each
/// ticking every `frequency_secs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_secs: Option<u64>,
}

impl PollingConfig {
    pub const DEFAULT_SECS: u64 = 1;

    /// Whether this describes concurrent worker loops.
    pub fn is_concurrent(&self) -> bool {
        self.concurrency.is_some()
    }
}

/// Delivery retry settings for output adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub wait_interval_secs: u64,
    /// Address envelopes go to once retries are exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_delivery_address: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivatorStyle {
    #[default]
    OnSend,
    OnReceive,
    Both,
}

/// Binds an input channel to an endpoint resolved by type key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActivatorConfig {
    pub input_channel: String,
    /// Key the endpoint is registered under.
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<String>,
    pub style: ActivatorStyle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Delay before each item's first run.
    pub initial_delay_ms: u64,
    pub items: Vec<ScheduledItemConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 100,
            items: Vec::new(),
        }
    }
}

/// A zero-argument endpoint method invoked every `frequency_secs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduledItemConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub frequency_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<String>,
}
