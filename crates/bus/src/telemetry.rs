//! Logging and metrics setup for processes hosting a bus.

use {
    switchyard_config::TelemetryConfig,
    switchyard_metrics::{MetricsHandle, MetricsRecorderConfig, init_metrics},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

/// Install the global tracing subscriber. `RUST_LOG` overrides `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_telemetry(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .try_init()?;
    }
    Ok(())
}

/// Logging plus the metrics recorder, both from the `[telemetry]` section.
pub fn init(config: &TelemetryConfig) -> anyhow::Result<MetricsHandle> {
    init_telemetry(&config.level, config.json)?;
    init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config
            .metrics
            .labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    })
}
