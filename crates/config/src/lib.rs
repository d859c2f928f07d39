//! Configuration loading, validation and env substitution.
//!
//! Config files: `switchyard.toml`, `switchyard.yaml`, `switchyard.yml` or
//! `switchyard.json`, searched in `./` then the user config directory.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config, parse_config},
    schema::{
        ActivatorConfig, ActivatorStyle, AdapterConfig, AdapterDirection, BusConfig, MetricsConfig, PollingConfig,
        RetryConfig, ScheduledItemConfig, SchedulerConfig, TelemetryConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, check_config, validate, validate_toml_str},
};
