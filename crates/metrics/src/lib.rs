//! Metrics collection and export for switchyard.
//!
//! Every bus crate records through the `metrics` facade when built with its
//! `metrics` feature. Without an installed recorder the calls are no-ops.
//!
//! ```rust,ignore
//! use switchyard_metrics::{channel, counter, labels};
//!
//! counter!(channel::MESSAGES_SENT_TOTAL, labels::CHANNEL => "orders").increment(1);
//! ```
//!
//! # Features
//!
//! - `prometheus`: install a Prometheus recorder and render its text format

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
