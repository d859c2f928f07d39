//! Metric name and label definitions.
//!
//! All metric names used across the bus live here so dashboards have one
//! place to look.

/// Channel metrics
pub mod channel {
    /// Envelopes enqueued on a channel
    pub const MESSAGES_SENT_TOTAL: &str = "switchyard_channel_messages_sent_total";
    /// Envelopes dequeued from a channel
    pub const MESSAGES_RECEIVED_TOTAL: &str = "switchyard_channel_messages_received_total";
    /// Current queue depth
    pub const DEPTH: &str = "switchyard_channel_depth";
    /// Number of registered channels
    pub const ACTIVE: &str = "switchyard_channels_active";
}

/// Channel adapter metrics
pub mod adapter {
    /// Envelopes published by input adapters
    pub const MESSAGES_PUBLISHED_TOTAL: &str = "switchyard_adapter_messages_published_total";
    /// Envelopes delivered by output adapters
    pub const MESSAGES_DELIVERED_TOTAL: &str = "switchyard_adapter_messages_delivered_total";
    /// Delivery attempts, successful or not
    pub const DELIVERY_ATTEMPTS_TOTAL: &str = "switchyard_adapter_delivery_attempts_total";
    /// Envelopes that exhausted their retry policy
    pub const NON_DELIVERED_TOTAL: &str = "switchyard_adapter_non_delivered_total";
    /// Envelopes forwarded to a failure address
    pub const FORWARDED_TOTAL: &str = "switchyard_adapter_forwarded_total";
    /// Poll or delivery errors
    pub const ERRORS_TOTAL: &str = "switchyard_adapter_errors_total";
    /// Time spent delivering one envelope, retries included
    pub const DELIVERY_DURATION_SECONDS: &str = "switchyard_adapter_delivery_duration_seconds";
    /// Number of running adapters
    pub const RUNNING: &str = "switchyard_adapters_running";
}

/// Endpoint activation metrics
pub mod endpoint {
    /// Handler invocations
    pub const INVOCATIONS_TOTAL: &str = "switchyard_endpoint_invocations_total";
    /// Handler invocation duration in seconds
    pub const INVOCATION_DURATION_SECONDS: &str = "switchyard_endpoint_invocation_duration_seconds";
    /// Activation failures
    pub const ERRORS_TOTAL: &str = "switchyard_endpoint_errors_total";
    /// Expired envelopes skipped
    pub const EXPIRED_TOTAL: &str = "switchyard_endpoint_expired_total";
}

/// Message-handling strategy metrics
pub mod strategy {
    /// Completed aggregations, batches and routings
    pub const COMPLETIONS_TOTAL: &str = "switchyard_strategy_completions_total";
    /// Items held by accumulators awaiting flush
    pub const PENDING_ITEMS: &str = "switchyard_strategy_pending_items";
    /// Router decisions that fell back to the default channel
    pub const ROUTE_FALLBACK_TOTAL: &str = "switchyard_strategy_route_fallback_total";
    /// Unroutable envelopes
    pub const UNROUTABLE_TOTAL: &str = "switchyard_strategy_unroutable_total";
}

/// Scheduler metrics
pub mod scheduler {
    /// Number of armed items
    pub const ITEMS_SCHEDULED: &str = "switchyard_scheduler_items_scheduled";
    /// Item executions
    pub const EXECUTIONS_TOTAL: &str = "switchyard_scheduler_executions_total";
    /// Item execution duration in seconds
    pub const EXECUTION_DURATION_SECONDS: &str = "switchyard_scheduler_execution_duration_seconds";
    /// Item execution failures
    pub const ERRORS_TOTAL: &str = "switchyard_scheduler_errors_total";
}

/// Common label keys used across metrics
pub mod labels {
    pub const CHANNEL: &str = "channel";
    pub const ADAPTER: &str = "adapter";
    pub const SCHEME: &str = "scheme";
    pub const ENDPOINT: &str = "endpoint";
    pub const METHOD: &str = "method";
    pub const STRATEGY: &str = "strategy";
    pub const ITEM: &str = "item";
    pub const ERROR_TYPE: &str = "error_type";
    pub const SUCCESS: &str = "success";
}

/// Standard histogram buckets
pub mod buckets {
    /// Handler and delivery durations, 1ms to 60s
    pub const DURATION: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    /// Deliveries that went through retries wait whole seconds, up to 10 minutes
    pub const RETRY_DURATION: &[f64] = &[
        0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
    ];
}
