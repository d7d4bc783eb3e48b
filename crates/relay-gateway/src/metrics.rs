//! Metrics instrumentation for the gateway.
//!
//! Uses the `metrics` crate facade; installing an exporter is left to the
//! embedding service.

use metrics::{counter, gauge};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "relay_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "relay_subscriptions_total";
    pub const ACKS_TOTAL: &str = "relay_acks_total";
    pub const SEND_RETRIES_TOTAL: &str = "relay_send_retries_total";
    pub const REPLAYED_TOTAL: &str = "relay_replayed_messages_total";
    pub const BACKPRESSURE_TOTAL: &str = "relay_backpressure_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
    pub const LOOKUP_MISSES_TOTAL: &str = "relay_lookup_misses_total";
}

/// Describe every gateway metric to the installed recorder.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since gateway start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of managed connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames sent or received");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames sent or received");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of registered channels");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_counter!(names::ACKS_TOTAL, "Total number of acknowledgements recorded");
    metrics::describe_counter!(names::SEND_RETRIES_TOTAL, "Total number of send retries");
    metrics::describe_counter!(
        names::REPLAYED_TOTAL,
        "Total number of buffered messages replayed to connections"
    );
    metrics::describe_counter!(
        names::BACKPRESSURE_TOTAL,
        "Sends that left an adapter above the backpressure threshold"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(
        names::LOOKUP_MISSES_TOTAL,
        "Operations ignored because their connection or channel was unknown"
    );

    info!("Metrics initialized");
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

pub fn record_ack(status: &'static str) {
    counter!(names::ACKS_TOTAL, "status" => status).increment(1);
}

pub fn record_send_retry() {
    counter!(names::SEND_RETRIES_TOTAL).increment(1);
}

pub fn record_replayed(count: usize) {
    counter!(names::REPLAYED_TOTAL).increment(count as u64);
}

pub fn record_backpressure() {
    counter!(names::BACKPRESSURE_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Record an operation on an unknown connection or channel.
pub fn record_lookup_miss(kind: &'static str) {
    counter!(names::LOOKUP_MISSES_TOTAL, "kind" => kind).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
