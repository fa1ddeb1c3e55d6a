//! Prometheus metrics for publishing and consumption

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};

/// Broker metrics
pub struct BrokerMetrics {
    /// Messages handed to the broker successfully
    pub messages_published: CounterVec,

    /// Publish attempts that failed
    pub publish_failures: CounterVec,

    /// Payloads put back at the head of the buffer after a failed attempt
    pub messages_requeued: CounterVec,

    /// Deliveries received by subscribers
    pub messages_consumed: CounterVec,

    /// Deliveries positively acknowledged
    pub messages_accepted: CounterVec,

    /// Deliveries rejected towards the dead-letter exchange
    pub messages_rejected: CounterVec,

    /// Connection re-establishments
    pub reconnects: CounterVec,

    /// Entries waiting in a publisher buffer
    pub buffer_depth: GaugeVec,
}

lazy_static! {
    pub static ref BROKER_METRICS: BrokerMetrics = BrokerMetrics {
        messages_published: register_counter_vec!(
            "broker_messages_published_total",
            "Total number of messages published",
            &["exchange"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "broker_publish_failures_total",
            "Total number of failed publish attempts",
            &["exchange", "error"]
        )
        .unwrap(),

        messages_requeued: register_counter_vec!(
            "broker_messages_requeued_total",
            "Total number of payloads requeued after a failed publish",
            &["exchange"]
        )
        .unwrap(),

        messages_consumed: register_counter_vec!(
            "broker_messages_consumed_total",
            "Total number of deliveries received",
            &["queue"]
        )
        .unwrap(),

        messages_accepted: register_counter_vec!(
            "broker_messages_accepted_total",
            "Total number of deliveries acknowledged",
            &["queue"]
        )
        .unwrap(),

        messages_rejected: register_counter_vec!(
            "broker_messages_rejected_total",
            "Total number of deliveries rejected",
            &["queue"]
        )
        .unwrap(),

        reconnects: register_counter_vec!(
            "broker_reconnects_total",
            "Total number of connection re-establishments",
            &["component"]
        )
        .unwrap(),

        buffer_depth: register_gauge_vec!(
            "broker_buffer_depth",
            "Entries waiting in the publisher buffer",
            &["exchange"]
        )
        .unwrap(),
    };
}

/// Initialize broker metrics
pub fn init_broker_metrics() {
    lazy_static::initialize(&BROKER_METRICS);
}

/// Render the default registry in the text exposition format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
