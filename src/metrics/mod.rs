//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction submission and outcome
//! - Live chain listeners and dispatched events
//! - Transport reconnects
//! - Receipts still waiting for block inclusion

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    // Transaction metrics
    pub static ref TX_SUBMITTED: Counter = register_counter!(
        "dbcp_transactions_submitted_total",
        "Total transactions broadcast to the node"
    ).unwrap();

    pub static ref TX_SUCCEEDED: Counter = register_counter!(
        "dbcp_transactions_succeeded_total",
        "Total transactions mined without exhausting gas"
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "dbcp_transactions_failed_total",
        "Total failed executor operations by error kind",
        &["reason"]
    ).unwrap();

    pub static ref TX_LATENCY: Histogram = register_histogram!(
        "dbcp_transaction_latency_seconds",
        "Time from executor call to mined receipt",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Event metrics
    pub static ref LISTENERS_ACTIVE: Gauge = register_gauge!(
        "dbcp_event_listeners_active",
        "Live node-side log listeners held by the event hub"
    ).unwrap();

    pub static ref EVENTS_DISPATCHED: CounterVec = register_counter_vec!(
        "dbcp_events_dispatched_total",
        "Total events handed to subscriber callbacks",
        &["event"]
    ).unwrap();

    // Connection metrics
    pub static ref RESUBSCRIBES: Counter = register_counter!(
        "dbcp_resubscribes_total",
        "Total transport reconnects followed by a resubscribe"
    ).unwrap();

    pub static ref PENDING_RECEIPTS: Gauge = register_gauge!(
        "dbcp_pending_receipts",
        "Transactions waiting for their block to be observed"
    ).unwrap();
}

/// Render all registered metrics in the text exposition format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// Helper functions to record metrics

pub fn record_tx_submitted() {
    TX_SUBMITTED.inc();
}

pub fn record_tx_succeeded(latency_secs: f64) {
    TX_SUCCEEDED.inc();
    TX_LATENCY.observe(latency_secs);
}

pub fn record_tx_failed(reason: &str) {
    TX_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_listener_started() {
    LISTENERS_ACTIVE.inc();
}

pub fn record_listener_stopped() {
    LISTENERS_ACTIVE.dec();
}

pub fn record_event_dispatched(event_name: &str) {
    EVENTS_DISPATCHED.with_label_values(&[event_name]).inc();
}

pub fn record_resubscribe() {
    RESUBSCRIBES.inc();
}

pub fn record_pending_receipts(count: usize) {
    PENDING_RECEIPTS.set(count as f64);
}
