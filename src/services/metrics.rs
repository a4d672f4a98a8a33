use prometheus::{Encoder, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
static CHECKOUTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REFUND_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Install the registry and counters. Call once at startup; recording
/// helpers are no-ops until then so unit tests need no setup.
pub fn init_metrics() {
    let registry = Registry::new();

    let checkouts = IntCounterVec::new(
        Opts::new("checkouts_total", "Checkout flow outcomes"),
        &["outcome"],
    )
    .expect("failed to create checkouts_total metric");

    let refunds = IntCounterVec::new(
        Opts::new("refund_requests_total", "Refund request outcomes"),
        &["result"],
    )
    .expect("failed to create refund_requests_total metric");

    registry
        .register(Box::new(checkouts.clone()))
        .expect("failed to register checkouts_total");
    registry
        .register(Box::new(refunds.clone()))
        .expect("failed to register refund_requests_total");

    let _ = PROMETHEUS_REGISTRY.set(registry);
    let _ = CHECKOUTS_TOTAL.set(checkouts);
    let _ = REFUND_REQUESTS_TOTAL.set(refunds);

    tracing::info!("Prometheus metrics initialized");
}

pub fn get_metrics() -> String {
    let Some(registry) = PROMETHEUS_REGISTRY.get() else {
        return "# metrics not initialized\n".to_string();
    };
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_checkout(outcome: &str) {
    if let Some(counter) = CHECKOUTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_refund_request(result: &str) {
    if let Some(counter) = REFUND_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}
