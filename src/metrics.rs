// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the checkout and reconciliation paths.
// Scraped from GET /metrics.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: outcome (success, insufficient_stock, price_mismatch, gateway_error, ...)
pub const CHECKOUT_ATTEMPTS_TOTAL: &str = "checkout_attempts_total";

/// Labels: outcome (processed, ignored, invalid_signature), reason
pub const WEBHOOK_NOTIFICATIONS_TOTAL: &str = "webhook_notifications_total";

/// Labels: operation (reserve, release)
pub const STOCK_MUTATIONS_TOTAL: &str = "stock_mutations_total";

/// Labels: operation (create_session, transaction_status), status (success/failed)
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";

/// Labels: to (new order status), source (webhook, poller, user)
pub const ORDER_TRANSITIONS_TOTAL: &str = "order_transitions_total";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Installs the global Prometheus recorder and returns the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let latency_buckets = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(GATEWAY_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request latency in seconds"
    );
    describe_counter!(
        CHECKOUT_ATTEMPTS_TOTAL,
        "Checkout attempts by outcome"
    );
    describe_counter!(
        WEBHOOK_NOTIFICATIONS_TOTAL,
        "Gateway notifications by outcome"
    );
    describe_counter!(
        STOCK_MUTATIONS_TOTAL,
        "Size stock units reserved or released"
    );
    describe_histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        "Payment gateway call latency in seconds"
    );
    describe_counter!(
        ORDER_TRANSITIONS_TOTAL,
        "Order status transitions by target status and source"
    );

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_checkout(outcome: &str) {
    counter!(CHECKOUT_ATTEMPTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_webhook(outcome: &str, reason: &str) {
    counter!(
        WEBHOOK_NOTIFICATIONS_TOTAL,
        "outcome" => outcome.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Counts stock units, not rows.
pub fn record_stock_mutation(operation: &str, units: i32) {
    counter!(STOCK_MUTATIONS_TOTAL, "operation" => operation.to_string())
        .increment(units.max(0) as u64);
}

pub fn record_gateway_call(operation: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failed" };
    histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

pub fn record_transition(to: &str, source: &str) {
    counter!(
        ORDER_TRANSITIONS_TOTAL,
        "to" => to.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}
