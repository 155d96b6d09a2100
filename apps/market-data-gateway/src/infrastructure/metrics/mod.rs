//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Stream**: frames, dispatched messages, handler failures, protocol errors
//! - **Connection**: state, reconnects, heartbeat misses, tickets in use
//! - **Cache**: reads by tier, upstream fetches, gap slots by status
//! - **Routing**: route decisions, service mode, rate-limiter waits
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "gateway_frames_received_total",
        "Inbound stream frames by transport kind"
    );
    describe_counter!(
        "gateway_messages_dispatched_total",
        "Decoded messages dispatched to handlers by data type"
    );
    describe_counter!(
        "gateway_handler_failures_total",
        "Handler errors and panics caught by the router"
    );
    describe_counter!(
        "gateway_protocol_errors_total",
        "Inbound frame elements that could not be decoded"
    );

    describe_gauge!(
        "gateway_connection_state",
        "Stream connection state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=failed)"
    );
    describe_counter!("gateway_reconnects_total", "Stream reconnection attempts");
    describe_counter!("gateway_heartbeat_missed_total", "Missed heartbeat pongs");
    describe_gauge!("gateway_tickets_in_use", "Live subscription tickets");

    describe_counter!("gateway_cache_reads_total", "Cache reads by serving tier");
    describe_counter!(
        "gateway_upstream_fetches_total",
        "Batch API calls by endpoint and outcome"
    );
    describe_counter!(
        "gateway_gap_slots_total",
        "Slots written by gap-fill, by resulting status"
    );

    describe_counter!("gateway_route_decisions_total", "Requests by routed path");
    describe_gauge!(
        "gateway_service_mode",
        "Fallback mode (0=normal 1=degraded)"
    );
    describe_histogram!(
        "gateway_rate_limit_wait_seconds",
        "Time spent waiting for a rate-limit token"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an inbound frame.
pub fn record_frame_received(kind: &'static str) {
    counter!("gateway_frames_received_total", "kind" => kind).increment(1);
}

/// Record a message dispatched to handlers.
pub fn record_message_dispatched(data_type: &str) {
    counter!(
        "gateway_messages_dispatched_total",
        "data_type" => data_type.to_string()
    )
    .increment(1);
}

/// Record a handler failure.
pub fn record_handler_failure(data_type: &str) {
    counter!(
        "gateway_handler_failures_total",
        "data_type" => data_type.to_string()
    )
    .increment(1);
}

/// Record an undecodable frame element.
pub fn record_protocol_error() {
    counter!("gateway_protocol_errors_total").increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(code: u8) {
    gauge!("gateway_connection_state").set(f64::from(code));
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("gateway_reconnects_total").increment(1);
}

/// Record a missed heartbeat.
pub fn record_heartbeat_missed() {
    counter!("gateway_heartbeat_missed_total").increment(1);
}

/// Update the live ticket gauge.
pub fn set_tickets_in_use(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    let value = count as f64;
    gauge!("gateway_tickets_in_use").set(value);
}

/// Record a cache read served by `tier` (`memory`, `store`, `upstream`).
pub fn record_cache_read(tier: &'static str) {
    counter!("gateway_cache_reads_total", "tier" => tier).increment(1);
}

/// Record a batch API call.
pub fn record_upstream_fetch(endpoint: &'static str, outcome: &'static str) {
    counter!(
        "gateway_upstream_fetches_total",
        "endpoint" => endpoint,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record gap-filled slots by status.
pub fn record_gap_slots(status: &'static str, count: usize) {
    counter!("gateway_gap_slots_total", "status" => status).increment(count as u64);
}

/// Record a routing decision.
pub fn record_route(source: &'static str) {
    counter!("gateway_route_decisions_total", "source" => source).increment(1);
}

/// Update the service mode gauge.
pub fn set_service_mode(degraded: bool) {
    gauge!("gateway_service_mode").set(if degraded { 1.0 } else { 0.0 });
}

/// Record time spent waiting on a rate limiter.
pub fn record_rate_limit_wait(limiter: &str, waited: Duration) {
    histogram!(
        "gateway_rate_limit_wait_seconds",
        "limiter" => limiter.to_string()
    )
    .record(waited.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received("text");
        record_message_dispatched("ticker");
        record_gap_slots("empty", 3);
        record_rate_limit_wait("rest", Duration::from_millis(5));
        set_tickets_in_use(2);
        set_service_mode(true);
    }
}
