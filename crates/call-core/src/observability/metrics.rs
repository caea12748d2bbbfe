//! Metrics definitions for the call core.
//!
//! All metrics follow Prometheus naming conventions:
//! - `call_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! The library only records through the `metrics` facade. Installing an
//! exporter is the embedding application's job.
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: success/error or a small fixed set per metric
//! - `operation`: REST operations (11 values)
//! - `message_type`: signaling wire types (~8 values)
//! - `disposition`: delivered, buffered, dropped
//! - `error_type`: bounded by `CallError::error_type`

use metrics::{counter, histogram};
use std::time::Duration;

// ============================================================================
// Call lifecycle
// ============================================================================

/// Record a connect attempt.
///
/// Metrics: `call_connect_total`, `call_connect_duration_seconds`
/// Labels: `outcome` (success, error), `error_type`
pub fn record_connect(outcome: &'static str, error_type: Option<&'static str>, duration: Duration) {
    histogram!("call_connect_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
    counter!(
        "call_connect_total",
        "outcome" => outcome,
        "error_type" => error_type.unwrap_or("none")
    )
    .increment(1);
}

/// Record a call ending.
///
/// Metric: `call_ended_total`
/// Labels: `reason` (local_hangup, remote_ended, failed, connection_lost, connect_failed)
pub fn record_call_ended(reason: &'static str) {
    counter!("call_ended_total", "reason" => reason).increment(1);
}

// ============================================================================
// Negotiation
// ============================================================================

/// Record one pass of the offer loop.
///
/// Metric: `call_negotiations_total`
/// Labels: `outcome` (offered, deferred, failed)
pub fn record_negotiation(outcome: &'static str) {
    counter!("call_negotiations_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record a signaling message passing through a queue.
///
/// Metric: `call_signaling_messages_total`
/// Labels: `direction` (outbound, inbound), `message_type`, `disposition`
pub fn record_signaling_message(
    direction: &'static str,
    message_type: &'static str,
    disposition: &'static str,
) {
    counter!(
        "call_signaling_messages_total",
        "direction" => direction,
        "message_type" => message_type,
        "disposition" => disposition
    )
    .increment(1);
}

// ============================================================================
// Tracks
// ============================================================================

/// Record a pull batch and its per-track results.
///
/// Metrics: `call_track_pulls_total`, `call_pulled_tracks_total`
/// Labels: `outcome` (success, error); `result` (subscribed, failed)
pub fn record_pull(outcome: &'static str, subscribed: usize, failed: usize) {
    counter!("call_track_pulls_total", "outcome" => outcome).increment(1);
    counter!("call_pulled_tracks_total", "result" => "subscribed")
        .increment(u64::try_from(subscribed).unwrap_or(u64::MAX));
    counter!("call_pulled_tracks_total", "result" => "failed")
        .increment(u64::try_from(failed).unwrap_or(u64::MAX));
}

// ============================================================================
// Control plane
// ============================================================================

/// Record a control-plane request.
///
/// Metrics: `call_api_requests_total`, `call_api_request_duration_seconds`
/// Labels: `operation`, `status` (2xx, 4xx, 5xx, error)
pub fn record_api_request(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!("call_api_request_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
    counter!("call_api_requests_total", "operation" => operation, "status" => status)
        .increment(1);
}

/// Collapse an HTTP status code into a bounded label.
#[must_use]
pub fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}
