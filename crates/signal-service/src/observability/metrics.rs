//! Metric definitions for the signaling service.
//!
//! Naming follows Prometheus conventions: `sig_` prefix, `_total` suffix for
//! counters and `_seconds` for duration histograms. Every label is bounded by
//! an enum in this crate.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sig_db".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Record a repository query.
///
/// Metric: `sig_db_query_duration_seconds`, `sig_db_queries_total`
/// Labels: `operation`, `status` (success, error)
pub fn record_db_query(operation: &str, status: &str, duration: Duration) {
    histogram!(
        "sig_db_query_duration_seconds",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
    counter!(
        "sig_db_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// A call reached the active state.
pub fn record_call_started() {
    counter!("sig_calls_started_total").increment(1);
}

/// A call finished.
///
/// Labels: `reason` (bounded by `EndReason`)
pub fn record_call_ended(reason: &'static str) {
    counter!("sig_calls_ended_total", "reason" => reason).increment(1);
}

/// A participant missed their heartbeat window.
pub fn record_participant_dead() {
    counter!("sig_participants_dead_total").increment(1);
}

/// Adjust the open-session gauge.
///
/// Labels: `kind` (call, notification)
pub fn session_opened(kind: &'static str) {
    gauge!("sig_sessions_active", "kind" => kind).increment(1.0);
}

pub fn session_closed(kind: &'static str) {
    gauge!("sig_sessions_active", "kind" => kind).decrement(1.0);
}

/// The monitor finished a call whose manager disappeared.
///
/// Non-zero values mean a process died mid-call.
pub fn record_forced_cleanup() {
    counter!("sig_forced_cleanups_total").increment(1);
}

/// ALERT: any non-zero value indicates a bug.
pub fn record_manager_panic() {
    counter!("sig_manager_panics_total").increment(1);
}

/// Record an error returned to a client.
///
/// Labels: `error_type` (bounded by `SignalError::error_type_label`)
pub fn record_error(error_type: &'static str) {
    counter!("sig_errors_total", "error_type" => error_type).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder the macros are no-ops; these only verify
    // the helpers don't panic on any label.
    #[test]
    fn test_helpers_without_recorder() {
        record_db_query("find_call", "success", Duration::from_millis(3));
        record_call_started();
        record_call_ended("normal");
        record_participant_dead();
        session_opened("call");
        session_closed("call");
        record_forced_cleanup();
        record_manager_panic();
        record_error("store");
    }
}
