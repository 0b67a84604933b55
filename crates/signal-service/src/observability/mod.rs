//! Observability for the signaling service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit field
//! allow-listing. Tokens and signaling payloads never appear in spans.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sig_calls_started_total` | Counter | none | Calls that reached the active state |
//! | `sig_calls_ended_total` | Counter | `reason` | Finished calls by end reason |
//! | `sig_participants_dead_total` | Counter | none | Heartbeat expirations |
//! | `sig_sessions_active` | Gauge | `kind` | Open websocket sessions |
//! | `sig_forced_cleanups_total` | Counter | none | Monitor-driven cleanups of dead managers |
//! | `sig_manager_panics_total` | Counter | none | Manager loops that panicked |
//! | `sig_errors_total` | Counter | `error_type` | Errors surfaced to clients |
//! | `sig_db_query_duration_seconds` | Histogram | `operation`, `status` | Repository latency |

pub mod health;
pub mod metrics;

pub use self::health::{health_router, DependencyCheck, HealthState, PostgresCheck};
pub use self::metrics::init_metrics_recorder;

use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset. Service code logs under the
/// `sig.*` targets rather than its module path.
pub const DEFAULT_LOG_FILTER: &str = "signal_service=info,sig=info,common=info,tower_http=info";

/// `RUST_LOG` if set, else [`DEFAULT_LOG_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_default_filter_keeps_service_targets() {
        let subscriber = tracing_subscriber::registry().with(EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(target: "sig.call.manager", Level::WARN));
            assert!(tracing::enabled!(target: "sig.sched.lock", Level::INFO));
            assert!(tracing::enabled!(target: "sig.noti.session", Level::INFO));
            assert!(!tracing::enabled!(target: "sig.call.manager", Level::DEBUG));
            assert!(!tracing::enabled!(target: "hyper::proto", Level::INFO));
        });
    }
}
