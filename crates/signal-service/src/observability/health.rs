//! Liveness and readiness endpoints.
//!
//! - `GET /health` answers `OK` while the process serves requests. It checks
//!   no dependency, so a slow Redis never gets the pod restarted.
//! - `GET /ready` answers 200 only while the listener is accepting and every
//!   registered [`DependencyCheck`] passes: Redis must answer `PING` and
//!   Postgres must run `SELECT 1`. Failures are logged server-side; the
//!   response names the failing dependency but never the error text.
//!
//! `/metrics` is mounted next to these by `main`.

use crate::errors::SignalError;
use crate::store::RedisStore;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Upper bound on one dependency check.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// A dependency `/ready` must reach.
#[async_trait]
pub trait DependencyCheck: Send + Sync {
    /// Name reported in the readiness body.
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<(), SignalError>;
}

#[async_trait]
impl DependencyCheck for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check(&self) -> Result<(), SignalError> {
        self.ping().await
    }
}

/// `SELECT 1` against the call database.
pub struct PostgresCheck {
    pool: PgPool,
}

impl PostgresCheck {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DependencyCheck for PostgresCheck {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> Result<(), SignalError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| SignalError::Database(e.to_string()))
    }
}

/// Body of `/ready`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ReadinessResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

/// Shared by the health handlers and `main`.
pub struct HealthState {
    accepting: AtomicBool,
    checks: Vec<Arc<dyn DependencyCheck>>,
}

impl HealthState {
    /// Not accepting until [`HealthState::set_ready`].
    pub fn new(checks: Vec<Arc<dyn DependencyCheck>>) -> Self {
        Self {
            accepting: AtomicBool::new(false),
            checks,
        }
    }

    /// The listener is bound.
    pub fn set_ready(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Shutdown started; drain traffic away.
    pub fn set_not_ready(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run every check in order and return the first failure.
    pub async fn first_failing(&self) -> Option<&'static str> {
        for check in &self.checks {
            let name = check.name();
            match tokio::time::timeout(CHECK_TIMEOUT, check.check()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target: "sig.health", dependency = name, error = %e, "Readiness check failed");
                    return Some(name);
                }
                Err(_) => {
                    warn!(target: "sig.health", dependency = name, "Readiness check timed out");
                    return Some(name);
                }
            }
        }
        None
    }
}

pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(state)
}

async fn liveness() -> &'static str {
    "OK"
}

#[tracing::instrument(skip_all, name = "sig.health.readiness")]
async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if !state.is_accepting() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                dependency: None,
                error: Some("Service is not accepting traffic"),
            }),
        );
    }
    match state.first_failing().await {
        Some(dependency) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "not_ready",
                dependency: Some(dependency),
                error: Some("Service dependencies unavailable"),
            }),
        ),
        None => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                dependency: None,
                error: None,
            }),
        ),
    }
}
