//! Signal Service
//!
//! Call signaling and push-notification WebSocket server.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to Redis (coordination store) and Postgres (call rows)
//! 4. Start the manager monitor
//! 5. Serve the call API, WebSocket, health and metrics routes on one listener
//! 6. Wait for shutdown signal, then cancel every session and the monitor

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::jwt::TokenSigner;
use common::secret::ExposeSecret;
use signal_service::api::{api_router, ApiState};
use signal_service::call::{CallContext, CallService, Monitor};
use signal_service::config::Config;
use signal_service::notification::{ChatUpdateNotifier, NotificationContext};
use signal_service::observability::{
    env_filter, health_router, init_metrics_recorder, DependencyCheck, HealthState, PostgresCheck,
};
use signal_service::repositories::{PgCallRepository, PgSessionDirectory, SessionDirectory};
use signal_service::store::{CoordinationStore, RedisStore};
use signal_service::ws::{ws_router, WsState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to sessions and managers to run their exit paths.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Signal Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        token_issuer = %config.token_issuer,
        user_ttl_seconds = config.timings.user_ttl.as_secs(),
        manager_ttl_seconds = config.timings.manager_ttl.as_secs(),
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    info!("Connecting to Redis...");
    let redis = Arc::new(RedisStore::connect(config.redis_url.expose_secret()).await?);
    let store: Arc<dyn CoordinationStore> = Arc::clone(&redis) as Arc<dyn CoordinationStore>;
    info!("Redis connection established");

    info!("Connecting to database...");
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;
    info!("Database connection established");

    let health_state = Arc::new(HealthState::new(vec![
        redis as Arc<dyn DependencyCheck>,
        Arc::new(PostgresCheck::new(db_pool.clone())) as Arc<dyn DependencyCheck>,
    ]));

    let timings = config.timings();
    let signer = Arc::new(TokenSigner::new(&config.token_secret, config.token_issuer.clone()));
    let directory = Arc::new(PgSessionDirectory::new(db_pool.clone()));
    let notifications = NotificationContext::new(
        Arc::clone(&store),
        Arc::clone(&directory) as Arc<dyn SessionDirectory>,
        Arc::clone(&signer),
        timings,
    );
    let calls = CallContext::new(
        Arc::clone(&store),
        Arc::new(PgCallRepository::new(db_pool)),
        Arc::new(ChatUpdateNotifier::new(notifications.sender())),
        Arc::clone(&signer),
        timings,
    );
    let api_state = Arc::new(ApiState {
        calls: CallService::new(calls.clone(), notifications.sender()),
        directory,
        signer,
    });

    let shutdown_token = CancellationToken::new();

    let monitor_task = Monitor::new(calls.clone()).spawn(shutdown_token.child_token());
    info!("Manager monitor started");

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let ws_state = Arc::new(WsState {
        calls,
        notifications,
        shutdown: shutdown_token.child_token(),
    });
    let app = api_router(api_state)
        .merge(ws_router(ws_state))
        .merge(health_router(Arc::clone(&health_state)))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        e
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        e
    })?;
    info!(addr = %addr, "Signal Service listening");
    health_state.set_ready();

    let server_token = shutdown_token.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        server_token.cancel();
    });
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server failed");
    }

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, monitor_task).await.is_err() {
        warn!("Monitor did not stop within the grace period");
    }

    info!("Signal Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
