//! Signal service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address (WebSocket upgrades, health, metrics).
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default issuer stamped into and required of every token.
pub const DEFAULT_TOKEN_ISSUER: &str = "signal-service";

/// Default mailbox lock heartbeat in seconds. The lease is twice this.
pub const DEFAULT_LOCK_HEARTBEAT_SECONDS: u64 = 30;

/// Default per-participant heartbeat TTL in seconds.
pub const DEFAULT_USER_HEARTBEAT_TTL_SECONDS: u64 = 30;

/// Default call manager liveness TTL in seconds.
pub const DEFAULT_MANAGER_HEARTBEAT_TTL_SECONDS: u64 = 60;

/// Default Ready to Active failure timeout in seconds.
pub const DEFAULT_CALL_FAILURE_TIMEOUT_SECONDS: u64 = 60;

/// Default notification session TTL in seconds.
pub const DEFAULT_NOTIFICATION_SESSION_TTL_SECONDS: u64 = 60;

/// Default WebSocket handshake frame timeout in seconds.
pub const DEFAULT_WS_AUTH_TIMEOUT_SECONDS: u64 = 30;

/// Default call join token lifetime in seconds (3 hours).
pub const DEFAULT_CALL_TOKEN_TTL_SECONDS: u64 = 3 * 60 * 60;

/// Durations that drive the call and notification state machines.
///
/// Threaded into managers, sessions and the monitor so tests can run the
/// same code with sub-second values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimings {
    /// Mailbox consumer lock heartbeat.
    pub lock_heartbeat: Duration,
    /// A participant with no heartbeat for this long is declared dead.
    pub user_ttl: Duration,
    /// A manager with no self-heartbeat for this long is presumed dead.
    pub manager_ttl: Duration,
    /// Ready calls that never reach Active end after this long.
    pub failure_timeout: Duration,
    /// Notification session lifetime without a connection.
    pub session_ttl: Duration,
    /// How long a WebSocket handshake frame may take to arrive.
    pub auth_timeout: Duration,
    /// Lifetime of a call join token.
    pub call_token_ttl: Duration,
}

impl Default for CallTimings {
    fn default() -> Self {
        Self {
            lock_heartbeat: Duration::from_secs(DEFAULT_LOCK_HEARTBEAT_SECONDS),
            user_ttl: Duration::from_secs(DEFAULT_USER_HEARTBEAT_TTL_SECONDS),
            manager_ttl: Duration::from_secs(DEFAULT_MANAGER_HEARTBEAT_TTL_SECONDS),
            failure_timeout: Duration::from_secs(DEFAULT_CALL_FAILURE_TIMEOUT_SECONDS),
            session_ttl: Duration::from_secs(DEFAULT_NOTIFICATION_SESSION_TTL_SECONDS),
            auth_timeout: Duration::from_secs(DEFAULT_WS_AUTH_TIMEOUT_SECONDS),
            call_token_ttl: Duration::from_secs(DEFAULT_CALL_TOKEN_TTL_SECONDS),
        }
    }
}

/// Signal service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (coordination store).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Postgres connection URL (call rows, login users, deliveries).
    pub database_url: SecretString,

    /// HMAC secret for call and session tokens.
    pub token_secret: SecretString,

    /// Token issuer (default: "signal-service").
    pub token_issuer: String,

    /// HTTP bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// State machine durations.
    pub timings: CallTimings,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("database_url", &"[REDACTED]")
            .field("token_secret", &"[REDACTED]")
            .field("token_issuer", &self.token_issuer)
            .field("bind_address", &self.bind_address)
            .field("timings", &self.timings)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Durations threaded to managers and sessions.
    pub fn timings(&self) -> CallTimings {
        self.timings
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(required(vars, "REDIS_URL")?);
        let database_url = SecretString::from(required(vars, "DATABASE_URL")?);
        let token_secret = SecretString::from(required(vars, "TOKEN_SECRET")?);

        let token_issuer = vars
            .get("TOKEN_ISSUER")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TOKEN_ISSUER.to_string());

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let timings = CallTimings {
            lock_heartbeat: seconds(vars, "LOCK_HEARTBEAT_SECONDS", DEFAULT_LOCK_HEARTBEAT_SECONDS)?,
            user_ttl: seconds(
                vars,
                "USER_HEARTBEAT_TTL_SECONDS",
                DEFAULT_USER_HEARTBEAT_TTL_SECONDS,
            )?,
            manager_ttl: seconds(
                vars,
                "MANAGER_HEARTBEAT_TTL_SECONDS",
                DEFAULT_MANAGER_HEARTBEAT_TTL_SECONDS,
            )?,
            failure_timeout: seconds(
                vars,
                "CALL_FAILURE_TIMEOUT_SECONDS",
                DEFAULT_CALL_FAILURE_TIMEOUT_SECONDS,
            )?,
            session_ttl: seconds(
                vars,
                "NOTIFICATION_SESSION_TTL_SECONDS",
                DEFAULT_NOTIFICATION_SESSION_TTL_SECONDS,
            )?,
            auth_timeout: seconds(vars, "WS_AUTH_TIMEOUT_SECONDS", DEFAULT_WS_AUTH_TIMEOUT_SECONDS)?,
            call_token_ttl: seconds(vars, "CALL_TOKEN_TTL_SECONDS", DEFAULT_CALL_TOKEN_TTL_SECONDS)?,
        };

        Ok(Config {
            redis_url,
            database_url,
            token_secret,
            token_issuer,
            bind_address,
            timings,
        })
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = match vars.get(name) {
        None => default,
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue(format!("{name} must be a whole number of seconds")))?,
    };
    if secs == 0 {
        return Err(ConfigError::InvalidValue(format!("{name} must be greater than zero")));
    }
    Ok(Duration::from_secs(secs))
}
