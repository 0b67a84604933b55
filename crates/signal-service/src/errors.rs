//! Signal service error types.
//!
//! One tagged error kind per failure class. Validation and authorization
//! errors abort a single request or frame and are reported to the caller.
//! Store errors are transient: loops log them and treat the tick as a no-op.
//! Internal details are logged server-side but not exposed to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::jwt::TokenError;
use serde::Serialize;
use thiserror::Error;

/// Signal service error type.
///
/// Codes follow the client-facing code table:
/// - 300 bad request, 401 unauthorized, 403 forbidden, 1005 credentials expired
/// - 3001..=3009 call-specific conditions
/// - 500 internal (store, database, config, cancellation)
#[derive(Debug, Error)]
pub enum SignalError {
    /// Malformed action, frame or argument.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid token.
    #[error("Unauthorized")]
    Unauthorized,

    /// Token was valid but has expired.
    #[error("Credentials expired")]
    CredentialsExpired,

    /// Caller is not a participant of the call.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Call already ended or otherwise in the wrong status.
    #[error("Call status invalid")]
    CallStatusInvalid,

    /// Call has not finished setup yet.
    #[error("Call status not ready")]
    StatusNotReady,

    /// Not enough participants to place the call.
    #[error("Member count not enough")]
    MemberCountNotEnough,

    /// The per-user exclusivity lock is held by another call.
    #[error("User lock invalid")]
    UserLockInvalid,

    /// Another manager instance already owns the call.
    #[error("Call manager locked")]
    ManagerLocked,

    /// No live manager mailbox for the call.
    #[error("Call manager not found")]
    ManagerNotFound,

    /// No call row with this id.
    #[error("Call not found")]
    CallNotFound,

    /// Fewer than two participants obtained their exclusivity lock.
    #[error("Callee busy")]
    CalleeBusy,

    /// The caller's own exclusivity lock could not be obtained.
    #[error("Caller busy")]
    CallerBusy,

    /// No live session mailbox for the participant.
    #[error("Session not found")]
    SessionNotFound,

    /// Target mailbox was never activated or has been torn down.
    #[error("Mailbox state key does not exist")]
    MailboxInactive,

    /// The owning loop or mailbox has been cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Coordination store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Relational store operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalError {
    /// Returns the client-facing error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            SignalError::BadRequest(_) => 300,
            SignalError::Unauthorized => 401,
            SignalError::Forbidden(_) => 403,
            SignalError::CredentialsExpired => 1005,
            SignalError::CallStatusInvalid => 3001,
            SignalError::MemberCountNotEnough => 3002,
            SignalError::UserLockInvalid => 3003,
            SignalError::ManagerLocked => 3004,
            SignalError::ManagerNotFound => 3005,
            SignalError::CallNotFound => 3006,
            SignalError::CalleeBusy => 3007,
            SignalError::CallerBusy => 3008,
            SignalError::StatusNotReady => 3009,
            SignalError::SessionNotFound
            | SignalError::MailboxInactive
            | SignalError::Cancelled
            | SignalError::Store(_)
            | SignalError::Database(_)
            | SignalError::Config(_)
            | SignalError::Internal(_) => 500,
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SignalError::BadRequest(msg) | SignalError::Forbidden(msg) => msg.clone(),
            SignalError::SessionNotFound
            | SignalError::MailboxInactive
            | SignalError::Cancelled
            | SignalError::Store(_)
            | SignalError::Database(_)
            | SignalError::Config(_)
            | SignalError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Bounded label for the `signal_errors_total` metric.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SignalError::BadRequest(_) => "bad_request",
            SignalError::Unauthorized | SignalError::CredentialsExpired => "unauthorized",
            SignalError::Forbidden(_) => "forbidden",
            SignalError::CallStatusInvalid | SignalError::StatusNotReady => "status",
            SignalError::CallerBusy | SignalError::CalleeBusy | SignalError::UserLockInvalid => {
                "lock_busy"
            }
            SignalError::ManagerLocked => "manager_locked",
            SignalError::MemberCountNotEnough => "member_count",
            SignalError::CallNotFound
            | SignalError::ManagerNotFound
            | SignalError::SessionNotFound => "not_found",
            SignalError::MailboxInactive => "mailbox_inactive",
            SignalError::Cancelled => "cancelled",
            SignalError::Store(_) => "store",
            SignalError::Database(_) => "database",
            SignalError::Config(_) => "config",
            SignalError::Internal(_) => "internal",
        }
    }

    /// True for coordination-store I/O failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, SignalError::Store(_))
    }

    /// HTTP status for the call API.
    pub fn http_status(&self) -> StatusCode {
        match self {
            SignalError::BadRequest(_) | SignalError::MemberCountNotEnough => {
                StatusCode::BAD_REQUEST
            }
            SignalError::Unauthorized | SignalError::CredentialsExpired => StatusCode::UNAUTHORIZED,
            SignalError::Forbidden(_) => StatusCode::FORBIDDEN,
            SignalError::CallNotFound | SignalError::ManagerNotFound => StatusCode::NOT_FOUND,
            SignalError::CallStatusInvalid
            | SignalError::StatusNotReady
            | SignalError::CallerBusy
            | SignalError::CalleeBusy
            | SignalError::UserLockInvalid
            | SignalError::ManagerLocked => StatusCode::CONFLICT,
            SignalError::Store(_) | SignalError::MailboxInactive | SignalError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SignalError::SessionNotFound
            | SignalError::Database(_)
            | SignalError::Config(_)
            | SignalError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body of a failed API request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub message: String,
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            tracing::error!(target: "sig.api", error = %self, "Request failed");
        } else {
            tracing::debug!(target: "sig.api", error = %self, "Request rejected");
        }
        crate::observability::metrics::record_error(self.error_type_label());
        let body = ErrorResponse {
            code: self.error_code(),
            message: self.client_message(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<TokenError> for SignalError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => SignalError::CredentialsExpired,
            TokenError::Signing(e) => SignalError::Internal(e),
            TokenError::TooLarge | TokenError::Invalid => SignalError::Unauthorized,
        }
    }
}

impl From<redis::RedisError> for SignalError {
    fn from(err: redis::RedisError) -> Self {
        SignalError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::BadRequest(format!("invalid payload: {err}"))
    }
}
