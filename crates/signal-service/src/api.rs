//! HTTP call API.
//!
//! - `POST /api/v1/calls` - Place a call, body `{"roomId", "calleeIds"}`
//! - `GET /api/v1/calls/{call_id}` - Call row, members only
//! - `POST /api/v1/calls/{call_id}/join` - Accept and get the call socket token
//! - `POST /api/v1/calls/{call_id}/hangup` - Reject before accepting, leave after
//! - `GET /api/v1/calls/{call_id}/handled` - Whether this user already acted on the call
//!
//! Every route takes `Authorization: Bearer <login token>`, the token the
//! notification socket authenticates with. The login is resolved to a user
//! before the handler runs.

use crate::call::types::Call;
use crate::call::CallService;
use crate::errors::SignalError;
use crate::repositories::SessionDirectory;
use axum::extract::{Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use common::jwt::TokenSigner;
use common::types::{CallId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Shared state of the API routes.
pub struct ApiState {
    pub calls: CallService,
    pub directory: Arc<dyn SessionDirectory>,
    pub signer: Arc<TokenSigner>,
}

/// The authenticated user, inserted by the auth middleware.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub room_id: u64,
    pub callee_ids: Vec<UserId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallResponse {
    pub call_id: CallId,
}

#[derive(Debug, Serialize)]
pub struct JoinCallResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct HandledResponse {
    pub handled: bool,
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/calls", post(create_call))
        .route("/api/v1/calls/:call_id", get(call_info))
        .route("/api/v1/calls/:call_id/join", post(join_call))
        .route("/api/v1/calls/:call_id/hangup", post(hangup_call))
        .route("/api/v1/calls/:call_id/handled", get(is_handled))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_login,
        ))
        .with_state(state)
}

fn bearer_token(req: &Request) -> Result<&str, SignalError> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            debug!(target: "sig.api.auth", "Missing Authorization header");
            SignalError::Unauthorized
        })?;
    header.strip_prefix("Bearer ").ok_or_else(|| {
        debug!(target: "sig.api.auth", "Invalid Authorization header format");
        SignalError::Unauthorized
    })
}

/// Verify the login token and attach the [`AuthUser`] it belongs to.
#[instrument(skip_all, name = "sig.api.auth")]
async fn require_login(
    State(state): State<Arc<ApiState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, SignalError> {
    let token = bearer_token(&req)?;
    let login_id = state.signer.verify(token)?;
    let user_id = state
        .directory
        .resolve_login(&login_id)
        .await?
        .ok_or(SignalError::Unauthorized)?;
    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn create_call(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(request): Json<CreateCallRequest>,
) -> Result<Json<CreateCallResponse>, SignalError> {
    let call_id = state
        .calls
        .create_call(user_id, request.room_id, &request.callee_ids)
        .await?;
    Ok(Json(CreateCallResponse { call_id }))
}

async fn call_info(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(call_id): Path<CallId>,
) -> Result<Json<Call>, SignalError> {
    Ok(Json(state.calls.call_info(user_id, call_id).await?))
}

async fn join_call(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(call_id): Path<CallId>,
) -> Result<Json<JoinCallResponse>, SignalError> {
    let token = state.calls.join_call(user_id, call_id).await?;
    Ok(Json(JoinCallResponse { token }))
}

async fn hangup_call(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(call_id): Path<CallId>,
) -> Result<Json<serde_json::Value>, SignalError> {
    state.calls.hangup_call(user_id, call_id).await?;
    Ok(Json(serde_json::json!({})))
}

async fn is_handled(
    State(state): State<Arc<ApiState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(call_id): Path<CallId>,
) -> Result<Json<HandledResponse>, SignalError> {
    let handled = state.calls.is_handled(user_id, call_id).await?;
    Ok(Json(HandledResponse { handled }))
}
