//! Call API used by the HTTP layer: create, join, hang up, inspect.

use crate::call::handle::{find_manager, ManagerHandle};
use crate::call::keys;
use crate::call::manager::CallManager;
use crate::call::session::token_payload;
use crate::call::types::{Call, CallStatus};
use crate::call::CallContext;
use crate::errors::SignalError;
use crate::notification::NotificationSender;
use crate::repositories::{CallRepository, NewCall};
use common::types::{CallId, UserId};
use tracing::{info, instrument, warn};

/// Request-side operations on calls.
#[derive(Clone)]
pub struct CallService {
    ctx: CallContext,
    notifications: NotificationSender,
}

impl CallService {
    pub fn new(ctx: CallContext, notifications: NotificationSender) -> Self {
        Self { ctx, notifications }
    }

    /// Persist a new call in `room_id` and start its manager.
    #[instrument(skip_all, fields(caller_id = %caller_id, room_id = room_id))]
    pub async fn create_call(
        &self,
        caller_id: UserId,
        room_id: u64,
        invitees: &[UserId],
    ) -> Result<CallId, SignalError> {
        if invitees.is_empty() {
            return Err(SignalError::MemberCountNotEnough);
        }
        if invitees.contains(&caller_id) {
            return Err(SignalError::BadRequest(
                "invitees must not include the caller".to_string(),
            ));
        }
        let mut members = Vec::with_capacity(invitees.len() + 1);
        members.push(caller_id);
        members.extend_from_slice(invitees);

        let call = self
            .ctx
            .calls
            .create_call(NewCall {
                room_id,
                caller_id,
                members,
            })
            .await?;
        CallManager::start(&self.ctx, call.call_id).await?;
        info!(target: "sig.call.service", call_id = %call.call_id, caller_id = %caller_id,
            invitees = invitees.len(), "Call created");
        Ok(call.call_id)
    }

    /// Accept the call and return the token for the call WebSocket.
    #[instrument(skip_all, fields(user_id = %user_id, call_id = %call_id))]
    pub async fn join_call(&self, user_id: UserId, call_id: CallId) -> Result<String, SignalError> {
        let call = self.verify_call(call_id).await?;
        check_member(&call, user_id)?;
        self.manager(call_id).await?.user_accepted(user_id).await?;
        let token = self.ctx.signer.issue(
            &token_payload(call_id, user_id),
            self.ctx.timings.call_token_ttl,
        )?;
        self.on_call_handled(user_id, call_id).await;
        Ok(token)
    }

    #[instrument(skip_all, fields(user_id = %user_id, call_id = %call_id))]
    pub async fn hangup_call(&self, user_id: UserId, call_id: CallId) -> Result<(), SignalError> {
        let call = self.verify_call(call_id).await?;
        check_member(&call, user_id)?;
        self.manager(call_id).await?.hangup(user_id).await?;
        self.on_call_handled(user_id, call_id).await;
        Ok(())
    }

    pub async fn call_info(&self, user_id: UserId, call_id: CallId) -> Result<Call, SignalError> {
        let call = self
            .ctx
            .calls
            .find_call(call_id)
            .await?
            .ok_or(SignalError::CallNotFound)?;
        check_member(&call, user_id)?;
        Ok(call)
    }

    /// Whether `user_id` already joined or hung up this call.
    pub async fn is_handled(&self, user_id: UserId, call_id: CallId) -> Result<bool, SignalError> {
        self.ctx
            .store
            .sismember(&keys::handled(call_id), &user_id.to_string())
            .await
    }

    async fn verify_call(&self, call_id: CallId) -> Result<Call, SignalError> {
        let call = self
            .ctx
            .calls
            .find_call(call_id)
            .await?
            .ok_or(SignalError::CallNotFound)?;
        match call.status {
            CallStatus::New => Err(SignalError::StatusNotReady),
            CallStatus::End => Err(SignalError::CallStatusInvalid),
            CallStatus::Ready | CallStatus::Active => Ok(call),
        }
    }

    async fn manager(&self, call_id: CallId) -> Result<ManagerHandle, SignalError> {
        find_manager(&self.ctx.store, call_id)
            .await?
            .ok_or(SignalError::ManagerNotFound)
    }

    /// Mark the call handled for the user; the first time, tell the user's
    /// other devices so they stop ringing.
    async fn on_call_handled(&self, user_id: UserId, call_id: CallId) {
        let marked = async {
            if self.is_handled(user_id, call_id).await? {
                return Ok(false);
            }
            self.ctx
                .store
                .sadd(&keys::handled(call_id), &user_id.to_string())
                .await?;
            self.notifications.send_call_handled(user_id, call_id).await?;
            Ok::<_, SignalError>(true)
        };
        if let Err(e) = marked.await {
            warn!(target: "sig.call.service", call_id = %call_id, user_id = %user_id, error = %e,
                "Failed to mark call handled");
        }
    }
}

fn check_member(call: &Call, user_id: UserId) -> Result<(), SignalError> {
    if call.is_member(user_id) {
        Ok(())
    } else {
        Err(SignalError::Forbidden(
            "not a participant of this call".to_string(),
        ))
    }
}
