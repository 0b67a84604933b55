//! Fan-out of notifications to a user's sessions.

use crate::call::types::CallStatus;
use crate::errors::SignalError;
use crate::notification::registry::SessionRegistry;
use crate::notification::types::{CallMessageUpdate, Notification};
use crate::observability::metrics;
use crate::sched::Message;
use common::types::{CallId, MessageId, UserId};
use tracing::{debug, warn};

/// Pushes notifications into every session mailbox a user still has.
///
/// Delivery is best effort: a session torn down between lookup and push is
/// skipped, and per-session failures are logged rather than returned.
#[derive(Clone)]
pub struct NotificationSender {
    registry: SessionRegistry,
}

impl NotificationSender {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Deliver to all live sessions. Returns how many accepted the push.
    pub async fn send(&self, user_id: UserId, notification: &Notification) -> Result<usize, SignalError> {
        let message = Message::encode(notification)?;
        let mut delivered = 0;
        for mailbox in self.registry.find_sessions(user_id).await? {
            match mailbox.push_if_state_exists(&message).await {
                Ok(()) => delivered += 1,
                Err(SignalError::MailboxInactive) => {
                    debug!(target: "sig.noti.sender", user_id = %user_id, mailbox = %mailbox.key(),
                        "Session expired before push");
                }
                Err(e) => {
                    metrics::record_error(e.error_type_label());
                    warn!(target: "sig.noti.sender", user_id = %user_id, mailbox = %mailbox.key(),
                        error = %e, "Failed to push notification");
                }
            }
        }
        Ok(delivered)
    }

    pub async fn send_chat_message(
        &self,
        user_id: UserId,
        message_id: MessageId,
        call_id: CallId,
        status: CallStatus,
        is_new: bool,
    ) -> Result<usize, SignalError> {
        let update = CallMessageUpdate {
            message_id,
            call_id,
            status,
            is_new,
        };
        self.send(user_id, &Notification::chat_message(&update)?).await
    }

    pub async fn send_new_contact(
        &self,
        user_id: UserId,
        contact: serde_json::Value,
    ) -> Result<usize, SignalError> {
        self.send(user_id, &Notification::new_contact(contact)).await
    }

    pub async fn send_new_contact_request(
        &self,
        user_id: UserId,
        request: serde_json::Value,
    ) -> Result<usize, SignalError> {
        self.send(user_id, &Notification::new_contact_request(request))
            .await
    }

    pub async fn send_call_handled(&self, user_id: UserId, call_id: CallId) -> Result<usize, SignalError> {
        self.send(user_id, &Notification::call_handled(call_id)?).await
    }
}
