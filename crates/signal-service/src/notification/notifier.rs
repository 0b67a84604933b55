//! Call status changes rendered as chat-message updates.

use crate::call::delegate::{CallStatusChange, CallUpdateNotifier};
use crate::notification::sender::NotificationSender;
use async_trait::async_trait;
use tracing::warn;

/// Pushes the call's chat summary to every member whenever its status
/// changes, so clients redraw the call bubble.
pub struct ChatUpdateNotifier {
    sender: NotificationSender,
}

impl ChatUpdateNotifier {
    pub fn new(sender: NotificationSender) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl CallUpdateNotifier for ChatUpdateNotifier {
    async fn call_status_changed(&self, change: &CallStatusChange) {
        for &member in &change.members {
            if let Err(e) = self
                .sender
                .send_chat_message(member, change.message_id, change.call_id, change.status, false)
                .await
            {
                warn!(target: "sig.noti.sender", call_id = %change.call_id, user_id = %member,
                    error = %e, "Failed to push call update");
            }
        }
    }
}
