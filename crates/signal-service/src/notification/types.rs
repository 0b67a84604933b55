//! Notification envelopes pushed to clients.

use crate::call::types::CallStatus;
use crate::errors::SignalError;
use common::types::{CallId, MessageId};
use serde::{Deserialize, Serialize};

coded_enum!(
    /// Notification type codes.
    NotificationKind {
        ChatMessage = 1,
        NewContact = 2,
        NewContactRequest = 3,
        CallHandled = 4,
    }
);

/// Liveness of a notification session, stored as its mailbox flag.
pub type SessionState = crate::sched::MailboxState;

/// Wire envelope `{"type": <code>, "payload": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

/// Updated summary of the chat message that carries a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessageUpdate {
    pub message_id: MessageId,
    pub call_id: CallId,
    pub status: CallStatus,
    pub is_new: bool,
}

impl Notification {
    pub fn new<T: Serialize>(kind: NotificationKind, payload: &T) -> Result<Self, SignalError> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn chat_message(update: &CallMessageUpdate) -> Result<Self, SignalError> {
        Self::new(NotificationKind::ChatMessage, update)
    }

    pub fn call_handled(call_id: CallId) -> Result<Self, SignalError> {
        Self::new(NotificationKind::CallHandled, &call_id)
    }

    /// Contact payloads are produced by the chat service and passed through.
    pub fn new_contact(contact: serde_json::Value) -> Self {
        Self {
            kind: NotificationKind::NewContact,
            payload: contact,
        }
    }

    pub fn new_contact_request(request: serde_json::Value) -> Self {
        Self {
            kind: NotificationKind::NewContactRequest,
            payload: request,
        }
    }

    pub fn to_json(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_handled_envelope() {
        let json = Notification::call_handled(CallId(5)).unwrap().to_json().unwrap();
        assert_eq!(json, r#"{"type":4,"payload":5}"#);
    }

    #[test]
    fn test_chat_message_envelope() {
        let update = CallMessageUpdate {
            message_id: MessageId(10),
            call_id: CallId(3),
            status: CallStatus::Active,
            is_new: false,
        };
        let json = Notification::chat_message(&update).unwrap().to_json().unwrap();
        assert_eq!(
            json,
            r#"{"type":1,"payload":{"messageId":10,"callId":3,"status":3,"isNew":false}}"#
        );
    }
}
