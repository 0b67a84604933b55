//! Mailbox actions: what sessions and the API send to a manager, and what
//! a manager sends to sessions. Carried as JSON inside mailbox messages.

use crate::call::types::{EndReason, UserState};
use common::types::UserId;
use serde::{Deserialize, Serialize};

/// Signaling relayed between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub message: String,
}

/// Actions consumed by a call manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ManagerAction {
    UserAccepted(UserId),
    UserOnline(UserId),
    UserOffline(UserId),
    Hangup(UserId),
    Signaling(Signal),
    Heartbeat(UserId),
}

/// Signaling as seen by the receiving session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSignal {
    pub from_user_id: UserId,
    pub message: String,
}

/// Actions consumed by a call session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SessionAction {
    UpdateUserStates(Vec<UserState>),
    UpdateUserState(UserState),
    Signaling(PeerSignal),
    CallStart,
    CallEnd(EndReason),
    Close,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_action_json_shape() {
        let json = serde_json::to_string(&ManagerAction::UserOnline(UserId(7))).unwrap();
        assert_eq!(json, r#"{"type":"userOnline","payload":7}"#);

        let signal = ManagerAction::Signaling(Signal {
            from_user_id: UserId(1),
            to_user_id: UserId(2),
            message: "offer".to_string(),
        });
        let back: ManagerAction =
            serde_json::from_str(&serde_json::to_string(&signal).unwrap()).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn test_session_action_unit_variants() {
        let json = serde_json::to_string(&SessionAction::CallStart).unwrap();
        assert_eq!(json, r#"{"type":"callStart"}"#);
        let back: SessionAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SessionAction::CallStart);

        let end = serde_json::to_string(&SessionAction::CallEnd(EndReason::Busy)).unwrap();
        assert_eq!(end, r#"{"type":"callEnd","payload":4}"#);
    }
}
