//! Call WebSocket wire format.
//!
//! Every frame is `{"type": <code>, "payload": "<string>"}`. Structured
//! payloads are JSON encoded into the string.

use crate::call::actions::SessionAction;
use crate::errors::SignalError;
use common::types::UserId;
use serde::{Deserialize, Serialize};

coded_enum!(
    /// Frame type codes.
    FrameType {
        Unauthorized = 1,
        UpdateUserStates = 2,
        UpdateUserState = 3,
        Signaling = 4,
        HeartBeat = 5,
        CallStart = 6,
        CallEnd = 7,
        Error = 8,
    }
);

/// A call WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default)]
    pub payload: String,
}

/// Payload of an inbound signaling frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingPayload {
    pub to_user_id: UserId,
    pub message: String,
}

impl Frame {
    pub fn new(kind: FrameType, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: FrameType) -> Self {
        Self::new(kind, "")
    }

    pub fn error(message: &str) -> Self {
        Self::new(FrameType::Error, message)
    }

    pub fn parse(text: &str) -> Result<Self, SignalError> {
        serde_json::from_str(text)
            .map_err(|e| SignalError::BadRequest(format!("malformed frame: {e}")))
    }

    pub fn to_text(&self) -> String {
        // Frame holds only an integer and a string.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode the payload of a signaling frame.
    pub fn signaling(&self) -> Result<SignalingPayload, SignalError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| SignalError::BadRequest(format!("malformed signaling payload: {e}")))
    }

    /// Outbound frame for a session action. `Close` has none.
    pub fn from_action(action: &SessionAction) -> Result<Option<Self>, SignalError> {
        let frame = match action {
            SessionAction::UpdateUserStates(states) => {
                Frame::new(FrameType::UpdateUserStates, serde_json::to_string(states)?)
            }
            SessionAction::UpdateUserState(state) => {
                Frame::new(FrameType::UpdateUserState, serde_json::to_string(state)?)
            }
            SessionAction::Signaling(signal) => {
                Frame::new(FrameType::Signaling, serde_json::to_string(signal)?)
            }
            SessionAction::CallStart => Frame::empty(FrameType::CallStart),
            SessionAction::CallEnd(reason) => {
                Frame::new(FrameType::CallEnd, reason.code().to_string())
            }
            SessionAction::Close => return Ok(None),
        };
        Ok(Some(frame))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::call::actions::PeerSignal;
    use crate::call::types::{EndReason, UserState};

    #[test]
    fn test_parse_inbound_frames() {
        let heartbeat = Frame::parse(r#"{"type":5}"#).unwrap();
        assert_eq!(heartbeat.kind, FrameType::HeartBeat);
        assert_eq!(heartbeat.payload, "");

        let signaling =
            Frame::parse(r#"{"type":4,"payload":"{\"toUserId\":2,\"message\":\"sdp\"}"}"#).unwrap();
        let payload = signaling.signaling().unwrap();
        assert_eq!(payload.to_user_id, UserId(2));
        assert_eq!(payload.message, "sdp");

        assert!(Frame::parse(r#"{"type":42}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn test_outbound_frames_from_actions() {
        let frame = Frame::from_action(&SessionAction::UpdateUserStates(vec![UserState::invited(
            UserId(1),
        )]))
        .unwrap()
        .unwrap();
        assert_eq!(frame.kind, FrameType::UpdateUserStates);
        assert_eq!(frame.payload, r#"[{"userId":1,"state":1,"ping":-2}]"#);

        let frame = Frame::from_action(&SessionAction::Signaling(PeerSignal {
            from_user_id: UserId(3),
            message: "ice".to_string(),
        }))
        .unwrap()
        .unwrap();
        assert_eq!(frame.payload, r#"{"fromUserId":3,"message":"ice"}"#);

        let frame = Frame::from_action(&SessionAction::CallEnd(EndReason::Cancelled))
            .unwrap()
            .unwrap();
        assert_eq!(frame.to_text(), r#"{"type":7,"payload":"7"}"#);

        assert!(Frame::from_action(&SessionAction::Close).unwrap().is_none());
    }
}
