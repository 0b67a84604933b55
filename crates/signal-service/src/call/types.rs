//! Call and participant state, with their transition tables.

use common::types::{CallId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

coded_enum!(
    /// Call lifecycle. Monotonic; `End` is terminal.
    CallStatus {
        New = 1,
        Ready = 2,
        Active = 3,
        End = 4,
    }
);

coded_enum!(
    /// Why a call ended.
    EndReason {
        Normal = 1,
        Rejected = 2,
        NoAnswer = 3,
        Busy = 4,
        LostConnection = 5,
        Error = 6,
        Cancelled = 7,
    }
);

coded_enum!(
    /// A participant's lifecycle within one call. `Dead` is terminal.
    ParticipantState {
        Invited = 1,
        Rejected = 2,
        Accepted = 3,
        Online = 4,
        Offline = 5,
        Dead = 6,
    }
);

impl CallStatus {
    /// Allowed call status moves. New may skip straight to End on setup
    /// failure; nothing leaves End.
    pub fn can_transition(from: CallStatus, to: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (from, to),
            (New, Ready) | (New, End) | (Ready, Active) | (Ready, End) | (Active, End)
        )
    }

    /// Statuses a call row may hold for a move to `to` to apply.
    pub fn predecessors(to: CallStatus) -> Vec<CallStatus> {
        CallStatus::ALL
            .iter()
            .copied()
            .filter(|&from| CallStatus::can_transition(from, to))
            .collect()
    }

    pub(crate) fn predecessor_codes(to: CallStatus) -> Vec<i32> {
        CallStatus::predecessors(to)
            .into_iter()
            .map(CallStatus::code)
            .collect()
    }
}

impl EndReason {
    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            EndReason::Normal => "normal",
            EndReason::Rejected => "rejected",
            EndReason::NoAnswer => "no_answer",
            EndReason::Busy => "busy",
            EndReason::LostConnection => "lost_connection",
            EndReason::Error => "error",
            EndReason::Cancelled => "cancelled",
        }
    }
}

impl ParticipantState {
    /// Allowed participant moves.
    ///
    /// `Dead -> Online` is allowed by the table; the manager additionally
    /// requires the user's exclusivity lock to be re-acquired.
    pub fn can_transition(from: ParticipantState, to: ParticipantState) -> bool {
        use ParticipantState::*;
        matches!(
            (from, to),
            (Invited, Accepted)
                | (Invited, Rejected)
                | (Accepted, Online)
                | (Offline, Online)
                | (Dead, Online)
                | (Online, Offline)
                | (Online, Dead)
                | (Offline, Dead)
        )
    }

    /// Still counted toward keeping the call alive.
    pub fn is_alive(self) -> bool {
        !matches!(self, ParticipantState::Dead | ParticipantState::Rejected)
    }
}

/// Cause of a participant leaving the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Hung up after accepting.
    Normal,
    /// Heartbeat timed out.
    Lost,
    /// Hung up before accepting.
    Rejected,
    /// Came back after dying but the exclusivity lock was taken.
    ReenterBusy,
}

impl ExitReason {
    /// End reason for this exit. A caller leaving a Ready call cancels it.
    pub fn end_reason(self, caller_cancelling: bool) -> EndReason {
        match self {
            ExitReason::Normal if caller_cancelling => EndReason::Cancelled,
            ExitReason::Normal => EndReason::Normal,
            ExitReason::Lost => EndReason::LostConnection,
            ExitReason::Rejected => EndReason::Rejected,
            ExitReason::ReenterBusy => EndReason::Error,
        }
    }
}

/// Ping marker before any measurement.
pub const PING_NONE: i32 = -2;
/// Ping marker for a participant whose connection was lost.
pub const PING_LOST: i32 = -1;

/// One participant's state, as broadcast to sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub user_id: UserId,
    pub state: ParticipantState,
    pub ping: i32,
}

impl UserState {
    pub fn invited(user_id: UserId) -> Self {
        Self {
            user_id,
            state: ParticipantState::Invited,
            ping: PING_NONE,
        }
    }
}

/// Persisted call row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub message_id: MessageId,
    /// Caller first.
    pub members: Vec<UserId>,
    pub status: CallStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl Call {
    pub fn is_member(&self, user_id: UserId) -> bool {
        self.members.contains(&user_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_transition_table_is_exhaustive() {
        use ParticipantState::*;
        let allowed = [
            (Invited, Accepted),
            (Invited, Rejected),
            (Accepted, Online),
            (Offline, Online),
            (Dead, Online),
            (Online, Offline),
            (Online, Dead),
            (Offline, Dead),
        ];
        for &from in ParticipantState::ALL {
            for &to in ParticipantState::ALL {
                assert_eq!(
                    ParticipantState::can_transition(from, to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn test_call_status_never_regresses() {
        for &from in CallStatus::ALL {
            for &to in CallStatus::ALL {
                if CallStatus::can_transition(from, to) {
                    assert!(to.code() > from.code(), "{from:?} -> {to:?}");
                }
            }
            assert!(!CallStatus::can_transition(CallStatus::End, from));
        }
        assert!(CallStatus::can_transition(CallStatus::New, CallStatus::End));
        assert!(!CallStatus::can_transition(CallStatus::New, CallStatus::Active));
    }

    #[test]
    fn test_call_status_predecessors() {
        assert_eq!(
            CallStatus::predecessors(CallStatus::End),
            vec![CallStatus::New, CallStatus::Ready, CallStatus::Active]
        );
        assert_eq!(CallStatus::predecessor_codes(CallStatus::Active), vec![2]);
        assert!(CallStatus::predecessors(CallStatus::New).is_empty());
    }

    #[test]
    fn test_exit_reason_mapping() {
        assert_eq!(ExitReason::Normal.end_reason(false), EndReason::Normal);
        assert_eq!(ExitReason::Normal.end_reason(true), EndReason::Cancelled);
        assert_eq!(ExitReason::Lost.end_reason(false), EndReason::LostConnection);
        assert_eq!(ExitReason::Rejected.end_reason(false), EndReason::Rejected);
        assert_eq!(ExitReason::ReenterBusy.end_reason(false), EndReason::Error);
    }

    #[test]
    fn test_user_state_wire_format() {
        let state = UserState::invited(UserId(5));
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"userId":5,"state":1,"ping":-2}"#);

        let bad = r#"{"userId":5,"state":9,"ping":-2}"#;
        assert!(serde_json::from_str::<UserState>(bad).is_err());
    }

    #[test]
    fn test_alive_states() {
        assert!(ParticipantState::Invited.is_alive());
        assert!(ParticipantState::Offline.is_alive());
        assert!(!ParticipantState::Dead.is_alive());
        assert!(!ParticipantState::Rejected.is_alive());
    }
}
