//! Deterministic coordination-store names for the call subsystem.
//!
//! Managers and sessions are never tracked in process memory; anything
//! that needs to reach one derives its name from the call and user ids.

use common::types::{CallId, UserId};

/// Manager mailbox (`mq:` prefix added by the mailbox).
pub fn manager_mailbox(call_id: CallId) -> String {
    format!("call:manager:{call_id}")
}

/// Session mailbox for one participant of one call.
pub fn session_mailbox(call_id: CallId, user_id: UserId) -> String {
    format!("call:ws:{call_id}:{user_id}")
}

/// Manager exclusivity lock (`lock:` prefix added by the lock).
pub fn manager_lock(call_id: CallId) -> String {
    format!("call:managerLock:{call_id}")
}

/// Per-user exclusivity claim, owned by the call id.
pub fn user_lock(user_id: UserId) -> String {
    format!("call:userLock:{user_id}")
}

pub fn user_ids(call_id: CallId) -> String {
    format!("call:userIds:{call_id}")
}

pub fn user_states(call_id: CallId) -> String {
    format!("call:userStates:{call_id}")
}

pub fn status(call_id: CallId) -> String {
    format!("call:status:{call_id}")
}

/// Per-call delay queue of participant heartbeat deadlines.
pub fn user_ttl_queue(call_id: CallId) -> String {
    format!("call:userTTL:{call_id}")
}

/// Process-shared delay queue of manager liveness markers.
pub const MONITOR_QUEUE: &str = "call:monitor";

/// Set of users who already handled (joined or hung up) the call.
pub fn handled(call_id: CallId) -> String {
    format!("call:handled:{call_id}")
}
