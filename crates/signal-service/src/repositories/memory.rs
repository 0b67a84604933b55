//! In-process repositories for tests and single-node development.

use crate::call::types::{Call, CallStatus, EndReason};
use crate::errors::SignalError;
use crate::repositories::{CallRepository, NewCall, SessionDirectory};
use async_trait::async_trait;
use chrono::Utc;
use common::types::{CallId, MessageId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Calls {
    rows: HashMap<CallId, Call>,
    next_call_id: u64,
    next_message_id: u64,
}

/// Call rows in a map.
#[derive(Debug, Clone, Default)]
pub struct MemoryCallRepository {
    inner: Arc<Mutex<Calls>>,
}

impl MemoryCallRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Calls) -> Result<R, SignalError>) -> Result<R, SignalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SignalError::Database("call repository lock poisoned".to_string()))?;
        f(&mut inner)
    }

    /// Apply `f` if the row may move to `to`.
    fn update(
        &self,
        call_id: CallId,
        to: CallStatus,
        f: impl FnOnce(&mut Call),
    ) -> Result<(), SignalError> {
        self.with(|calls| {
            if let Some(call) = calls.rows.get_mut(&call_id) {
                if CallStatus::can_transition(call.status, to) {
                    f(call);
                    call.status = to;
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl CallRepository for MemoryCallRepository {
    async fn create_call(&self, new_call: NewCall) -> Result<Call, SignalError> {
        self.with(|calls| {
            calls.next_call_id += 1;
            calls.next_message_id += 1;
            let call = Call {
                call_id: CallId(calls.next_call_id),
                caller_id: new_call.caller_id,
                message_id: MessageId(calls.next_message_id),
                members: new_call.members,
                status: CallStatus::New,
                start_time: None,
                end_time: None,
                end_reason: None,
            };
            calls.rows.insert(call.call_id, call.clone());
            Ok(call)
        })
    }

    async fn find_call(&self, call_id: CallId) -> Result<Option<Call>, SignalError> {
        self.with(|calls| Ok(calls.rows.get(&call_id).cloned()))
    }

    async fn update_status(&self, call_id: CallId, status: CallStatus) -> Result<(), SignalError> {
        self.update(call_id, status, |_| {})
    }

    async fn mark_started(&self, call_id: CallId) -> Result<(), SignalError> {
        self.update(call_id, CallStatus::Active, |call| {
            call.start_time = Some(Utc::now());
        })
    }

    async fn mark_ended(&self, call_id: CallId, reason: EndReason) -> Result<(), SignalError> {
        self.update(call_id, CallStatus::End, |call| {
            call.end_time = Some(Utc::now());
            call.end_reason = Some(reason);
        })
    }
}

/// Logins and delivery ids in maps.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionDirectory {
    logins: HashMap<String, UserId>,
    last_deliveries: HashMap<UserId, u64>,
}

impl MemorySessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_login(mut self, login_id: &str, user_id: UserId) -> Self {
        self.logins.insert(login_id.to_string(), user_id);
        self
    }

    #[must_use]
    pub fn with_last_delivery(mut self, user_id: UserId, delivery_id: u64) -> Self {
        self.last_deliveries.insert(user_id, delivery_id);
        self
    }
}

#[async_trait]
impl SessionDirectory for MemorySessionDirectory {
    async fn resolve_login(&self, login_id: &str) -> Result<Option<UserId>, SignalError> {
        Ok(self.logins.get(login_id).copied())
    }

    async fn last_delivery_id(&self, user_id: UserId) -> Result<u64, SignalError> {
        Ok(self.last_deliveries.get(&user_id).copied().unwrap_or(0))
    }
}
