//! Relational data the signaling core consumes through narrow interfaces.
//!
//! The chat service owns these tables; the core only creates and updates
//! call rows and reads login and delivery bookkeeping.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryCallRepository, MemorySessionDirectory};
pub use postgres::{PgCallRepository, PgSessionDirectory};

use crate::call::types::{Call, CallStatus, EndReason};
use crate::errors::SignalError;
use async_trait::async_trait;
use common::types::{CallId, UserId};

/// A call about to be placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCall {
    /// Chat room the call summary message is posted to.
    pub room_id: u64,
    pub caller_id: UserId,
    /// Caller first, then invitees.
    pub members: Vec<UserId>,
}

/// Call rows.
#[async_trait]
pub trait CallRepository: Send + Sync + 'static {
    /// Insert the call summary message and the call row (status New) in
    /// one transaction.
    async fn create_call(&self, new_call: NewCall) -> Result<Call, SignalError>;

    async fn find_call(&self, call_id: CallId) -> Result<Option<Call>, SignalError>;

    async fn update_status(&self, call_id: CallId, status: CallStatus) -> Result<(), SignalError>;

    /// Record the start time and move to Active.
    async fn mark_started(&self, call_id: CallId) -> Result<(), SignalError>;

    /// Record the end time and reason and move to End.
    async fn mark_ended(&self, call_id: CallId, reason: EndReason) -> Result<(), SignalError>;
}

/// Login and delivery lookups for notification sessions.
#[async_trait]
pub trait SessionDirectory: Send + Sync + 'static {
    /// User behind an enabled, unexpired login.
    async fn resolve_login(&self, login_id: &str) -> Result<Option<UserId>, SignalError>;

    /// Newest message delivery id for the user, 0 if none.
    async fn last_delivery_id(&self, user_id: UserId) -> Result<u64, SignalError>;
}
