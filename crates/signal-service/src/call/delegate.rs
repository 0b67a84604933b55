//! Storage and coordination facade of a call manager.
//!
//! The state machine in [`CallManager`](super::CallManager) only talks to
//! a [`ManagerDelegate`]. [`StoreDelegate`] backs it with the coordination
//! store (manager lock, user exclusivity claims, cached status and states,
//! per-user heartbeat deadlines) and the call repository.

use crate::call::handle::{self, SessionHandle};
use crate::call::keys;
use crate::call::types::{Call, CallStatus, EndReason, ParticipantState, UserState};
use crate::call::CallContext;
use crate::config::CallTimings;
use crate::errors::SignalError;
use crate::repositories::CallRepository;
use crate::sched::{DelayQueue, Lock, Message};
use crate::store::CoordinationStore;
use async_trait::async_trait;
use common::types::{CallId, MessageId, UserId};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A call's status moved. Carries enough to refresh the call summary
/// everywhere it is displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatusChange {
    pub call_id: CallId,
    pub message_id: MessageId,
    pub status: CallStatus,
    pub members: Vec<UserId>,
}

/// Receives every call status change. Injected so the call subsystem does
/// not depend on chat delivery.
#[async_trait]
pub trait CallUpdateNotifier: Send + Sync + 'static {
    async fn call_status_changed(&self, change: &CallStatusChange);
}

/// Everything a call manager needs from storage.
#[async_trait]
pub trait ManagerDelegate: Send + Sync + 'static {
    fn call_id(&self) -> CallId;

    fn caller_id(&self) -> UserId;

    /// Single attempt at the call's manager lock. `ManagerLocked` when
    /// another instance holds it.
    async fn manager_lock(&self) -> Result<(), SignalError>;

    async fn manager_unlock(&self);

    async fn call_status(&self) -> Result<CallStatus, SignalError>;

    async fn call_ready(&self) -> Result<(), SignalError>;

    async fn call_start(&self) -> Result<(), SignalError>;

    async fn call_end(&self, reason: EndReason) -> Result<(), SignalError>;

    /// Members, caller first.
    async fn user_ids(&self) -> Result<Vec<UserId>, SignalError>;

    /// States of every member that has one, in member order.
    async fn user_states(&self) -> Result<Vec<UserState>, SignalError>;

    async fn user_state(&self, user_id: UserId) -> Result<Option<UserState>, SignalError>;

    async fn save_user_state(&self, state: UserState) -> Result<(), SignalError>;

    /// Take or renew the user's exclusivity claim for this call.
    /// `UserLockInvalid` when another call holds it.
    async fn lock_user(&self, user_id: UserId) -> Result<(), SignalError>;

    /// Release the user's claim if this call holds it.
    async fn unlock_user(&self, user_id: UserId) -> Result<(), SignalError>;

    /// Renew the user's claim and push back their heartbeat deadline.
    async fn update_user_ttl(&self, user_id: UserId) -> Result<(), SignalError>;

    /// Members still counted toward the call: Online only, or anything not
    /// Dead or Rejected.
    async fn alive_user_count(&self, online_only: bool) -> Result<usize, SignalError> {
        let states = self.user_states().await?;
        Ok(states
            .iter()
            .filter(|s| {
                if online_only {
                    s.state == ParticipantState::Online
                } else {
                    s.state.is_alive()
                }
            })
            .count())
    }

    /// Users whose heartbeat deadline passed. Only the first call returns
    /// the receiver.
    fn dead_users(&self) -> Option<mpsc::Receiver<UserId>>;

    async fn user_session(&self, user_id: UserId) -> Result<Option<SessionHandle>, SignalError>;

    /// Stop background work. With `clear`, also delete the call's cached
    /// state and pending heartbeat deadlines.
    async fn close(&self, clear: bool);
}

/// [`ManagerDelegate`] over the coordination store and the call repository.
pub struct StoreDelegate {
    call: Call,
    store: Arc<dyn CoordinationStore>,
    calls: Arc<dyn CallRepository>,
    notifier: Arc<dyn CallUpdateNotifier>,
    timings: CallTimings,
    manager_lock: Lock,
    heartbeats: DelayQueue,
    cancel: CancellationToken,
    forwarder: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StoreDelegate {
    /// Load the call row and build a delegate for it.
    pub async fn load(ctx: &CallContext, call_id: CallId) -> Result<Self, SignalError> {
        let call = ctx
            .calls
            .find_call(call_id)
            .await?
            .ok_or(SignalError::CallNotFound)?;
        Ok(Self::new(ctx, call))
    }

    pub fn new(ctx: &CallContext, call: Call) -> Self {
        let store = Arc::clone(&ctx.store);
        // A crashed process drops the lease well before the monitor marker
        // fires, so forced cleanup can take over.
        let manager_lock = Lock::new(
            Arc::clone(&store),
            &keys::manager_lock(call.call_id),
            ctx.timings.manager_ttl / 4,
        );
        let heartbeats = DelayQueue::new(Arc::clone(&store), &keys::user_ttl_queue(call.call_id));
        Self {
            call,
            store,
            calls: Arc::clone(&ctx.calls),
            notifier: Arc::clone(&ctx.notifier),
            timings: ctx.timings,
            manager_lock,
            heartbeats,
            cancel: CancellationToken::new(),
            forwarder: Mutex::new(None),
        }
    }

    fn owner(&self) -> String {
        self.call.call_id.to_string()
    }

    async fn cache_status(&self, status: CallStatus) -> Result<(), SignalError> {
        self.store
            .set(
                &keys::status(self.call.call_id),
                &status.code().to_string(),
                Some(self.timings.manager_ttl),
            )
            .await
    }

    async fn status_changed(&self, status: CallStatus) -> Result<(), SignalError> {
        self.cache_status(status).await?;
        self.notifier
            .call_status_changed(&CallStatusChange {
                call_id: self.call.call_id,
                message_id: self.call.message_id,
                status,
                members: self.call.members.clone(),
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl ManagerDelegate for StoreDelegate {
    fn call_id(&self) -> CallId {
        self.call.call_id
    }

    fn caller_id(&self) -> UserId {
        self.call.caller_id
    }

    async fn manager_lock(&self) -> Result<(), SignalError> {
        if self.manager_lock.try_lock().await {
            Ok(())
        } else {
            Err(SignalError::ManagerLocked)
        }
    }

    async fn manager_unlock(&self) {
        if !self.manager_lock.unlock().await {
            debug!(target: "sig.call.manager", call_id = %self.call.call_id, "Manager lock was not held");
        }
    }

    async fn call_status(&self) -> Result<CallStatus, SignalError> {
        let cached = self.store.get(&keys::status(self.call.call_id)).await?;
        if let Some(status) = cached
            .and_then(|raw| raw.parse::<i32>().ok())
            .and_then(CallStatus::from_code)
        {
            return Ok(status);
        }
        let status = self
            .calls
            .find_call(self.call.call_id)
            .await?
            .ok_or(SignalError::CallNotFound)?
            .status;
        self.cache_status(status).await?;
        Ok(status)
    }

    async fn call_ready(&self) -> Result<(), SignalError> {
        self.calls
            .update_status(self.call.call_id, CallStatus::Ready)
            .await?;
        self.status_changed(CallStatus::Ready).await
    }

    async fn call_start(&self) -> Result<(), SignalError> {
        self.calls.mark_started(self.call.call_id).await?;
        self.status_changed(CallStatus::Active).await
    }

    async fn call_end(&self, reason: EndReason) -> Result<(), SignalError> {
        self.calls.mark_ended(self.call.call_id, reason).await?;
        self.status_changed(CallStatus::End).await
    }

    async fn user_ids(&self) -> Result<Vec<UserId>, SignalError> {
        let key = keys::user_ids(self.call.call_id);
        if let Some(json) = self.store.get(&key).await? {
            match serde_json::from_str(&json) {
                Ok(ids) => return Ok(ids),
                Err(e) => {
                    warn!(target: "sig.call.manager", call_id = %self.call.call_id, error = %e,
                        "Discarding undecodable cached user ids");
                }
            }
        }
        let members = self
            .calls
            .find_call(self.call.call_id)
            .await?
            .map_or_else(|| self.call.members.clone(), |call| call.members);
        self.store
            .set(&key, &serde_json::to_string(&members)?, None)
            .await?;
        Ok(members)
    }

    async fn user_states(&self) -> Result<Vec<UserState>, SignalError> {
        let fields = self
            .store
            .hget_all(&keys::user_states(self.call.call_id))
            .await?;
        let mut states = Vec::with_capacity(fields.len());
        for (_, json) in fields {
            states.push(serde_json::from_str::<UserState>(&json)?);
        }
        let order = self.user_ids().await?;
        states.sort_by_key(|s| order.iter().position(|id| *id == s.user_id));
        Ok(states)
    }

    async fn user_state(&self, user_id: UserId) -> Result<Option<UserState>, SignalError> {
        let json = self
            .store
            .hget(&keys::user_states(self.call.call_id), &user_id.to_string())
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_user_state(&self, state: UserState) -> Result<(), SignalError> {
        self.store
            .hset(
                &keys::user_states(self.call.call_id),
                &state.user_id.to_string(),
                &serde_json::to_string(&state)?,
            )
            .await
    }

    async fn lock_user(&self, user_id: UserId) -> Result<(), SignalError> {
        let claimed = self
            .store
            .claim(
                &keys::user_lock(user_id),
                &self.owner(),
                self.timings.user_ttl * 2,
            )
            .await?;
        if claimed {
            Ok(())
        } else {
            Err(SignalError::UserLockInvalid)
        }
    }

    async fn unlock_user(&self, user_id: UserId) -> Result<(), SignalError> {
        if self
            .store
            .release_claim(&keys::user_lock(user_id), &self.owner())
            .await?
        {
            Ok(())
        } else {
            Err(SignalError::UserLockInvalid)
        }
    }

    async fn update_user_ttl(&self, user_id: UserId) -> Result<(), SignalError> {
        if let Err(e) = self.lock_user(user_id).await {
            warn!(target: "sig.call.manager", call_id = %self.call.call_id, user_id = %user_id,
                error = %e, "Failed to renew user lock");
        }
        let id = user_id.to_string();
        self.heartbeats.delete(&id).await?;
        self.heartbeats
            .delay(self.timings.user_ttl, &Message::new(id, ""))
            .await
    }

    fn dead_users(&self) -> Option<mpsc::Receiver<UserId>> {
        let mut fired = self.heartbeats.channel()?;
        let (tx, rx) = mpsc::channel(1);
        let cancel = self.cancel.clone();
        let call_id = self.call.call_id;

        let task = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    () = cancel.cancelled() => break,
                    item = fired.recv() => item,
                };
                let Some(item) = item else { break };
                match item.message.id.parse::<UserId>() {
                    Ok(user_id) => {
                        if tx.send(user_id).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "sig.call.manager", call_id = %call_id, id = %item.message.id,
                            error = %e, "Ignoring malformed heartbeat deadline");
                    }
                }
            }
        });
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Some(rx)
    }

    async fn user_session(&self, user_id: UserId) -> Result<Option<SessionHandle>, SignalError> {
        handle::find_session(&self.store, self.call.call_id, user_id).await
    }

    async fn close(&self, clear: bool) {
        self.cancel.cancel();
        if let Some(task) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Err(e) = self.heartbeats.close(clear).await {
            warn!(target: "sig.call.manager", call_id = %self.call.call_id, error = %e,
                "Failed to close heartbeat queue");
        }
        if !clear {
            return;
        }
        let call_id = self.call.call_id;
        let ids = keys::user_ids(call_id);
        let states = keys::user_states(call_id);
        let status = keys::status(call_id);
        if let Err(e) = self.store.del(&[&ids, &states, &status]).await {
            warn!(target: "sig.call.manager", call_id = %call_id, error = %e,
                "Failed to clear call state");
        }
    }
}
