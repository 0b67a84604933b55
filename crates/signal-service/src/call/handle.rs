//! Handles for reaching a call manager or a call session from anywhere.
//!
//! There is no in-process directory. A manager or session exists exactly
//! when its mailbox flag is Active; resolving a handle re-reads the flag
//! from the store every time, since the owning process may be replaced at
//! any moment.

use crate::call::actions::{ManagerAction, PeerSignal, SessionAction, Signal};
use crate::call::keys;
use crate::call::types::{EndReason, UserState};
use crate::errors::SignalError;
use crate::sched::{MailboxState, Message, Queue};
use crate::store::CoordinationStore;
use common::types::{CallId, UserId};
use std::sync::Arc;

async fn active_mailbox(
    store: &Arc<dyn CoordinationStore>,
    name: &str,
) -> Result<Option<Queue>, SignalError> {
    let queue = Queue::producer(Arc::clone(store), name);
    if queue.state().await? == MailboxState::Active {
        Ok(Some(queue))
    } else {
        Ok(None)
    }
}

/// Resolve the manager of a call, if one is running.
pub async fn find_manager(
    store: &Arc<dyn CoordinationStore>,
    call_id: CallId,
) -> Result<Option<ManagerHandle>, SignalError> {
    Ok(active_mailbox(store, &keys::manager_mailbox(call_id))
        .await?
        .map(|queue| ManagerHandle { call_id, queue }))
}

/// Resolve the session of one participant, if connected.
pub async fn find_session(
    store: &Arc<dyn CoordinationStore>,
    call_id: CallId,
    user_id: UserId,
) -> Result<Option<SessionHandle>, SignalError> {
    Ok(active_mailbox(store, &keys::session_mailbox(call_id, user_id))
        .await?
        .map(|queue| SessionHandle { user_id, queue }))
}

/// Producer side of a manager mailbox.
pub struct ManagerHandle {
    call_id: CallId,
    queue: Queue,
}

impl ManagerHandle {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    async fn send(&self, action: &ManagerAction) -> Result<(), SignalError> {
        self.queue
            .push_if_state_exists(&Message::encode(action)?)
            .await
    }

    pub async fn user_accepted(&self, user_id: UserId) -> Result<(), SignalError> {
        self.send(&ManagerAction::UserAccepted(user_id)).await
    }

    pub async fn user_online(&self, user_id: UserId) -> Result<(), SignalError> {
        self.send(&ManagerAction::UserOnline(user_id)).await
    }

    pub async fn user_offline(&self, user_id: UserId) -> Result<(), SignalError> {
        self.send(&ManagerAction::UserOffline(user_id)).await
    }

    pub async fn hangup(&self, user_id: UserId) -> Result<(), SignalError> {
        self.send(&ManagerAction::Hangup(user_id)).await
    }

    pub async fn signaling(
        &self,
        from_user_id: UserId,
        to_user_id: UserId,
        message: String,
    ) -> Result<(), SignalError> {
        self.send(&ManagerAction::Signaling(Signal {
            from_user_id,
            to_user_id,
            message,
        }))
        .await
    }

    pub async fn heartbeat(&self, user_id: UserId) -> Result<(), SignalError> {
        self.send(&ManagerAction::Heartbeat(user_id)).await
    }
}

/// Producer side of a participant's session mailbox.
pub struct SessionHandle {
    user_id: UserId,
    queue: Queue,
}

impl SessionHandle {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    async fn send(&self, action: &SessionAction) -> Result<(), SignalError> {
        self.queue
            .push_if_state_exists(&Message::encode(action)?)
            .await
    }

    pub async fn update_user_states(&self, states: Vec<UserState>) -> Result<(), SignalError> {
        self.send(&SessionAction::UpdateUserStates(states)).await
    }

    pub async fn update_user_state(&self, state: UserState) -> Result<(), SignalError> {
        self.send(&SessionAction::UpdateUserState(state)).await
    }

    pub async fn signaling(&self, from_user_id: UserId, message: String) -> Result<(), SignalError> {
        self.send(&SessionAction::Signaling(PeerSignal {
            from_user_id,
            message,
        }))
        .await
    }

    pub async fn call_start(&self) -> Result<(), SignalError> {
        self.send(&SessionAction::CallStart).await
    }

    pub async fn call_end(&self, reason: EndReason) -> Result<(), SignalError> {
        self.send(&SessionAction::CallEnd(reason)).await
    }

    pub async fn close(&self) -> Result<(), SignalError> {
        self.send(&SessionAction::Close).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const HEARTBEAT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_manager_resolves_only_while_active() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let call_id = CallId(9);
        assert!(find_manager(&store, call_id).await.unwrap().is_none());

        let mailbox = Queue::new(Arc::clone(&store), &keys::manager_mailbox(call_id), HEARTBEAT);
        mailbox.save_state(MailboxState::Active).await.unwrap();
        let handle = find_manager(&store, call_id).await.unwrap().unwrap();
        handle.user_online(UserId(1)).await.unwrap();

        let mut rx = mailbox.channel().unwrap();
        let action: ManagerAction = rx.recv().await.unwrap().decode().unwrap();
        assert_eq!(action, ManagerAction::UserOnline(UserId(1)));
        mailbox.ack(true).await.unwrap();

        mailbox.save_state(MailboxState::Inactive).await.unwrap();
        assert!(find_manager(&store, call_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_push_fails_after_teardown() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let name = keys::session_mailbox(CallId(1), UserId(2));
        let mailbox = Queue::new(Arc::clone(&store), &name, HEARTBEAT);
        mailbox.save_state(MailboxState::Active).await.unwrap();

        let handle = find_session(&store, CallId(1), UserId(2))
            .await
            .unwrap()
            .unwrap();
        mailbox.close(true).await.unwrap();

        let err = handle.call_start().await.unwrap_err();
        assert!(matches!(err, SignalError::MailboxInactive));
    }
}
