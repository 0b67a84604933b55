//! Per-user directory of notification sessions.
//!
//! # Key Patterns
//!
//! - `notification:sessions:{userId}` - Sorted set of session ids, scored
//!   by expiry (unix seconds)
//! - `noti:{userId}:{sessionId}` - Mailbox of one session
//!
//! A session id outlives its connection: the mailbox is kept Inactive with
//! a TTL so a reconnect within that window resumes without losing pushes.

use crate::errors::SignalError;
use crate::sched::{MailboxState, Queue};
use crate::store::CoordinationStore;
use chrono::Utc;
use common::types::UserId;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Session directory plus mailbox factory.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    lock_heartbeat: Duration,
}

fn sessions_key(user_id: UserId) -> String {
    format!("notification:sessions:{user_id}")
}

/// Mailbox name of a session (`mq:` prefix added by the mailbox).
pub fn mailbox_name(user_id: UserId, session_id: &str) -> String {
    format!("noti:{user_id}:{session_id}")
}

impl SessionRegistry {
    /// `ttl` bounds how long a disconnected session stays resumable;
    /// `lock_heartbeat` drives the consumer lock of its mailbox.
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration, lock_heartbeat: Duration) -> Self {
        Self {
            store,
            ttl,
            lock_heartbeat,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn mailbox(&self, user_id: UserId, session_id: &str) -> Queue {
        Queue::new(
            Arc::clone(&self.store),
            &mailbox_name(user_id, session_id),
            self.lock_heartbeat,
        )
    }

    fn expiry_score(&self) -> f64 {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        // Unix seconds fit f64 exactly.
        Utc::now().timestamp().saturating_add(ttl) as f64
    }

    /// Add a new session, evicting entries that already expired.
    pub async fn register(&self, user_id: UserId, session_id: &str) -> Result<(), SignalError> {
        let key = sessions_key(user_id);
        self.store
            .zrem_range_by_score(&key, Utc::now().timestamp() as f64)
            .await?;
        self.store.zadd(&key, session_id, self.expiry_score()).await
    }

    /// Push the session's expiry one TTL into the future.
    pub async fn heartbeat(&self, user_id: UserId, session_id: &str) -> Result<(), SignalError> {
        self.store
            .zadd(&sessions_key(user_id), session_id, self.expiry_score())
            .await
    }

    pub async fn session_ids(&self, user_id: UserId) -> Result<Vec<String>, SignalError> {
        self.store.zrange_all(&sessions_key(user_id)).await
    }

    /// Mailboxes of every session that can still receive, connected or not.
    pub async fn find_sessions(&self, user_id: UserId) -> Result<Vec<Queue>, SignalError> {
        let mut sessions = Vec::new();
        for session_id in self.session_ids(user_id).await? {
            let mailbox = self.mailbox(user_id, &session_id);
            if mailbox.state().await? != MailboxState::Absent {
                sessions.push(mailbox);
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::sched::Message;
    use crate::store::{KeyTtl, MemoryStore};

    #[tokio::test]
    async fn test_find_sessions_skips_torn_down_mailboxes() {
        let registry = SessionRegistry::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let user = UserId(3);
        registry.register(user, "a").await.unwrap();
        registry.register(user, "b").await.unwrap();
        registry
            .mailbox(user, "a")
            .save_state(MailboxState::Inactive)
            .await
            .unwrap();

        assert_eq!(registry.session_ids(user).await.unwrap().len(), 2);
        let live = registry.find_sessions(user).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key(), "mq:noti:3:a");
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionRegistry::new_session_id(), SessionRegistry::new_session_id());
    }

    #[tokio::test]
    async fn test_mailbox_lock_uses_registry_heartbeat() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let heartbeat = Duration::from_millis(500);
        let registry = SessionRegistry::new(Arc::clone(&store), Duration::from_secs(60), heartbeat);
        let mailbox = registry.mailbox(UserId(4), "m");
        mailbox.push(&Message::new("1", "hi")).await.unwrap();

        let mut rx = mailbox.channel().unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "hi");
        match store.ttl("lock:mq:noti:4:m").await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= heartbeat * 2),
            other => panic!("consumer lock should be leased, got {other:?}"),
        }
        mailbox.ack(true).await.unwrap();
        mailbox.close(true).await.unwrap();
    }
}
