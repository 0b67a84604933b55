//! Mailbox: a named FIFO with one in-flight consumer.
//!
//! # Key Patterns
//!
//! - `mq:{name}` - List of message JSON, head first
//! - `{name}:state` - Liveness flag (see [`MailboxState`])
//! - `lock:mq:{name}` - Consumer lock, held from read to ack
//!
//! The consumer loop takes the mailbox lock, waits for a head item, hands
//! it out without removing it, and waits for [`Queue::ack`]. A successful
//! ack pops the head; any ack releases the lock so the next read (possibly
//! in another process) can proceed.
//!
//! Handles built with [`Queue::producer`] carry no lock and cannot consume.

use crate::errors::SignalError;
use crate::sched::lock::Lock;
use crate::sched::message::Message;
use crate::store::{CoordinationStore, KeyTtl};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Delay between head reads while the mailbox is empty.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Liveness flag of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    /// Never created, or torn down.
    Absent = 0,
    /// A consumer is attached.
    Active = 1,
    /// Kept for resumption, no consumer attached.
    Inactive = 2,
}

impl MailboxState {
    fn from_raw(raw: Option<&str>) -> Self {
        match raw.and_then(|s| s.parse::<i64>().ok()) {
            Some(1) => MailboxState::Active,
            Some(2) => MailboxState::Inactive,
            _ => MailboxState::Absent,
        }
    }
}

/// Mailbox handle. See the module docs.
pub struct Queue {
    store: Arc<dyn CoordinationStore>,
    key: String,
    state_key: String,
    lock: Option<Arc<Lock>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Queue {
    /// Consumer-capable handle; the consumer lock is renewed every
    /// `lock_heartbeat` while a message is in flight.
    pub fn new(store: Arc<dyn CoordinationStore>, name: &str, lock_heartbeat: Duration) -> Self {
        let key = format!("mq:{name}");
        let lock = Arc::new(Lock::new(Arc::clone(&store), &key, lock_heartbeat));
        Self::build(store, name, key, Some(lock))
    }

    /// Push-only handle.
    pub fn producer(store: Arc<dyn CoordinationStore>, name: &str) -> Self {
        Self::build(store, name, format!("mq:{name}"), None)
    }

    fn build(
        store: Arc<dyn CoordinationStore>,
        name: &str,
        key: String,
        lock: Option<Arc<Lock>>,
    ) -> Self {
        Self {
            store,
            state_key: format!("{name}:state"),
            key,
            lock,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Set the liveness flag. Clears any TTL on the flag.
    pub async fn save_state(&self, state: MailboxState) -> Result<(), SignalError> {
        self.store
            .set(&self.state_key, &(state as i64).to_string(), None)
            .await
    }

    /// Read the liveness flag. Missing reads as `Absent`.
    pub async fn state(&self) -> Result<MailboxState, SignalError> {
        let raw = self.store.get(&self.state_key).await?;
        Ok(MailboxState::from_raw(raw.as_deref()))
    }

    /// Append a message.
    pub async fn push(&self, message: &Message) -> Result<(), SignalError> {
        if self.cancel.is_cancelled() {
            return Err(SignalError::Cancelled);
        }
        let json = serde_json::to_string(message)
            .map_err(|e| SignalError::Internal(format!("encode mailbox message: {e}")))?;
        self.store.rpush(&self.key, &json).await
    }

    /// Serialize `value` into a fresh message and append it.
    pub async fn push_value<T: Serialize>(&self, value: &T) -> Result<(), SignalError> {
        self.push(&Message::encode(value)?).await
    }

    /// Append only if the mailbox was activated, then match the list's
    /// expiry to the flag's so idle mailboxes are reclaimed together.
    #[instrument(skip_all, fields(mailbox = %self.key))]
    pub async fn push_if_state_exists(&self, message: &Message) -> Result<(), SignalError> {
        let ttl = self.store.ttl(&self.state_key).await?;
        if ttl == KeyTtl::Missing {
            return Err(SignalError::MailboxInactive);
        }
        self.push(message).await?;
        if let KeyTtl::Expires(remaining) = ttl {
            self.store.expire(&self.key, remaining).await?;
        }
        Ok(())
    }

    /// Start the consumer loop and return its output. Only the first call
    /// on a consumer handle gets the receiver.
    pub fn channel(&self) -> Option<mpsc::Receiver<Message>> {
        let lock = self.lock.as_ref()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = mpsc::channel(1);
        let consumer = Consumer {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            lock: Arc::clone(lock),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(consumer.run(tx));
        Some(rx)
    }

    /// Acknowledge the message last handed out. On success it is removed;
    /// in every case the consumer lock is released.
    pub async fn ack(&self, success: bool) -> Result<(), SignalError> {
        let popped = if success {
            self.store.lpop(&self.key).await.map(|_| ())
        } else {
            Ok(())
        };
        self.release().await;
        popped
    }

    async fn release(&self) {
        if let Some(lock) = &self.lock {
            lock.unlock().await;
        }
    }

    /// Give both keys a TTL.
    pub async fn expire(&self, ttl: Duration) -> Result<(), SignalError> {
        self.store.expire(&self.key, ttl).await?;
        self.store.expire(&self.state_key, ttl).await?;
        Ok(())
    }

    /// Remove the TTL from both keys.
    pub async fn clear_expire(&self) -> Result<(), SignalError> {
        self.store.persist(&self.key).await?;
        self.store.persist(&self.state_key).await?;
        Ok(())
    }

    /// Stop delivery and release the consumer lock. With `clear`, delete
    /// the messages and the liveness flag.
    pub async fn close(&self, clear: bool) -> Result<(), SignalError> {
        self.cancel.cancel();
        self.release().await;
        if clear {
            self.store.del(&[&self.key, &self.state_key]).await?;
        }
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Consumer {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lock: Arc<Lock>,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(self, tx: mpsc::Sender<Message>) {
        loop {
            match self.first().await {
                Ok(message) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = tx.send(message) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(SignalError::Cancelled) => break,
                Err(e) => {
                    warn!(target: "sig.sched.mq", mailbox = %self.key, error = %e, "Mailbox read failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            }
        }
        debug!(target: "sig.sched.mq", mailbox = %self.key, "Mailbox consumer stopped");
    }

    /// Take the lock, then wait for a head item.
    async fn first(&self) -> Result<Message, SignalError> {
        if !self.lock.lock_until(&self.cancel).await {
            if self.cancel.is_cancelled() {
                return Err(SignalError::Cancelled);
            }
            return Err(SignalError::Store("mailbox lock not acquired".to_string()));
        }

        loop {
            if self.cancel.is_cancelled() {
                self.lock.unlock().await;
                return Err(SignalError::Cancelled);
            }
            match self.store.lindex_head(&self.key).await {
                Ok(Some(json)) => match serde_json::from_str::<Message>(&json) {
                    Ok(message) => return Ok(message),
                    Err(e) => {
                        warn!(target: "sig.sched.mq", mailbox = %self.key, error = %e,
                            "Dropping undecodable mailbox entry");
                        self.store.lpop(&self.key).await?;
                        continue;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "sig.sched.mq", mailbox = %self.key, error = %e, "Mailbox head read failed");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const HEARTBEAT: Duration = Duration::from_secs(1);

    fn store() -> Arc<dyn CoordinationStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_with_ack_gating() {
        let queue = Queue::new(store(), "test", HEARTBEAT);
        for i in 0..10 {
            queue.push(&Message::new(i.to_string(), i.to_string())).await.unwrap();
        }

        let mut rx = queue.channel().unwrap();
        for i in 0..10 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload, i.to_string());
            queue.ack(true).await.unwrap();
        }

        queue.close(true).await.unwrap();
        let err = queue.push(&Message::new("late", "late")).await.unwrap_err();
        assert!(matches!(err, SignalError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_redelivers_head() {
        let queue = Queue::new(store(), "redeliver", HEARTBEAT);
        queue.push(&Message::new("a", "a")).await.unwrap();
        queue.push(&Message::new("b", "b")).await.unwrap();

        let mut rx = queue.channel().unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "a");
        queue.ack(false).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "a");
        queue.ack(true).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "b");
        queue.ack(true).await.unwrap();
        queue.close(true).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_waits_for_late_push() {
        let store = store();
        let consumer = Queue::new(Arc::clone(&store), "late", HEARTBEAT);
        let producer = Queue::producer(Arc::clone(&store), "late");
        let mut rx = consumer.channel().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            producer.push(&Message::new("x", "hello")).await.unwrap();
        });

        assert_eq!(rx.recv().await.unwrap().payload, "hello");
        consumer.ack(true).await.unwrap();
        consumer.close(true).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_consumers_never_share_in_flight() {
        let store = store();
        let first = Queue::new(Arc::clone(&store), "shared", HEARTBEAT);
        let second = Queue::new(Arc::clone(&store), "shared", HEARTBEAT);
        first.push(&Message::new("1", "1")).await.unwrap();
        first.push(&Message::new("2", "2")).await.unwrap();

        let mut rx1 = first.channel().unwrap();
        let mut rx2 = second.channel().unwrap();

        let got = rx1.recv().await.unwrap();
        assert_eq!(got.payload, "1");
        // While the first consumer holds "1" unacked, the second sees nothing.
        let blocked = tokio::time::timeout(Duration::from_secs(1), rx2.recv()).await;
        assert!(blocked.is_err());

        first.ack(true).await.unwrap();
        first.close(false).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.payload, "2");
        second.ack(true).await.unwrap();
        second.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_state_flag_and_push_if_state_exists() {
        let store = store();
        let queue = Queue::new(Arc::clone(&store), "noti:1:s", HEARTBEAT);
        assert_eq!(queue.state().await.unwrap(), MailboxState::Absent);

        let err = queue
            .push_if_state_exists(&Message::new("m", "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::MailboxInactive));

        queue.save_state(MailboxState::Active).await.unwrap();
        assert_eq!(queue.state().await.unwrap(), MailboxState::Active);
        queue.push_if_state_exists(&Message::new("m", "m")).await.unwrap();
        assert_eq!(store.ttl("mq:noti:1:s").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_if_state_exists_syncs_expiry() {
        let store = store();
        let queue = Queue::new(Arc::clone(&store), "noti:2:s", HEARTBEAT);
        queue.save_state(MailboxState::Inactive).await.unwrap();
        queue.push(&Message::new("m", "m")).await.unwrap();
        queue.expire(Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        queue.push_if_state_exists(&Message::new("n", "n")).await.unwrap();
        match store.ttl("mq:noti:2:s").await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(40)),
            other => unreachable!("unexpected ttl {other:?}"),
        }

        queue.clear_expire().await.unwrap();
        assert_eq!(store.ttl("noti:2:s:state").await.unwrap(), KeyTtl::Persistent);
        assert_eq!(store.ttl("mq:noti:2:s").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_lock_follows_configured_heartbeat() {
        let store = store();
        let queue = Queue::new(Arc::clone(&store), "lease", HEARTBEAT);
        queue.push(&Message::new("a", "a")).await.unwrap();
        let mut rx = queue.channel().unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "a");

        // Held well past one lease while the message is in flight.
        tokio::time::sleep(HEARTBEAT * 5).await;
        match store.ttl("lock:mq:lease").await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= HEARTBEAT * 2),
            other => unreachable!("unexpected ttl {other:?}"),
        }

        queue.ack(true).await.unwrap();
        assert_eq!(store.ttl("lock:mq:lease").await.unwrap(), KeyTtl::Missing);
        queue.close(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_producer_cannot_consume() {
        let store = store();
        let producer = Queue::producer(Arc::clone(&store), "push-only");
        assert!(producer.channel().is_none());
        producer.push(&Message::new("a", "a")).await.unwrap();
        producer.ack(false).await.unwrap();
        producer.close(true).await.unwrap();
        assert_eq!(store.ttl("mq:push-only").await.unwrap(), KeyTtl::Missing);
    }
}
