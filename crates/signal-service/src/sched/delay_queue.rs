//! Deadline-ordered delay queue.
//!
//! # Key Patterns
//!
//! - `dq:{name}:z` - Sorted set, member = message id, score = due unix millis
//! - `dq:{name}:h` - Hash, message id -> message JSON
//! - `dq:{name}:sub` - Pub/sub channel that wakes the poller on new items
//!
//! A single poller per queue pops the earliest item once it is within
//! [`SAFETY_MARGIN`] of its deadline. If it pops an item early (woken by a
//! newer, earlier insertion, or its sleep estimate was stale) it puts the
//! item back and sleeps again. Delivered items are removed from the hash,
//! so each fires at most once.

use crate::errors::SignalError;
use crate::sched::message::{DelayMessage, Message};
use crate::store::{CoordinationStore, ScheduledEntry, Subscription};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Items within this much of their deadline are delivered.
pub const SAFETY_MARGIN: Duration = Duration::from_millis(3);

/// Longest wait when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Backoff after a store error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Named deadline scheduler. See the module docs.
pub struct DelayQueue {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    cancel: CancellationToken,
    started: AtomicBool,
}

#[derive(Clone)]
struct Keys {
    zset: String,
    hash: String,
    wake: String,
}

impl DelayQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, name: &str) -> Self {
        Self {
            store,
            keys: Keys {
                zset: format!("dq:{name}:z"),
                hash: format!("dq:{name}:h"),
                wake: format!("dq:{name}:sub"),
            },
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Schedule `message` for `at`. An item with the same id is replaced.
    #[instrument(skip_all, fields(queue = %self.keys.zset, id = %message.id))]
    pub async fn schedule(&self, at: DateTime<Utc>, message: &Message) -> Result<(), SignalError> {
        if message.id.is_empty() {
            return Err(SignalError::BadRequest("delay message id must not be empty".to_string()));
        }
        let json = serde_json::to_string(message)
            .map_err(|e| SignalError::Internal(format!("encode delay message: {e}")))?;
        // Timestamps in millis fit f64 exactly.
        let score = at.timestamp_millis() as f64;

        self.store
            .schedule_entry(&ScheduledEntry {
                hash: &self.keys.hash,
                zset: &self.keys.zset,
                wake: &self.keys.wake,
                member: &message.id,
                value: &json,
                score,
            })
            .await
    }

    /// Schedule `message` to fire after `delay`.
    pub async fn delay(&self, delay: Duration, message: &Message) -> Result<(), SignalError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| SignalError::BadRequest(format!("delay out of range: {e}")))?;
        self.schedule(Utc::now() + delay, message).await
    }

    /// Cancel a pending item. No-op if it already fired or never existed.
    pub async fn delete(&self, id: &str) -> Result<(), SignalError> {
        self.store.zrem(&self.keys.zset, id).await?;
        self.store.hdel(&self.keys.hash, id).await?;
        Ok(())
    }

    /// Start the poller and return its output. Only the first call gets the
    /// receiver; a queue has a single logical consumer.
    pub fn channel(&self) -> Option<mpsc::Receiver<DelayMessage>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = mpsc::channel(1);
        let poller = Poller {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(poller.run(tx));
        Some(rx)
    }

    /// Stop the poller. With `clear`, delete every pending item as well.
    pub async fn close(&self, clear: bool) -> Result<(), SignalError> {
        self.cancel.cancel();
        if clear {
            self.store
                .del(&[&self.keys.zset, &self.keys.hash, &self.keys.wake])
                .await?;
        }
        Ok(())
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Step {
    Idle,
    NotDue(Duration),
    Fired(DelayMessage),
    Skipped,
}

struct Poller {
    store: Arc<dyn CoordinationStore>,
    keys: Keys,
    cancel: CancellationToken,
}

async fn next_wake(subscription: &mut Option<Subscription>) -> Option<String> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

impl Poller {
    async fn run(self, tx: mpsc::Sender<DelayMessage>) {
        let mut wake = match self.store.subscribe(&self.keys.wake).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(target: "sig.sched.dq", queue = %self.keys.zset, error = %e,
                    "Wake subscription failed, falling back to polling");
                None
            }
        };
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                woke = next_wake(&mut wake) => {
                    if woke.is_none() {
                        wake = None;
                    }
                }
                _ = tokio::time::sleep(delay.saturating_sub(SAFETY_MARGIN)) => {}
            }

            delay = match self.step().await {
                Ok(Step::Idle) => IDLE_WAIT,
                Ok(Step::NotDue(wait)) => wait,
                Ok(Step::Skipped) => Duration::ZERO,
                Ok(Step::Fired(item)) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = tx.send(item) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                    Duration::ZERO
                }
                Err(e) => {
                    warn!(target: "sig.sched.dq", queue = %self.keys.zset, error = %e, "Delay queue poll failed");
                    ERROR_BACKOFF
                }
            };
        }

        debug!(target: "sig.sched.dq", queue = %self.keys.zset, "Delay queue poller stopped");
    }

    async fn step(&self) -> Result<Step, SignalError> {
        let Some((id, score)) = self.store.zpop_min(&self.keys.zset).await? else {
            return Ok(Step::Idle);
        };

        let due_ms = score as i64;
        let wait_ms = due_ms - Utc::now().timestamp_millis();
        if wait_ms > SAFETY_MARGIN.as_millis() as i64 {
            self.store.zadd(&self.keys.zset, &id, score).await?;
            return Ok(Step::NotDue(Duration::from_millis(wait_ms.unsigned_abs())));
        }

        let Some(json) = self.store.hget(&self.keys.hash, &id).await? else {
            // Deleted between ZADD and now.
            return Ok(Step::Skipped);
        };
        self.store.hdel(&self.keys.hash, &id).await?;

        match serde_json::from_str::<Message>(&json) {
            Ok(message) => Ok(Step::Fired(DelayMessage {
                message,
                due_at: DateTime::from_timestamp_millis(due_ms).unwrap_or_else(Utc::now),
            })),
            Err(e) => {
                warn!(target: "sig.sched.dq", queue = %self.keys.zset, id = %id, error = %e,
                    "Dropping undecodable delay message");
                Ok(Step::Skipped)
            }
        }
    }
}
