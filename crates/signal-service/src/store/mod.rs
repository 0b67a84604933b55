//! Coordination store abstraction.
//!
//! Every cross-process primitive (lock, delay queue, mailbox) and every
//! keyed lookup of a manager or session goes through [`CoordinationStore`].
//! Production uses [`RedisStore`]; tests and single-node development use
//! [`MemoryStore`], which follows the same semantics for the subset of
//! commands the service needs.

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::errors::SignalError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist.
    Missing,
    /// Key exists without an expiry.
    Persistent,
    /// Key expires after this duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Map a `PTTL` reply (-2 missing, -1 persistent, else millis).
    pub fn from_pttl(millis: i64) -> Self {
        match millis {
            -2 => KeyTtl::Missing,
            m if m < 0 => KeyTtl::Persistent,
            m => KeyTtl::Expires(Duration::from_millis(m.unsigned_abs())),
        }
    }
}

/// Receive side of a pub/sub channel.
///
/// Messages are forwarded by a background task that stops when the
/// subscription is dropped.
pub struct Subscription {
    receiver: mpsc::Receiver<String>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(receiver: mpsc::Receiver<String>, forwarder: JoinHandle<()>) -> Self {
        Self {
            receiver,
            forwarder,
        }
    }

    /// Next published payload, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// A delay-queue entry written by [`CoordinationStore::schedule_entry`].
#[derive(Debug, Clone, Copy)]
pub struct ScheduledEntry<'a> {
    /// Hash holding the payload under `member`.
    pub hash: &'a str,
    /// Sorted set holding `member` scored by due time.
    pub zset: &'a str,
    /// Channel told about the new deadline.
    pub wake: &'a str,
    pub member: &'a str,
    pub value: &'a str,
    pub score: f64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Shared, low-latency key-value store used for all coordination.
///
/// Implementations must make each method atomic with respect to the keys it
/// touches. Owner-token operations (`compare_and_*`, `claim`,
/// `release_claim`) are single atomic steps.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, SignalError>;

    /// Set a value, optionally with a TTL. Replaces any existing TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), SignalError>;

    /// Set only if absent. Returns true if the key was set.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, SignalError>;

    async fn del(&self, keys: &[&str]) -> Result<(), SignalError>;

    /// Set a TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, SignalError>;

    /// Remove any TTL from the key.
    async fn persist(&self, key: &str) -> Result<(), SignalError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, SignalError>;

    /// Delete `key` only if it holds `token`.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, SignalError>;

    /// Extend the TTL of `key` only if it holds `token`.
    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, SignalError>;

    /// Take `key` for `owner` if free, or renew it if `owner` already holds
    /// it. Returns false when someone else holds it.
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, SignalError>;

    /// Release `key` if held by `owner`. Returns true when the key is gone
    /// afterwards and false when someone else holds it.
    async fn release_claim(&self, key: &str, owner: &str) -> Result<bool, SignalError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), SignalError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, SignalError>;

    async fn hget_all(&self, key: &str) -> Result<Vec<(String, String)>, SignalError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), SignalError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), SignalError>;

    /// `HSET` the payload, `ZADD` the deadline and `PUBLISH` a wake as one
    /// transaction, so a poller never pairs a new payload with an old
    /// deadline.
    async fn schedule_entry(&self, entry: &ScheduledEntry<'_>) -> Result<(), SignalError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<(), SignalError>;

    /// Remove and return the lowest-scored member.
    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>, SignalError>;

    /// All members ordered by score.
    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, SignalError>;

    /// Remove members with score `<= max`.
    async fn zrem_range_by_score(&self, key: &str, max: f64) -> Result<(), SignalError>;

    async fn rpush(&self, key: &str, value: &str) -> Result<(), SignalError>;

    /// Head of a list without removing it.
    async fn lindex_head(&self, key: &str) -> Result<Option<String>, SignalError>;

    async fn lpop(&self, key: &str) -> Result<Option<String>, SignalError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), SignalError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, SignalError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SignalError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, SignalError>;
}
