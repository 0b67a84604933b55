//! In-memory coordination store.
//!
//! Implements the same semantics as [`RedisStore`](super::RedisStore) for the
//! commands the service issues: per-key expiry, owner-token operations,
//! hashes, sorted sets, lists, sets and pub/sub. State lives behind one
//! mutex, so every method is atomic like a Redis command or script.
//!
//! Expiry uses the tokio clock, so tests running with a paused clock can
//! advance key lifetimes deterministically.

use crate::errors::SignalError;
use crate::store::{CoordinationStore, KeyTtl, ScheduledEntry, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Value>,
    expires_at: HashMap<String, Instant>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl Inner {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .expires_at
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if expired {
            self.values.remove(key);
            self.expires_at.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Value> {
        self.purge_if_expired(key);
        self.values.get_mut(key)
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
        self.expires_at.remove(key);
    }

    fn string(&mut self, key: &str) -> Result<Option<String>, SignalError> {
        match self.live(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn put_string(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.values
            .insert(key.to_string(), Value::Str(value.to_string()));
        match ttl {
            Some(ttl) => {
                self.expires_at.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                self.expires_at.remove(key);
            }
        }
    }

    fn set_ttl(&mut self, key: &str, ttl: Duration) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        self.expires_at.insert(key.to_string(), Instant::now() + ttl);
        true
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>, SignalError> {
        self.purge_if_expired(key);
        let value = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn zset_mut(&mut self, key: &str) -> Result<&mut HashMap<String, f64>, SignalError> {
        self.purge_if_expired(key);
        let value = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::ZSet(HashMap::new()));
        match value {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<String>, SignalError> {
        self.purge_if_expired(key);
        let value = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match value {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut HashSet<String>, SignalError> {
        self.purge_if_expired(key);
        let value = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()));
        match value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key)),
        }
    }

    /// Redis deletes aggregate keys once they become empty.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.values.get(key) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            _ => false,
        };
        if empty {
            self.remove(key);
        }
    }

    fn sorted_members(zset: &HashMap<String, f64>) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> =
            zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

fn wrong_type(key: &str) -> SignalError {
    SignalError::Store(format!("WRONGTYPE operation against key {key}"))
}

/// In-memory [`CoordinationStore`].
///
/// Clones share state, the way several processes share one Redis.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> Result<R, SignalError>) -> Result<R, SignalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SignalError::Store("memory store lock poisoned".to_string()))?;
        f(&mut inner)
    }

    /// True if `key` currently exists (test helper).
    pub fn exists(&self, key: &str) -> bool {
        self.with(|inner| Ok(inner.live(key).is_some()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SignalError> {
        self.with(|inner| inner.string(key))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), SignalError> {
        self.with(|inner| {
            inner.purge_if_expired(key);
            inner.put_string(key, value, ttl);
            Ok(())
        })
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, SignalError> {
        self.with(|inner| {
            if inner.live(key).is_some() {
                return Ok(false);
            }
            inner.put_string(key, value, ttl);
            Ok(true)
        })
    }

    async fn del(&self, keys: &[&str]) -> Result<(), SignalError> {
        self.with(|inner| {
            for key in keys {
                inner.remove(key);
            }
            Ok(())
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, SignalError> {
        self.with(|inner| Ok(inner.set_ttl(key, ttl)))
    }

    async fn persist(&self, key: &str) -> Result<(), SignalError> {
        self.with(|inner| {
            inner.purge_if_expired(key);
            inner.expires_at.remove(key);
            Ok(())
        })
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, SignalError> {
        self.with(|inner| {
            if inner.live(key).is_none() {
                return Ok(KeyTtl::Missing);
            }
            Ok(match inner.expires_at.get(key) {
                None => KeyTtl::Persistent,
                Some(deadline) => {
                    KeyTtl::Expires(deadline.saturating_duration_since(Instant::now()))
                }
            })
        })
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, SignalError> {
        self.with(|inner| {
            if inner.string(key)?.as_deref() == Some(token) {
                inner.remove(key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, SignalError> {
        self.with(|inner| {
            if inner.string(key)?.as_deref() == Some(token) {
                return Ok(inner.set_ttl(key, ttl));
            }
            Ok(false)
        })
    }

    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, SignalError> {
        self.with(|inner| match inner.string(key)? {
            None => {
                inner.put_string(key, owner, Some(ttl));
                Ok(true)
            }
            Some(current) if current == owner => Ok(inner.set_ttl(key, ttl)),
            Some(_) => Ok(false),
        })
    }

    async fn release_claim(&self, key: &str, owner: &str) -> Result<bool, SignalError> {
        self.with(|inner| match inner.string(key)? {
            None => Ok(true),
            Some(current) if current == owner => {
                inner.remove(key);
                Ok(true)
            }
            Some(_) => Ok(false),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), SignalError> {
        self.with(|inner| {
            inner
                .hash_mut(key)?
                .insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, SignalError> {
        self.with(|inner| match inner.live(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hget_all(&self, key: &str) -> Result<Vec<(String, String)>, SignalError> {
        self.with(|inner| match inner.live(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(h)) => Ok(h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), SignalError> {
        self.with(|inner| {
            if inner.live(key).is_none() {
                return Ok(());
            }
            inner.hash_mut(key)?.remove(field);
            inner.drop_if_empty(key);
            Ok(())
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), SignalError> {
        self.with(|inner| {
            inner.zset_mut(key)?.insert(member.to_string(), score);
            Ok(())
        })
    }

    async fn schedule_entry(&self, entry: &ScheduledEntry<'_>) -> Result<(), SignalError> {
        self.with(|inner| {
            inner
                .hash_mut(entry.hash)?
                .insert(entry.member.to_string(), entry.value.to_string());
            inner
                .zset_mut(entry.zset)?
                .insert(entry.member.to_string(), entry.score);
            if let Some(sender) = inner.channels.get(entry.wake) {
                let _ = sender.send(String::new());
            }
            Ok(())
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), SignalError> {
        self.with(|inner| {
            if inner.live(key).is_none() {
                return Ok(());
            }
            inner.zset_mut(key)?.remove(member);
            inner.drop_if_empty(key);
            Ok(())
        })
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>, SignalError> {
        self.with(|inner| {
            if inner.live(key).is_none() {
                return Ok(None);
            }
            let zset = inner.zset_mut(key)?;
            let first = Inner::sorted_members(zset).into_iter().next();
            if let Some((member, _)) = &first {
                zset.remove(member);
            }
            inner.drop_if_empty(key);
            Ok(first)
        })
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, SignalError> {
        self.with(|inner| match inner.live(key) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(z)) => Ok(Inner::sorted_members(z)
                .into_iter()
                .map(|(member, _)| member)
                .collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn zrem_range_by_score(&self, key: &str, max: f64) -> Result<(), SignalError> {
        self.with(|inner| {
            if inner.live(key).is_none() {
                return Ok(());
            }
            inner.zset_mut(key)?.retain(|_, score| *score > max);
            inner.drop_if_empty(key);
            Ok(())
        })
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), SignalError> {
        self.with(|inner| {
            inner.list_mut(key)?.push_back(value.to_string());
            Ok(())
        })
    }

    async fn lindex_head(&self, key: &str) -> Result<Option<String>, SignalError> {
        self.with(|inner| match inner.live(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(l.front().cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, SignalError> {
        self.with(|inner| {
            if inner.live(key).is_none() {
                return Ok(None);
            }
            let popped = inner.list_mut(key)?.pop_front();
            inner.drop_if_empty(key);
            Ok(popped)
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), SignalError> {
        self.with(|inner| {
            inner.set_mut(key)?.insert(member.to_string());
            Ok(())
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, SignalError> {
        self.with(|inner| match inner.live(key) {
            None => Ok(false),
            Some(Value::Set(s)) => Ok(s.contains(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SignalError> {
        self.with(|inner| {
            if let Some(sender) = inner.channels.get(channel) {
                // No receivers is not an error, same as PUBLISH to nobody.
                let _ = sender.send(payload.to_string());
            }
            Ok(())
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, SignalError> {
        let mut source = self.with(|inner| {
            Ok(inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe())
        })?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx, forwarder))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_string_expiry_follows_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_schedule_entry_writes_payload_deadline_and_wake() {
        let store = MemoryStore::new();
        let mut wake = store.subscribe("dq:t:sub").await.unwrap();
        let entry = ScheduledEntry {
            hash: "dq:t:h",
            zset: "dq:t:z",
            wake: "dq:t:sub",
            member: "m1",
            value: "first",
            score: 10.0,
        };
        store.schedule_entry(&entry).await.unwrap();
        store
            .schedule_entry(&ScheduledEntry {
                value: "second",
                score: 20.0,
                ..entry
            })
            .await
            .unwrap();

        assert_eq!(wake.recv().await.as_deref(), Some(""));
        assert_eq!(store.hget("dq:t:h", "m1").await.unwrap().as_deref(), Some("second"));
        assert_eq!(
            store.zpop_min("dq:t:z").await.unwrap(),
            Some(("m1".to_string(), 20.0))
        );
    }

    #[tokio::test]
    async fn test_set_nx_and_compare_and_delete() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock:a", "t1", None).await.unwrap());
        assert!(!store.set_nx("lock:a", "t2", None).await.unwrap());

        assert!(!store.compare_and_delete("lock:a", "t2").await.unwrap());
        assert!(store.compare_and_delete("lock:a", "t1").await.unwrap());
        assert!(!store.exists("lock:a"));
    }

    #[tokio::test]
    async fn test_claim_is_owner_renewable() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.claim("call:userLock:1", "10", ttl).await.unwrap());
        assert!(store.claim("call:userLock:1", "10", ttl).await.unwrap());
        assert!(!store.claim("call:userLock:1", "11", ttl).await.unwrap());

        assert!(!store.release_claim("call:userLock:1", "11").await.unwrap());
        assert!(store.release_claim("call:userLock:1", "10").await.unwrap());
        assert!(store.release_claim("call:userLock:1", "10").await.unwrap());
    }

    #[tokio::test]
    async fn test_zset_pops_in_score_order() {
        let store = MemoryStore::new();
        store.zadd("z", "b", 2.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "c", 3.0).await.unwrap();

        assert_eq!(store.zrange_all("z").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            store.zpop_min("z").await.unwrap(),
            Some(("a".to_string(), 1.0))
        );

        store.zrem_range_by_score("z", 2.0).await.unwrap();
        assert_eq!(store.zrange_all("z").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_list_empties_remove_key() {
        let store = MemoryStore::new();
        store.rpush("mq:x", "1").await.unwrap();
        store.rpush("mq:x", "2").await.unwrap();
        assert_eq!(store.lindex_head("mq:x").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.lpop("mq:x").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.lpop("mq:x").await.unwrap().as_deref(), Some("2"));
        assert!(!store.exists("mq:x"));
    }

    #[tokio::test]
    async fn test_wrong_type_is_store_error() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        let err = store.rpush("k", "x").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("chan").await.unwrap();
        store.publish("chan", "hello").await.unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
    }
}
