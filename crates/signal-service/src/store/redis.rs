//! Redis-backed coordination store.
//!
//! # Connection Pattern
//!
//! Commands go through a `MultiplexedConnection`, which is cheap to clone and
//! safe to use concurrently: each operation clones it. Pub/sub needs a
//! dedicated connection, so every [`Subscription`] opens its own and a
//! forwarding task feeds an `mpsc` channel until the subscription is dropped.
//!
//! Blocking commands are never issued on the multiplexed connection; the
//! delay-queue poller does its own waiting.

use crate::errors::SignalError;
use crate::store::{lua_scripts, CoordinationStore, KeyTtl, ScheduledEntry, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};

/// Buffer between a Redis pub/sub connection and its subscriber.
const SUBSCRIPTION_BUFFER: usize = 16;

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis implementation of [`CoordinationStore`].
///
/// Cheaply cloneable; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    compare_and_delete_script: Script,
    compare_and_expire_script: Script,
    claim_script: Script,
    release_claim_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Store` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, SignalError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may carry credentials.
            error!(target: "sig.store.redis", error = %e, "Failed to open Redis client");
            SignalError::Store(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "sig.store.redis", error = %e, "Failed to connect to Redis");
                SignalError::Store(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            client,
            connection,
            compare_and_delete_script: Script::new(lua_scripts::COMPARE_AND_DELETE),
            compare_and_expire_script: Script::new(lua_scripts::COMPARE_AND_EXPIRE),
            claim_script: Script::new(lua_scripts::CLAIM),
            release_claim_script: Script::new(lua_scripts::RELEASE_CLAIM),
        })
    }

    /// Round trip behind `/ready`.
    pub async fn ping(&self) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SignalError> {
        let mut conn = self.connection.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, SignalError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[&str]) -> Result<(), SignalError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, SignalError> {
        let mut conn = self.connection.clone();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn persist(&self, key: &str) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.persist(key).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, SignalError> {
        let mut conn = self.connection.clone();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(KeyTtl::from_pttl(pttl))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, SignalError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .compare_and_delete_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, SignalError> {
        let mut conn = self.connection.clone();
        let extended: i64 = self
            .compare_and_expire_script
            .key(key)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, SignalError> {
        let mut conn = self.connection.clone();
        let held: i64 = self
            .claim_script
            .key(key)
            .arg(owner)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn release_claim(&self, key: &str, owner: &str) -> Result<bool, SignalError> {
        let mut conn = self.connection.clone();
        let released: i64 = self
            .release_claim_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, SignalError> {
        let mut conn = self.connection.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hget_all(&self, key: &str) -> Result<Vec<(String, String)>, SignalError> {
        let mut conn = self.connection.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(zset = %entry.zset))]
    async fn schedule_entry(&self, entry: &ScheduledEntry<'_>) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(entry.hash, entry.member, entry.value)
            .ignore()
            .zadd(entry.zset, entry.member, entry.score)
            .ignore()
            .publish(entry.wake, "")
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, f64)>, SignalError> {
        let mut conn = self.connection.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(key)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(popped.into_iter().next())
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, SignalError> {
        let mut conn = self.connection.clone();
        Ok(conn.zrange(key, 0, -1).await?)
    }

    async fn zrem_range_by_score(&self, key: &str, max: f64) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lindex_head(&self, key: &str) -> Result<Option<String>, SignalError> {
        let mut conn = self.connection.clone();
        Ok(conn.lindex(key, 0).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, SignalError> {
        let mut conn = self.connection.clone();
        let popped: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;
        Ok(popped)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, SignalError> {
        let mut conn = self.connection.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SignalError> {
        let mut conn = self.connection.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(channel = %channel))]
    async fn subscribe(&self, channel: &str) -> Result<Subscription, SignalError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            error!(target: "sig.store.redis", error = %e, "Failed to open pub/sub connection");
            SignalError::Store(format!("Failed to open pub/sub connection: {e}"))
        })?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = msg.get_payload().unwrap_or_default();
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(target: "sig.store.redis", channel = %name, "Subscription forwarder stopped");
        });

        Ok(Subscription::new(rx, forwarder))
    }
}
