//! Leased distributed lock.
//!
//! A [`Lock`] owns the store key `lock:<name>`. Acquisition writes a fresh
//! random token with `SET NX PX`, polling every [`RETRY_INTERVAL`] until it
//! wins or the attempt is cancelled. While held, a background task extends
//! the lease every heartbeat, but only while the key still carries our
//! token. Release is compare-and-delete on the token.
//!
//! A handle is not reentrant: it also holds a local mutex from acquisition
//! to release, so a second `lock()` on the same handle waits for an
//! `unlock()` from another task. `unlock()` also cancels an acquisition that
//! is still polling on this handle.

use crate::store::CoordinationStore;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delay between acquisition attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Attempt {
    token: Option<String>,
    cancel: Option<CancellationToken>,
    guard: Option<OwnedMutexGuard<()>>,
}

/// Distributed lock handle. See the module docs.
pub struct Lock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    heartbeat: Duration,
    local: Arc<tokio::sync::Mutex<()>>,
    attempt: Mutex<Attempt>,
}

impl Lock {
    /// Create a handle for `lock:<name>` renewed every `heartbeat`.
    /// The lease is twice the heartbeat.
    pub fn new(store: Arc<dyn CoordinationStore>, name: &str, heartbeat: Duration) -> Self {
        Self {
            store,
            key: format!("lock:{name}"),
            heartbeat,
            local: Arc::new(tokio::sync::Mutex::new(())),
            attempt: Mutex::new(Attempt::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn lease(&self) -> Duration {
        self.heartbeat * 2
    }

    /// Acquire, polling until success or until `unlock()` cancels the attempt.
    pub async fn lock(&self) -> bool {
        self.lock_until(&CancellationToken::new()).await
    }

    /// Acquire, polling until success, until `stop` is cancelled, or until
    /// `unlock()` cancels the attempt. Returns false if cancelled first.
    pub async fn lock_until(&self, stop: &CancellationToken) -> bool {
        let guard = tokio::select! {
            guard = self.local.clone().lock_owned() => guard,
            _ = stop.cancelled() => return false,
        };
        let token = Uuid::new_v4().to_string();
        let cancel = stop.child_token();
        self.begin(&token, &cancel);

        let mut acquired = false;
        while !cancel.is_cancelled() {
            match self.store.set_nx(&self.key, &token, Some(self.lease())).await {
                Ok(true) => {
                    acquired = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(target: "sig.sched.lock", key = %self.key, error = %e, "Lock attempt failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }

        self.finish(acquired, token, cancel, guard).await
    }

    /// Single acquisition attempt without polling.
    pub async fn try_lock(&self) -> bool {
        let Ok(guard) = self.local.clone().try_lock_owned() else {
            return false;
        };
        let token = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.begin(&token, &cancel);

        let acquired = match self.store.set_nx(&self.key, &token, Some(self.lease())).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(target: "sig.sched.lock", key = %self.key, error = %e, "Lock attempt failed");
                false
            }
        };

        self.finish(acquired, token, cancel, guard).await
    }

    fn begin(&self, token: &str, cancel: &CancellationToken) {
        let mut attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
        attempt.token = Some(token.to_string());
        attempt.cancel = Some(cancel.clone());
    }

    async fn finish(
        &self,
        acquired: bool,
        token: String,
        cancel: CancellationToken,
        guard: OwnedMutexGuard<()>,
    ) -> bool {
        if acquired && cancel.is_cancelled() {
            // unlock() raced the winning SET; give the lease back ourselves.
            let _ = self.store.compare_and_delete(&self.key, &token).await;
            return false;
        }
        if !acquired {
            let mut attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
            if attempt.token.as_deref() == Some(token.as_str()) {
                *attempt = Attempt::default();
            }
            return false;
        }

        {
            let mut attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
            attempt.guard = Some(guard);
        }
        self.spawn_renewal(token, cancel);
        debug!(target: "sig.sched.lock", key = %self.key, "Lock acquired");
        true
    }

    fn spawn_renewal(&self, token: String, cancel: CancellationToken) {
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let heartbeat = self.heartbeat;
        let lease = self.lease();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.compare_and_expire(&key, &token, lease).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(target: "sig.sched.lock", key = %key, "Lease lost before renewal");
                                break;
                            }
                            Err(e) => {
                                warn!(target: "sig.sched.lock", key = %key, error = %e, "Lease renewal failed");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Release the lease. Returns true only if this handle still owned it.
    /// Also cancels an acquisition still polling on this handle.
    pub async fn unlock(&self) -> bool {
        let attempt = {
            let mut attempt = self.attempt.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *attempt)
        };
        if let Some(cancel) = &attempt.cancel {
            cancel.cancel();
        }

        let released = match &attempt.token {
            Some(token) => match self.store.compare_and_delete(&self.key, token).await {
                Ok(released) => released,
                Err(e) => {
                    warn!(target: "sig.sched.lock", key = %self.key, error = %e, "Unlock failed");
                    false
                }
            },
            None => false,
        };

        drop(attempt.guard);
        if released {
            debug!(target: "sig.sched.lock", key = %self.key, "Lock released");
        }
        released
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let attempt = self.attempt.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = &attempt.cancel {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::time::Instant;

    fn store() -> Arc<dyn CoordinationStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_without_lock_returns_false() {
        let lock = Lock::new(store(), "test", Duration::from_secs(1));
        assert!(!lock.unlock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion() {
        let store = store();
        let a = Arc::new(Lock::new(Arc::clone(&store), "test", Duration::from_secs(1)));
        let b = Arc::new(Lock::new(Arc::clone(&store), "test", Duration::from_secs(1)));

        let holder = tokio::spawn(async move {
            assert!(a.lock().await);
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let released_at = Instant::now();
            assert!(a.unlock().await);
            released_at
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.lock().await);
        let acquired_at = Instant::now();
        let released_at = holder.await.unwrap();

        assert!(acquired_at >= released_at);
        assert!(b.unlock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_handle_blocks_until_unlocked() {
        let lock = Arc::new(Lock::new(store(), "test", Duration::from_secs(1)));
        assert!(lock.lock().await);

        let start = Instant::now();
        let background = Arc::clone(&lock);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(background.unlock().await);
        });

        assert!(lock.lock().await);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(lock.unlock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_lock_cancelled_by_unlock() {
        let store = store();
        let holder = Lock::new(Arc::clone(&store), "test", Duration::from_secs(1));
        assert!(holder.lock().await);

        let waiter = Arc::new(Lock::new(Arc::clone(&store), "test", Duration::from_secs(1)));
        let pending = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.lock().await })
        };

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!waiter.unlock().await);
        assert!(!pending.await.unwrap());

        assert!(holder.unlock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_until_stops_on_external_cancel() {
        let store = store();
        let holder = Lock::new(Arc::clone(&store), "test", Duration::from_secs(1));
        assert!(holder.lock().await);

        let waiter = Lock::new(Arc::clone(&store), "test", Duration::from_secs(1));
        let stop = CancellationToken::new();
        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        assert!(!waiter.lock_until(&stop).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_is_reusable() {
        let lock = Lock::new(store(), "test", Duration::from_secs(1));
        for _ in 0..3 {
            assert!(lock.lock().await);
            assert!(lock.unlock().await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_past_initial_ttl() {
        let store = store();
        let owner = Lock::new(Arc::clone(&store), "test", Duration::from_secs(1));
        let rival = Lock::new(Arc::clone(&store), "test", Duration::from_secs(1));
        assert!(owner.lock().await);

        // Lease is 2s; hold for 5s while the heartbeat extends it.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!rival.try_lock().await);

        assert!(owner.unlock().await);
        assert!(rival.try_lock().await);
        assert!(rival.unlock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lapses_after_owner_dropped() {
        let store = store();
        {
            let owner = Lock::new(Arc::clone(&store), "test", Duration::from_secs(1));
            assert!(owner.lock().await);
        }
        let rival = Lock::new(Arc::clone(&store), "test", Duration::from_secs(1));
        assert!(!rival.try_lock().await);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(rival.try_lock().await);
    }
}
