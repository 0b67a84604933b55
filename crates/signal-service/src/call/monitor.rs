//! Crash recovery for call managers.
//!
//! A live manager keeps a marker for its call in the process-shared
//! `call:monitor` delay queue, pushed back every half TTL. When a marker
//! fires, the manager that owned it stopped heartbeating (process crash,
//! escaped panic, or hang). The [`Monitor`] then builds a fresh manager for
//! the call and forces it through terminal cleanup.
//!
//! Every process runs a monitor. Markers are popped atomically, so each
//! expiry is handled by exactly one of them; the forced cleanup also takes
//! the call's manager lock, and skips if a live manager still holds it.

use crate::call::delegate::StoreDelegate;
use crate::call::keys;
use crate::call::manager::CallManager;
use crate::call::CallContext;
use crate::errors::SignalError;
use crate::sched::{DelayQueue, Message};
use crate::store::CoordinationStore;
use common::types::CallId;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// What a manager holds to keep its liveness marker fresh.
#[derive(Clone)]
pub struct MonitorHandle {
    queue: Arc<DelayQueue>,
    ttl: Duration,
}

impl MonitorHandle {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self {
            queue: Arc::new(DelayQueue::new(store, keys::MONITOR_QUEUE)),
            ttl,
        }
    }

    /// Marker TTL. Managers refresh at half of it.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Push the call's marker `ttl` into the future.
    pub async fn heartbeat(&self, call_id: CallId) -> Result<(), SignalError> {
        let id = call_id.to_string();
        self.queue.delete(&id).await?;
        self.queue.delay(self.ttl, &Message::new(id, "")).await
    }

    /// Drop the call's marker on a clean exit.
    pub async fn clear(&self, call_id: CallId) -> Result<(), SignalError> {
        self.queue.delete(&call_id.to_string()).await
    }
}

/// Watchdog over the `call:monitor` queue.
pub struct Monitor {
    ctx: CallContext,
    queue: DelayQueue,
}

impl Monitor {
    pub fn new(ctx: CallContext) -> Self {
        let queue = DelayQueue::new(Arc::clone(&ctx.store), keys::MONITOR_QUEUE);
        Self { ctx, queue }
    }

    /// Run until `cancel` fires.
    #[instrument(skip_all, name = "sig.call.monitor")]
    pub async fn run(self, cancel: CancellationToken) {
        let Some(mut expired) = self.queue.channel() else {
            error!(target: "sig.call.monitor", "Monitor queue already consumed");
            return;
        };
        info!(target: "sig.call.monitor", "Monitor started");

        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => break,
                item = expired.recv() => item,
            };
            let Some(item) = item else { break };

            let call_id = match item.message.id.parse::<CallId>() {
                Ok(call_id) => call_id,
                Err(e) => {
                    warn!(target: "sig.call.monitor", id = %item.message.id, error = %e,
                        "Ignoring malformed manager marker");
                    continue;
                }
            };
            warn!(target: "sig.call.monitor", call_id = %call_id, "Manager heartbeat expired");

            let cleanup = AssertUnwindSafe(clean_call(&self.ctx, call_id)).catch_unwind();
            match cleanup.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(target: "sig.call.monitor", call_id = %call_id, error = %e,
                        "Forced cleanup failed");
                }
                Err(_) => {
                    error!(target: "sig.call.monitor", call_id = %call_id, "Forced cleanup panicked");
                }
            }
        }

        if let Err(e) = self.queue.close(false).await {
            warn!(target: "sig.call.monitor", error = %e, "Failed to close monitor queue");
        }
        info!(target: "sig.call.monitor", "Monitor stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

async fn clean_call(ctx: &CallContext, call_id: CallId) -> Result<(), SignalError> {
    let delegate = StoreDelegate::load(ctx, call_id).await?;
    CallManager::new(ctx, Arc::new(delegate))
        .clean_after_died()
        .await;
    Ok(())
}
