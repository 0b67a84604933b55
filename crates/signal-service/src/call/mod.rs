//! Call signaling: the per-call state machine, its crash-recovery monitor,
//! the call WebSocket session, and the call API.
//!
//! ```text
//!   CallService ──join/hangup──▶ ManagerHandle ──mailbox──▶ CallManager
//!                                                             │   ▲
//!   CallSession ◀──mailbox── SessionHandle ◀─────────────────┘   │
//!        └──────────── online/offline/heartbeat/signaling ────────┘
//! ```
//!
//! Managers and sessions find each other only through mailbox keys derived
//! from the call and user ids (see [`keys`]).

pub mod actions;
pub mod delegate;
pub mod handle;
pub mod keys;
pub mod manager;
pub mod monitor;
pub mod protocol;
pub mod service;
pub mod session;
pub mod types;

pub use delegate::{CallStatusChange, CallUpdateNotifier, ManagerDelegate, StoreDelegate};
pub use handle::{find_manager, find_session, ManagerHandle, SessionHandle};
pub use manager::CallManager;
pub use monitor::{Monitor, MonitorHandle};
pub use service::CallService;
pub use session::CallSession;

use crate::config::CallTimings;
use crate::repositories::CallRepository;
use crate::store::CoordinationStore;
use common::jwt::TokenSigner;
use std::sync::Arc;

/// Shared dependencies of managers, sessions and the call API.
#[derive(Clone)]
pub struct CallContext {
    pub store: Arc<dyn CoordinationStore>,
    pub calls: Arc<dyn CallRepository>,
    pub notifier: Arc<dyn CallUpdateNotifier>,
    pub signer: Arc<TokenSigner>,
    pub monitor: MonitorHandle,
    pub timings: CallTimings,
}

impl CallContext {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        calls: Arc<dyn CallRepository>,
        notifier: Arc<dyn CallUpdateNotifier>,
        signer: Arc<TokenSigner>,
        timings: CallTimings,
    ) -> Self {
        let monitor = MonitorHandle::new(Arc::clone(&store), timings.manager_ttl);
        Self {
            store,
            calls,
            notifier,
            signer,
            monitor,
            timings,
        }
    }
}
