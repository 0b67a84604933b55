//! Push notifications: per-user resumable sessions, each bound to one
//! mailbox, and the fan-out that writes into them.

pub mod notifier;
pub mod registry;
pub mod sender;
pub mod session;
pub mod types;

pub use notifier::ChatUpdateNotifier;
pub use registry::SessionRegistry;
pub use sender::NotificationSender;
pub use session::NotificationSession;
pub use types::{CallMessageUpdate, Notification, NotificationKind, SessionState};

use crate::config::CallTimings;
use crate::repositories::SessionDirectory;
use crate::store::CoordinationStore;
use common::jwt::TokenSigner;
use std::sync::Arc;

/// Shared dependencies of notification sessions.
#[derive(Clone)]
pub struct NotificationContext {
    pub registry: SessionRegistry,
    pub directory: Arc<dyn SessionDirectory>,
    pub signer: Arc<TokenSigner>,
    pub timings: CallTimings,
}

impl NotificationContext {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: Arc<dyn SessionDirectory>,
        signer: Arc<TokenSigner>,
        timings: CallTimings,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(store, timings.session_ttl, timings.lock_heartbeat),
            directory,
            signer,
            timings,
        }
    }

    pub fn sender(&self) -> NotificationSender {
        NotificationSender::new(self.registry.clone())
    }
}
