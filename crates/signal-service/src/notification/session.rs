//! Push-only notification WebSocket session.
//!
//! Handshake: the first frame is a session token whose payload is a login
//! id; the second is the id of a previous session, or empty. A previous
//! session whose mailbox still exists is resumed, otherwise a new one is
//! registered. The reply is `session:<id>`, with `\n<lastDeliveryId>`
//! appended for new sessions so the client can sync its backlog.
//!
//! After the handshake every mailbox payload is written verbatim and
//! inbound frames are ignored. On disconnect the mailbox is parked as
//! Inactive with the session TTL so a reconnect loses nothing.

use crate::errors::SignalError;
use crate::notification::registry::SessionRegistry;
use crate::notification::types::SessionState;
use crate::notification::NotificationContext;
use crate::observability::metrics;
use crate::sched::Queue;
use common::types::UserId;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// One client connection to the notification channel.
pub struct NotificationSession {
    ctx: NotificationContext,
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl NotificationSession {
    pub fn new(
        ctx: NotificationContext,
        incoming: mpsc::Receiver<String>,
        outgoing: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            incoming,
            outgoing,
            cancel,
        }
    }

    #[instrument(skip_all, name = "sig.noti.session")]
    pub async fn run(mut self) {
        let user_id = match self.authenticate().await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => return,
            Err(e) => {
                debug!(target: "sig.noti.session", error = %e, "Session token rejected");
                metrics::record_error(e.error_type_label());
                return;
            }
        };
        let (session_id, mailbox) = match self.open(user_id).await {
            Ok(Some(opened)) => opened,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "sig.noti.session", user_id = %user_id, error = %e, "Session handshake failed");
                metrics::record_error(e.error_type_label());
                return;
            }
        };

        metrics::session_opened("notification");
        self.serve(user_id, &session_id, &mailbox).await;
        self.park(user_id, &session_id, &mailbox).await;
        metrics::session_closed("notification");
        debug!(target: "sig.noti.session", user_id = %user_id, session_id = %session_id, "Session closed");
    }

    /// Next handshake frame, or `None` on timeout, disconnect or shutdown.
    async fn handshake_frame(&mut self) -> Option<String> {
        tokio::select! {
            () = self.cancel.cancelled() => None,
            received = timeout(self.ctx.timings.auth_timeout, self.incoming.recv()) => {
                match received {
                    Ok(frame) => frame,
                    Err(_) => {
                        debug!(target: "sig.noti.session", "Handshake timed out");
                        None
                    }
                }
            }
        }
    }

    async fn authenticate(&mut self) -> Result<Option<UserId>, SignalError> {
        let Some(token) = self.handshake_frame().await else {
            return Ok(None);
        };
        let login_id = self.ctx.signer.verify(token.trim())?;
        self.ctx
            .directory
            .resolve_login(&login_id)
            .await?
            .map(Some)
            .ok_or(SignalError::Unauthorized)
    }

    async fn open(&mut self, user_id: UserId) -> Result<Option<(String, Queue)>, SignalError> {
        let Some(previous) = self.handshake_frame().await else {
            return Ok(None);
        };
        let registry = &self.ctx.registry;

        let previous = previous.trim();
        let resumed = if previous.is_empty() {
            None
        } else {
            let mailbox = registry.mailbox(user_id, previous);
            mailbox.clear_expire().await?;
            if mailbox.state().await? == SessionState::Absent {
                None
            } else {
                registry.heartbeat(user_id, previous).await?;
                debug!(target: "sig.noti.session", user_id = %user_id, session_id = %previous, "Resuming session");
                Some((previous.to_string(), mailbox))
            }
        };

        let (session_id, mailbox, reply) = match resumed {
            Some((session_id, mailbox)) => {
                let reply = format!("session:{session_id}");
                (session_id, mailbox, reply)
            }
            None => {
                let session_id = SessionRegistry::new_session_id();
                registry.register(user_id, &session_id).await?;
                let last_delivery = self.ctx.directory.last_delivery_id(user_id).await?;
                debug!(target: "sig.noti.session", user_id = %user_id, session_id = %session_id, "New session");
                let reply = format!("session:{session_id}\n{last_delivery}");
                let mailbox = registry.mailbox(user_id, &session_id);
                (session_id, mailbox, reply)
            }
        };

        registry.heartbeat(user_id, &session_id).await?;
        mailbox.save_state(SessionState::Active).await?;
        mailbox.expire(registry.ttl()).await?;

        if self.outgoing.send(reply).await.is_err() {
            self.park(user_id, &session_id, &mailbox).await;
            return Ok(None);
        }
        Ok(Some((session_id, mailbox)))
    }

    async fn serve(&mut self, user_id: UserId, session_id: &str, mailbox: &Queue) {
        let Some(mut pushes) = mailbox.channel() else {
            return;
        };
        let ttl = self.ctx.registry.ttl();
        let period = ttl / 2;
        let mut refresh = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                frame = self.incoming.recv() => {
                    if frame.is_none() {
                        break;
                    }
                    trace!(target: "sig.noti.session", user_id = %user_id, "Ignoring inbound frame");
                }

                Some(message) = pushes.recv() => {
                    let delivered = self.outgoing.send(message.payload).await.is_ok();
                    if let Err(e) = mailbox.ack(delivered).await {
                        warn!(target: "sig.noti.session", user_id = %user_id, error = %e, "Mailbox ack failed");
                    }
                    if !delivered {
                        break;
                    }
                }

                _ = refresh.tick() => {
                    if let Err(e) = self.ctx.registry.heartbeat(user_id, session_id).await {
                        warn!(target: "sig.noti.session", user_id = %user_id, error = %e,
                            "Session heartbeat failed");
                    }
                    if let Err(e) = mailbox.expire(ttl).await {
                        warn!(target: "sig.noti.session", user_id = %user_id, error = %e,
                            "Mailbox expire failed");
                    }
                }
            }
        }
    }

    /// Stop consuming and keep the mailbox around for one TTL.
    async fn park(&self, user_id: UserId, session_id: &str, mailbox: &Queue) {
        let parked = async {
            mailbox.close(false).await?;
            mailbox.save_state(SessionState::Inactive).await?;
            mailbox.expire(self.ctx.registry.ttl()).await
        };
        if let Err(e) = parked.await {
            warn!(target: "sig.noti.session", user_id = %user_id, session_id = %session_id, error = %e,
                "Failed to park session mailbox");
        }
    }
}
