//! Call WebSocket session.
//!
//! The session is transport-neutral: it reads client frames from one
//! channel and writes frames to another, so the same code serves an axum
//! socket and the tests.
//!
//! # Lifecycle
//!
//! 1. First inbound frame is the call token (`call:<callId>:<userId>`);
//!    a bad token gets an `Unauthorized` frame and the session ends
//! 2. The call must exist, not be ended, and have a live manager
//! 3. The session activates its mailbox and reports `UserOnline`
//! 4. Client frames become manager actions; mailbox actions become frames
//! 5. On disconnect the mailbox is torn down and `UserOffline` is sent to
//!    the manager if it is still reachable

use crate::call::actions::SessionAction;
use crate::call::handle::find_manager;
use crate::call::keys;
use crate::call::protocol::{Frame, FrameType};
use crate::call::types::CallStatus;
use crate::call::CallContext;
use crate::errors::SignalError;
use crate::observability::metrics;
use crate::repositories::CallRepository;
use crate::sched::{MailboxState, Message, Queue};
use common::types::{CallId, UserId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Payload of a call token.
pub fn token_payload(call_id: CallId, user_id: UserId) -> String {
    format!("call:{call_id}:{user_id}")
}

fn parse_token_payload(payload: &str) -> Option<(CallId, UserId)> {
    let (call_id, user_id) = payload.strip_prefix("call:")?.split_once(':')?;
    Some((call_id.parse().ok()?, user_id.parse().ok()?))
}

/// One participant's signaling connection.
pub struct CallSession {
    ctx: CallContext,
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl CallSession {
    pub fn new(
        ctx: CallContext,
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

    #[instrument(skip_all, name = "sig.call.session")]
    pub async fn run(mut self) {
        let Some((call_id, user_id)) = self.authenticate().await else {
            return;
        };
        let mailbox = match self.attach(call_id, user_id).await {
            Ok(mailbox) => mailbox,
            Err(e) => {
                debug!(target: "sig.call.session", call_id = %call_id, user_id = %user_id, error = %e,
                    "Session rejected");
                self.send_error(&e).await;
                return;
            }
        };

        metrics::session_opened("call");
        debug!(target: "sig.call.session", call_id = %call_id, user_id = %user_id, "Session online");
        self.serve(call_id, user_id, &mailbox).await;
        self.detach(call_id, user_id, mailbox).await;
        metrics::session_closed("call");
        debug!(target: "sig.call.session", call_id = %call_id, user_id = %user_id, "Session closed");
    }

    async fn authenticate(&mut self) -> Option<(CallId, UserId)> {
        let token = tokio::select! {
            () = self.cancel.cancelled() => return None,
            received = tokio::time::timeout(self.ctx.timings.auth_timeout, self.incoming.recv()) => {
                match received {
                    Ok(Some(token)) => token,
                    Ok(None) => return None,
                    Err(_) => {
                        debug!(target: "sig.call.session", "Authentication timed out");
                        return None;
                    }
                }
            }
        };

        let verified = self
            .ctx
            .signer
            .verify(token.trim())
            .map_err(SignalError::from)
            .and_then(|payload| parse_token_payload(&payload).ok_or(SignalError::Unauthorized));
        match verified {
            Ok(ids) => Some(ids),
            Err(e) => {
                debug!(target: "sig.call.session", error = %e, "Call token rejected");
                metrics::record_error(e.error_type_label());
                self.send(Frame::empty(FrameType::Unauthorized)).await;
                None
            }
        }
    }

    async fn attach(&self, call_id: CallId, user_id: UserId) -> Result<Queue, SignalError> {
        let call = self
            .ctx
            .calls
            .find_call(call_id)
            .await?
            .ok_or(SignalError::CallNotFound)?;
        if call.status == CallStatus::End {
            return Err(SignalError::CallStatusInvalid);
        }
        let manager = find_manager(&self.ctx.store, call_id)
            .await?
            .ok_or(SignalError::ManagerNotFound)?;

        let mailbox = Queue::new(
            Arc::clone(&self.ctx.store),
            &keys::session_mailbox(call_id, user_id),
            self.ctx.timings.lock_heartbeat,
        );
        mailbox.save_state(MailboxState::Active).await?;
        if let Err(e) = manager.user_online(user_id).await {
            if let Err(close_err) = mailbox.close(true).await {
                warn!(target: "sig.call.session", call_id = %call_id, user_id = %user_id,
                    error = %close_err, "Failed to close session mailbox");
            }
            return Err(e);
        }
        Ok(mailbox)
    }

    async fn serve(&mut self, call_id: CallId, user_id: UserId, mailbox: &Queue) {
        let Some(mut actions) = mailbox.channel() else {
            return;
        };
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                text = self.incoming.recv() => {
                    let Some(text) = text else {
                        debug!(target: "sig.call.session", call_id = %call_id, user_id = %user_id,
                            "Client disconnected");
                        break;
                    };
                    match self.handle_frame(call_id, user_id, &text).await {
                        Ok(()) => {}
                        Err(SignalError::ManagerNotFound) => {
                            self.send_error(&SignalError::ManagerNotFound).await;
                            break;
                        }
                        Err(e) => {
                            warn!(target: "sig.call.session", call_id = %call_id, user_id = %user_id,
                                error = %e, "Client frame rejected");
                            self.send_error(&e).await;
                        }
                    }
                }

                Some(message) = actions.recv() => {
                    let keep_open = self.handle_action(&message).await;
                    if let Err(e) = mailbox.ack(true).await {
                        warn!(target: "sig.call.session", call_id = %call_id, user_id = %user_id,
                            error = %e, "Mailbox ack failed");
                    }
                    if !keep_open {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        call_id: CallId,
        user_id: UserId,
        text: &str,
    ) -> Result<(), SignalError> {
        let frame = Frame::parse(text)?;
        let manager = find_manager(&self.ctx.store, call_id)
            .await?
            .ok_or(SignalError::ManagerNotFound)?;
        let sent = match frame.kind {
            FrameType::HeartBeat => manager.heartbeat(user_id).await,
            FrameType::Signaling => {
                let payload = frame.signaling()?;
                manager
                    .signaling(user_id, payload.to_user_id, payload.message)
                    .await
            }
            other => {
                return Err(SignalError::BadRequest(format!(
                    "unexpected frame type {}",
                    other.code()
                )))
            }
        };
        match sent {
            Err(SignalError::MailboxInactive) => Err(SignalError::ManagerNotFound),
            other => other,
        }
    }

    /// Forward a mailbox action. Returns false when the session should end.
    async fn handle_action(&self, message: &Message) -> bool {
        let action: SessionAction = match message.decode() {
            Ok(action) => action,
            Err(e) => {
                warn!(target: "sig.call.session", error = %e, "Dropping undecodable session action");
                return true;
            }
        };
        match Frame::from_action(&action) {
            Ok(Some(frame)) => self.send(frame).await,
            Ok(None) => false,
            Err(e) => {
                warn!(target: "sig.call.session", error = %e, "Failed to encode frame");
                true
            }
        }
    }

    async fn detach(&self, call_id: CallId, user_id: UserId, mailbox: Queue) {
        if let Err(e) = mailbox.close(true).await {
            warn!(target: "sig.call.session", call_id = %call_id, user_id = %user_id, error = %e,
                "Failed to close session mailbox");
        }
        match find_manager(&self.ctx.store, call_id).await {
            Ok(Some(manager)) => {
                if let Err(e) = manager.user_offline(user_id).await {
                    debug!(target: "sig.call.session", call_id = %call_id, user_id = %user_id,
                        error = %e, "Manager gone before offline");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: "sig.call.session", call_id = %call_id, user_id = %user_id, error = %e,
                    "Failed to resolve manager on close");
            }
        }
    }

    async fn send(&self, frame: Frame) -> bool {
        self.outgoing.send(frame.to_text()).await.is_ok()
    }

    async fn send_error(&self, error: &SignalError) {
        metrics::record_error(error.error_type_label());
        self.send(Frame::error(&error.client_message())).await;
    }
}
