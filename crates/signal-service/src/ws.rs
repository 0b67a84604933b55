//! WebSocket endpoints.
//!
//! - `GET /ws/call` - call signaling ([`CallSession`])
//! - `GET /ws/notification` - push notifications ([`NotificationSession`])
//!
//! Each upgraded socket is split into a reader and a writer task joined to
//! the session by text-frame channels, so sessions never see axum types.

use crate::call::{CallContext, CallSession};
use crate::notification::{NotificationContext, NotificationSession};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Frames buffered in each direction before the producer waits.
const FRAME_BUFFER: usize = 64;

/// Dependencies of the WebSocket handlers.
pub struct WsState {
    pub calls: CallContext,
    pub notifications: NotificationContext,
    /// Cancelled on shutdown; every session runs under a child token.
    pub shutdown: CancellationToken,
}

pub fn ws_router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/ws/call", get(call_socket))
        .route("/ws/notification", get(notification_socket))
        .with_state(state)
}

async fn call_socket(State(state): State<Arc<WsState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let ctx = state.calls.clone();
        bridge(socket, &state.shutdown, |incoming, outgoing, cancel| {
            CallSession::new(ctx, incoming, outgoing, cancel).run()
        })
        .await;
    })
}

async fn notification_socket(
    State(state): State<Arc<WsState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let ctx = state.notifications.clone();
        bridge(socket, &state.shutdown, |incoming, outgoing, cancel| {
            NotificationSession::new(ctx, incoming, outgoing, cancel).run()
        })
        .await;
    })
}

/// Run `session` over `socket` and close the socket when it returns.
async fn bridge<F, Fut>(socket: WebSocket, shutdown: &CancellationToken, session: F)
where
    F: FnOnce(mpsc::Receiver<String>, mpsc::Sender<String>, CancellationToken) -> Fut,
    Fut: Future<Output = ()>,
{
    let cancel = shutdown.child_token();
    let (mut sink, mut stream) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);

    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                () = reader_cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(WsMessage::Text(text))) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(target: "sig.ws", error = %e, "Socket read failed");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    session(in_rx, out_tx, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = writer.await {
        debug!(target: "sig.ws", error = %e, "Socket writer ended abnormally");
    }
    reader.abort();
}
