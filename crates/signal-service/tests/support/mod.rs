//! Shared fixtures for the integration tests: in-memory store and
//! repositories, sub-second timings, and a channel-backed call client.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use common::jwt::TokenSigner;
use common::secret::SecretString;
use common::types::CallId;
use signal_service::call::protocol::{Frame, FrameType};
use signal_service::call::types::CallStatus;
use signal_service::call::{CallContext, CallSession, CallStatusChange, CallUpdateNotifier};
use signal_service::config::CallTimings;
use signal_service::repositories::{CallRepository, MemoryCallRepository};
use signal_service::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(3);
pub const HEARTBEAT_EVERY: Duration = Duration::from_millis(150);

pub struct NoopNotifier;

#[async_trait]
impl CallUpdateNotifier for NoopNotifier {
    async fn call_status_changed(&self, _change: &CallStatusChange) {}
}

pub fn timings() -> CallTimings {
    CallTimings {
        lock_heartbeat: Duration::from_secs(1),
        user_ttl: Duration::from_millis(600),
        manager_ttl: Duration::from_secs(2),
        failure_timeout: Duration::from_secs(2),
        session_ttl: Duration::from_secs(2),
        auth_timeout: Duration::from_millis(500),
        call_token_ttl: Duration::from_secs(60),
    }
}

pub fn signer() -> Arc<TokenSigner> {
    Arc::new(TokenSigner::new(
        &SecretString::from("integration-secret-0123456789"),
        "signal-test",
    ))
}

pub fn call_context() -> (CallContext, MemoryCallRepository) {
    let calls = MemoryCallRepository::new();
    let ctx = CallContext::new(
        Arc::new(MemoryStore::new()),
        Arc::new(calls.clone()),
        Arc::new(NoopNotifier),
        signer(),
        timings(),
    );
    (ctx, calls)
}

pub async fn wait_for_status(calls: &MemoryCallRepository, call_id: CallId, status: CallStatus) {
    for _ in 0..250 {
        let row = calls.find_call(call_id).await.unwrap();
        if row.map(|c| c.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("call {call_id} never reached {status:?}");
}

/// A call WebSocket client wired straight to a session.
pub struct CallClient {
    pub tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
    heartbeat: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl CallClient {
    pub async fn connect(ctx: &CallContext, token: String) -> Self {
        let (tx, incoming) = mpsc::channel(32);
        let (outgoing, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        tokio::spawn(CallSession::new(ctx.clone(), incoming, outgoing, cancel.clone()).run());
        tx.send(token).await.unwrap();
        Self {
            tx,
            rx,
            heartbeat: None,
            cancel,
        }
    }

    pub fn start_heartbeat(&mut self) {
        let tx = self.tx.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_EVERY).await;
                if tx.send(Frame::empty(FrameType::HeartBeat).to_text()).await.is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    /// Next frame, or `None` once the session hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let text = tokio::time::timeout(FRAME_TIMEOUT, self.rx.recv())
            .await
            .expect("frame within timeout")?;
        Some(Frame::parse(&text).unwrap())
    }

    /// Every frame up to and including the first of `kind`.
    pub async fn frames_until(&mut self, kind: FrameType) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let Some(frame) = self.next_frame().await else {
                panic!("session closed before {kind:?}");
            };
            let done = frame.kind == kind;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    /// Frames that arrive within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<Frame> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(text)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            frames.push(Frame::parse(&text).unwrap());
        }
        frames
    }

    /// Every frame until the session ends.
    pub async fn remaining_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await {
            frames.push(frame);
        }
        frames
    }

    /// Wait for the session to end, discarding remaining frames.
    pub async fn closed(&mut self) {
        while self.next_frame().await.is_some() {}
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.stop_heartbeat();
        self.cancel.cancel();
    }
}
