//! End-to-end call scenarios over the in-memory store: admission,
//! activation, cancellation, rejection, reconnects and heartbeat loss.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

mod support;

use crate::support::{call_context, wait_for_status, CallClient};
use common::types::{CallId, UserId};
use signal_service::call::keys;
use signal_service::call::protocol::{Frame, FrameType};
use signal_service::call::types::{Call, CallStatus, EndReason, ParticipantState, UserState, PING_LOST};
use signal_service::call::{CallContext, CallService};
use signal_service::errors::SignalError;
use signal_service::notification::{NotificationSender, SessionRegistry};
use signal_service::repositories::{CallRepository, MemoryCallRepository};
use std::time::Duration;

const CALLER: UserId = UserId(1);
const CALLEE: UserId = UserId(2);

fn service() -> (CallService, CallContext, MemoryCallRepository) {
    let (ctx, calls) = call_context();
    let registry = SessionRegistry::new(
        ctx.store.clone(),
        Duration::from_secs(60),
        ctx.timings.lock_heartbeat,
    );
    let service = CallService::new(ctx.clone(), NotificationSender::new(registry));
    (service, ctx, calls)
}

/// Both parties join and connect; returns once each saw `CallStart`.
async fn activate(
    service: &CallService,
    ctx: &CallContext,
    calls: &MemoryCallRepository,
) -> (Call, CallClient, CallClient) {
    let call_id = service.create_call(CALLER, 10, &[CALLEE]).await.unwrap();
    wait_for_status(calls, call_id, CallStatus::Ready).await;

    let caller_token = service.join_call(CALLER, call_id).await.unwrap();
    let mut caller = CallClient::connect(ctx, caller_token).await;
    caller.start_heartbeat();
    caller.frames_until(FrameType::UpdateUserStates).await;

    let callee_token = service.join_call(CALLEE, call_id).await.unwrap();
    let mut callee = CallClient::connect(ctx, callee_token).await;
    callee.start_heartbeat();

    caller.frames_until(FrameType::CallStart).await;
    callee.frames_until(FrameType::CallStart).await;
    wait_for_status(calls, call_id, CallStatus::Active).await;
    let call = calls.find_call(call_id).await.unwrap().unwrap();
    (call, caller, callee)
}

fn states_of(frames: &[Frame], user_id: UserId) -> Vec<ParticipantState> {
    frames
        .iter()
        .filter(|f| f.kind == FrameType::UpdateUserState)
        .filter_map(|f| serde_json::from_str::<UserState>(&f.payload).ok())
        .filter(|s| s.user_id == user_id)
        .map(|s| s.state)
        .collect()
}

fn dead_updates_for(frames: &[Frame], user_id: UserId) -> usize {
    states_of(frames, user_id)
        .into_iter()
        .filter(|&s| s == ParticipantState::Dead)
        .count()
}

fn call_ends(frames: &[Frame]) -> Vec<&str> {
    frames
        .iter()
        .filter(|f| f.kind == FrameType::CallEnd)
        .map(|f| f.payload.as_str())
        .collect()
}

/// Read update frames until `user_id` is reported in `state`.
async fn wait_for_user_state(client: &mut CallClient, user_id: UserId, state: ParticipantState) {
    loop {
        let frames = client.frames_until(FrameType::UpdateUserState).await;
        if states_of(&frames, user_id).contains(&state) {
            return;
        }
    }
}

/// Join and connect `user_id`, returning once the session listed the members.
async fn connect(service: &CallService, ctx: &CallContext, user_id: UserId, call_id: CallId) -> CallClient {
    let token = service.join_call(user_id, call_id).await.unwrap();
    let mut client = CallClient::connect(ctx, token).await;
    client.start_heartbeat();
    client.frames_until(FrameType::UpdateUserStates).await;
    client
}

#[tokio::test]
async fn test_call_becomes_active_with_single_start() {
    let (service, ctx, calls) = service();
    let (call, mut caller, mut callee) = activate(&service, &ctx, &calls).await;
    assert!(call.start_time.is_some());

    // No repeat of CallStart while both stay online.
    let later = caller.drain_for(Duration::from_millis(400)).await;
    assert!(later.iter().all(|f| f.kind != FrameType::CallStart));

    service.hangup_call(CALLER, call.call_id).await.unwrap();
    let frames = callee.frames_until(FrameType::CallEnd).await;
    let end = frames.last().unwrap();
    assert_eq!(end.payload, EndReason::Normal.code().to_string());
    callee.closed().await;
    caller.closed().await;

    wait_for_status(&calls, call.call_id, CallStatus::End).await;
    let row = calls.find_call(call.call_id).await.unwrap().unwrap();
    assert_eq!(row.end_reason, Some(EndReason::Normal));
    assert!(row.end_time.is_some());
}

#[tokio::test]
async fn test_caller_hangup_before_answer_cancels() {
    let (service, ctx, calls) = service();
    let call_id = service.create_call(CALLER, 10, &[CALLEE]).await.unwrap();
    wait_for_status(&calls, call_id, CallStatus::Ready).await;

    let token = service.join_call(CALLER, call_id).await.unwrap();
    let mut caller = CallClient::connect(&ctx, token).await;
    caller.start_heartbeat();
    caller.frames_until(FrameType::UpdateUserStates).await;

    service.hangup_call(CALLER, call_id).await.unwrap();
    let frames = caller.frames_until(FrameType::CallEnd).await;
    assert_eq!(
        frames.last().unwrap().payload,
        EndReason::Cancelled.code().to_string()
    );
    caller.closed().await;

    wait_for_status(&calls, call_id, CallStatus::End).await;
    let row = calls.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(row.end_reason, Some(EndReason::Cancelled));
    assert!(row.start_time.is_none());
    for user in [CALLER, CALLEE] {
        assert!(ctx.store.get(&keys::user_lock(user)).await.unwrap().is_none());
    }

    let err = service.join_call(CALLEE, call_id).await.unwrap_err();
    assert!(matches!(err, SignalError::CallStatusInvalid));
}

#[tokio::test]
async fn test_silent_participant_is_declared_dead_once() {
    let (service, ctx, calls) = service();
    let (call, mut caller, mut callee) = activate(&service, &ctx, &calls).await;

    callee.stop_heartbeat();
    let frames = caller.frames_until(FrameType::CallEnd).await;
    assert_eq!(dead_updates_for(&frames, CALLEE), 1);
    let dead: UserState = frames
        .iter()
        .filter(|f| f.kind == FrameType::UpdateUserState)
        .filter_map(|f| serde_json::from_str::<UserState>(&f.payload).ok())
        .find(|s| s.user_id == CALLEE)
        .unwrap();
    assert_eq!(dead.ping, PING_LOST);
    assert_eq!(
        frames.last().unwrap().payload,
        EndReason::LostConnection.code().to_string()
    );
    callee.closed().await;
    caller.closed().await;

    let row = calls.find_call(call.call_id).await.unwrap().unwrap();
    assert_eq!(row.status, CallStatus::End);
    assert_eq!(row.end_reason, Some(EndReason::LostConnection));
}

#[tokio::test]
async fn test_busy_callee_cannot_be_called_twice() {
    let (service, ctx, calls) = service();
    let (call, mut caller, mut callee) = activate(&service, &ctx, &calls).await;

    // The callee is claimed by the live call; a third user's call to them fails.
    let second = service.create_call(UserId(3), 11, &[CALLEE]).await.unwrap();
    wait_for_status(&calls, second, CallStatus::End).await;
    let row = calls.find_call(second).await.unwrap().unwrap();
    assert_eq!(row.end_reason, Some(EndReason::Busy));
    assert!(ctx.store.get(&keys::user_lock(UserId(3))).await.unwrap().is_none());

    service.hangup_call(CALLER, call.call_id).await.unwrap();
    callee.closed().await;
    caller.closed().await;
}

#[tokio::test]
async fn test_signaling_reaches_peer() {
    let (service, ctx, calls) = service();
    let (call, mut caller, mut callee) = activate(&service, &ctx, &calls).await;

    let frame = Frame::new(
        FrameType::Signaling,
        serde_json::json!({"toUserId": CALLEE.get(), "message": "offer"}).to_string(),
    );
    caller.tx.send(frame.to_text()).await.unwrap();

    let frames = callee.frames_until(FrameType::Signaling).await;
    let payload: serde_json::Value = serde_json::from_str(&frames.last().unwrap().payload).unwrap();
    assert_eq!(payload["fromUserId"], CALLER.get());
    assert_eq!(payload["message"], "offer");

    service.hangup_call(CALLER, call.call_id).await.unwrap();
    callee.closed().await;
    caller.closed().await;
}

#[tokio::test]
async fn test_callee_rejecting_ends_call_as_rejected() {
    let (service, ctx, calls) = service();
    let call_id = service.create_call(CALLER, 10, &[CALLEE]).await.unwrap();
    wait_for_status(&calls, call_id, CallStatus::Ready).await;
    let mut caller = connect(&service, &ctx, CALLER, call_id).await;

    service.hangup_call(CALLEE, call_id).await.unwrap();
    let frames = caller.remaining_frames().await;
    assert_eq!(call_ends(&frames), vec![EndReason::Rejected.code().to_string()]);

    wait_for_status(&calls, call_id, CallStatus::End).await;
    let row = calls.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(row.end_reason, Some(EndReason::Rejected));
    assert!(row.start_time.is_none());
    for user in [CALLER, CALLEE] {
        assert!(ctx.store.get(&keys::user_lock(user)).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_unanswered_call_ends_as_no_answer() {
    let (service, ctx, calls) = service();
    let call_id = service.create_call(CALLER, 10, &[CALLEE]).await.unwrap();
    wait_for_status(&calls, call_id, CallStatus::Ready).await;
    let mut caller = connect(&service, &ctx, CALLER, call_id).await;

    // The callee never accepts; the failure timer fires after two seconds.
    let frames = caller.frames_until(FrameType::CallEnd).await;
    assert_eq!(
        frames.last().unwrap().payload,
        EndReason::NoAnswer.code().to_string()
    );
    assert!(frames.iter().all(|f| f.kind != FrameType::CallStart));
    caller.closed().await;

    let row = calls.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(row.status, CallStatus::End);
    assert_eq!(row.end_reason, Some(EndReason::NoAnswer));
    for user in [CALLER, CALLEE] {
        assert!(ctx.store.get(&keys::user_lock(user)).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_reconnect_within_heartbeat_window_resumes() {
    let (service, ctx, calls) = service();
    let (call, mut caller, callee) = activate(&service, &ctx, &calls).await;

    drop(callee);
    wait_for_user_state(&mut caller, CALLEE, ParticipantState::Offline).await;

    let token = service.join_call(CALLEE, call.call_id).await.unwrap();
    let mut callee = CallClient::connect(&ctx, token).await;
    callee.start_heartbeat();
    let listed = callee.frames_until(FrameType::UpdateUserStates).await;
    let members: Vec<UserState> =
        serde_json::from_str(&listed.last().unwrap().payload).unwrap();
    assert!(members
        .iter()
        .any(|s| s.user_id == CALLEE && s.state == ParticipantState::Online));
    wait_for_user_state(&mut caller, CALLEE, ParticipantState::Online).await;

    // Past the heartbeat TTL the returning callee is still alive.
    let later = caller.drain_for(Duration::from_millis(900)).await;
    assert_eq!(dead_updates_for(&later, CALLEE), 0);
    assert!(call_ends(&later).is_empty());
    let row = calls.find_call(call.call_id).await.unwrap().unwrap();
    assert_eq!(row.status, CallStatus::Active);
    assert_eq!(row.start_time, call.start_time);

    service.hangup_call(CALLER, call.call_id).await.unwrap();
    callee.closed().await;
    caller.closed().await;
}

#[tokio::test]
async fn test_dead_user_claimed_elsewhere_cannot_reenter() {
    let (service, ctx, calls) = service();
    let third = UserId(3);
    let call_id = service.create_call(CALLER, 10, &[CALLEE, third]).await.unwrap();
    wait_for_status(&calls, call_id, CallStatus::Ready).await;
    let mut caller = connect(&service, &ctx, CALLER, call_id).await;
    let mut callee = connect(&service, &ctx, CALLEE, call_id).await;
    wait_for_status(&calls, call_id, CallStatus::Active).await;
    let mut silent = connect(&service, &ctx, third, call_id).await;

    silent.stop_heartbeat();
    wait_for_user_state(&mut caller, third, ParticipantState::Dead).await;
    let frames = silent.remaining_frames().await;
    assert_eq!(
        call_ends(&frames),
        vec![EndReason::LostConnection.code().to_string()]
    );

    // Someone else claims the third user while they are gone.
    let second = service.create_call(UserId(4), 11, &[third]).await.unwrap();
    wait_for_status(&calls, second, CallStatus::Ready).await;

    let token = service.join_call(third, call_id).await.unwrap();
    let mut returning = CallClient::connect(&ctx, token).await;
    let frames = returning.remaining_frames().await;
    assert_eq!(call_ends(&frames), vec![EndReason::Error.code().to_string()]);
    assert_eq!(
        ctx.store.get(&keys::user_lock(third)).await.unwrap(),
        Some(second.to_string())
    );

    // The original call carries on with the two who remain.
    let row = calls.find_call(call_id).await.unwrap().unwrap();
    assert_eq!(row.status, CallStatus::Active);
    let later = caller.drain_for(Duration::from_millis(300)).await;
    assert!(call_ends(&later).is_empty());

    service.hangup_call(CALLER, call_id).await.unwrap();
    callee.closed().await;
    caller.closed().await;
}

#[tokio::test]
async fn test_timeouts_after_call_end_change_nothing() {
    let (service, ctx, calls) = service();
    let (call, mut caller, mut callee) = activate(&service, &ctx, &calls).await;

    caller.stop_heartbeat();
    callee.stop_heartbeat();
    let caller_frames = caller.remaining_frames().await;
    let callee_frames = callee.remaining_frames().await;
    let lost = EndReason::LostConnection.code().to_string();
    assert_eq!(call_ends(&caller_frames), vec![lost.as_str()]);
    assert_eq!(call_ends(&callee_frames), vec![lost.as_str()]);

    wait_for_status(&calls, call.call_id, CallStatus::End).await;
    let ended = calls.find_call(call.call_id).await.unwrap().unwrap();
    assert_eq!(ended.end_reason, Some(EndReason::LostConnection));

    // Let every remaining deadline lapse.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let row = calls.find_call(call.call_id).await.unwrap().unwrap();
    assert_eq!(row, ended);
    for user in [CALLER, CALLEE] {
        assert!(ctx.store.get(&keys::user_lock(user)).await.unwrap().is_none());
    }
}
