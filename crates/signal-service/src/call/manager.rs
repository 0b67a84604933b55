//! The per-call state machine.
//!
//! One [`CallManager`] drives a call at a time, guarded by the call's
//! manager lock. It runs as a single task selecting over:
//!
//! - the failure timer (armed from Ready until the call becomes Active)
//! - its own mailbox of [`ManagerAction`]s
//! - heartbeat deadlines of participants, via the delegate
//! - its cancellation token
//! - a periodic refresh of its liveness marker in the monitor queue
//!
//! Store errors inside a handler are logged and the action is dropped; the
//! loop only ends through a terminal call transition, cancellation, or a
//! panic caught at the loop boundary. Whatever ends it, [`CallManager::run`]
//! always runs the exit path, which ends the call if it is still open.

use crate::call::actions::{ManagerAction, Signal};
use crate::call::delegate::{ManagerDelegate, StoreDelegate};
use crate::call::handle::SessionHandle;
use crate::call::keys;
use crate::call::monitor::MonitorHandle;
use crate::call::types::{CallStatus, EndReason, ExitReason, ParticipantState, UserState, PING_LOST};
use crate::call::CallContext;
use crate::config::CallTimings;
use crate::errors::SignalError;
use crate::observability::metrics;
use crate::sched::{MailboxState, Message, Queue};
use crate::store::CoordinationStore;
use common::types::{CallId, UserId};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

struct FailureTimer {
    deadline: Option<Instant>,
    reason: EndReason,
}

/// Driver of one call. See the module docs.
pub struct CallManager {
    call_id: CallId,
    store: Arc<dyn CoordinationStore>,
    delegate: Arc<dyn ManagerDelegate>,
    monitor: MonitorHandle,
    timings: CallTimings,
    cancel: CancellationToken,
    mailbox: Option<Queue>,
    failure: FailureTimer,
    holds_lock: bool,
    owns_call: bool,
}

impl CallManager {
    pub fn new(ctx: &CallContext, delegate: Arc<dyn ManagerDelegate>) -> Self {
        Self {
            call_id: delegate.call_id(),
            store: Arc::clone(&ctx.store),
            delegate,
            monitor: ctx.monitor.clone(),
            timings: ctx.timings,
            cancel: CancellationToken::new(),
            mailbox: None,
            failure: FailureTimer {
                deadline: None,
                reason: EndReason::Error,
            },
            holds_lock: false,
            owns_call: false,
        }
    }

    /// Load the call and run its manager in the background.
    pub async fn start(ctx: &CallContext, call_id: CallId) -> Result<JoinHandle<()>, SignalError> {
        let delegate = StoreDelegate::load(ctx, call_id).await?;
        Ok(Self::new(ctx, Arc::new(delegate)).spawn())
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the call to completion.
    #[instrument(skip_all, name = "sig.call.manager", fields(call_id = %self.call_id))]
    pub async fn run(mut self) {
        debug!(target: "sig.call.manager", call_id = %self.call_id, "Manager started");
        if AssertUnwindSafe(self.drive()).catch_unwind().await.is_err() {
            error!(target: "sig.call.manager", call_id = %self.call_id, "Manager loop panicked");
            metrics::record_manager_panic();
        }
        self.exit().await;
    }

    async fn drive(&mut self) {
        if !self.check_call().await || !self.setup().await {
            return;
        }
        let Some(mut actions) = self.mailbox.as_ref().and_then(Queue::channel) else {
            error!(target: "sig.call.manager", call_id = %self.call_id, "Manager mailbox already consumed");
            return;
        };
        let Some(mut dead_users) = self.delegate.dead_users() else {
            error!(target: "sig.call.manager", call_id = %self.call_id, "Heartbeat deadlines already consumed");
            return;
        };

        self.refresh_marker().await;
        let period = self.monitor.ttl() / 2;
        let mut marker_tick = tokio::time::interval_at(Instant::now() + period, period);
        self.failure = FailureTimer {
            deadline: Some(Instant::now() + self.timings.failure_timeout),
            reason: EndReason::Error,
        };

        loop {
            let failure_at = self.failure.deadline;
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                () = tokio::time::sleep_until(failure_at.unwrap_or_else(Instant::now)), if failure_at.is_some() => {
                    warn!(target: "sig.call.manager", call_id = %self.call_id, "Call did not start in time");
                    let reason = self.failure.reason;
                    self.call_end(reason).await;
                    break;
                }

                Some(message) = actions.recv() => {
                    self.handle_message(&message).await;
                    if let Some(mailbox) = &self.mailbox {
                        if let Err(e) = mailbox.ack(true).await {
                            warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e, "Mailbox ack failed");
                        }
                    }
                }

                Some(user_id) = dead_users.recv() => {
                    if let Err(e) = self.user_dead(user_id, ExitReason::Lost).await {
                        warn!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
                            error = %e, "Failed to handle heartbeat timeout");
                    }
                }

                _ = marker_tick.tick() => self.refresh_marker().await,
            }
        }
    }

    async fn refresh_marker(&self) {
        if let Err(e) = self.monitor.heartbeat(self.call_id).await {
            warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e, "Manager heartbeat failed");
        }
    }

    /// Win the manager lock and find the call still New.
    async fn check_call(&mut self) -> bool {
        if self.delegate.manager_lock().await.is_err() {
            info!(target: "sig.call.manager", call_id = %self.call_id, "Call already has a manager");
            return false;
        }
        self.holds_lock = true;

        match self.delegate.call_status().await {
            Ok(CallStatus::New) => {
                self.owns_call = true;
                true
            }
            Ok(status) => {
                warn!(target: "sig.call.manager", call_id = %self.call_id, status = ?status,
                    "Call is past setup");
                false
            }
            Err(e) => {
                warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e,
                    "Failed to read call status");
                false
            }
        }
    }

    async fn setup(&mut self) -> bool {
        if let Err(e) = self.try_lock_users().await {
            warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e, "Call setup failed");
            let reason = match e {
                SignalError::CallerBusy | SignalError::CalleeBusy => EndReason::Busy,
                _ => EndReason::Error,
            };
            self.call_end(reason).await;
            return false;
        }
        if let Err(e) = self.prepare().await {
            warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e, "Call setup failed");
            self.call_end(EndReason::Error).await;
            return false;
        }
        debug!(target: "sig.call.manager", call_id = %self.call_id, "Call ready");
        true
    }

    /// Claim every member, caller first. The caller must get theirs and at
    /// least one invitee must too.
    async fn try_lock_users(&self) -> Result<(), SignalError> {
        let caller = self.delegate.caller_id();
        let user_ids = self.delegate.user_ids().await?;
        let mut locked = 0usize;
        for user_id in &user_ids {
            match self.delegate.lock_user(*user_id).await {
                Ok(()) => locked += 1,
                Err(SignalError::UserLockInvalid) if *user_id == caller => {
                    return Err(SignalError::CallerBusy);
                }
                Err(SignalError::UserLockInvalid) => {
                    debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
                        "User is in another call");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(target: "sig.call.manager", call_id = %self.call_id, users = user_ids.len(), locked,
            "Users locked");
        if locked < 2 {
            return Err(SignalError::CalleeBusy);
        }
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), SignalError> {
        for user_id in self.delegate.user_ids().await? {
            self.delegate
                .save_user_state(UserState::invited(user_id))
                .await?;
        }
        let mailbox = Queue::new(
            Arc::clone(&self.store),
            &keys::manager_mailbox(self.call_id),
            self.timings.lock_heartbeat,
        );
        mailbox.save_state(MailboxState::Active).await?;
        self.mailbox = Some(mailbox);
        self.delegate.call_ready().await
    }

    async fn handle_message(&mut self, message: &Message) {
        let action: ManagerAction = match message.decode() {
            Ok(action) => action,
            Err(e) => {
                warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e,
                    "Dropping undecodable action");
                return;
            }
        };
        let result = match action {
            ManagerAction::UserAccepted(user_id) => self.user_accepted(user_id).await,
            ManagerAction::UserOnline(user_id) => self.user_online(user_id).await,
            ManagerAction::UserOffline(user_id) => self.user_offline(user_id).await,
            ManagerAction::Hangup(user_id) => self.hangup(user_id).await,
            ManagerAction::Signaling(signal) => self.signaling(signal).await,
            ManagerAction::Heartbeat(user_id) => self.heartbeat(user_id).await,
        };
        if let Err(e) = result {
            warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e, "Action failed");
        }
    }

    fn transition_allowed(&self, user_id: UserId, from: ParticipantState, to: ParticipantState) -> bool {
        let allowed = ParticipantState::can_transition(from, to);
        if !allowed {
            warn!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
                from = ?from, to = ?to, "Invalid participant transition");
        }
        allowed
    }

    async fn member_state(&self, user_id: UserId) -> Result<Option<UserState>, SignalError> {
        let state = self.delegate.user_state(user_id).await?;
        if state.is_none() {
            warn!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
                "No state for user");
        }
        Ok(state)
    }

    async fn sessions(&self, exclude: Option<UserId>) -> Result<Vec<SessionHandle>, SignalError> {
        let mut sessions = Vec::new();
        for user_id in self.delegate.user_ids().await? {
            if Some(user_id) == exclude {
                continue;
            }
            if let Some(session) = self.delegate.user_session(user_id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn delivered(&self, session: &SessionHandle, result: Result<(), SignalError>) {
        if let Err(e) = result {
            debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %session.user_id(),
                error = %e, "Session did not take the update");
        }
    }

    async fn notify_user_state_updated(&self, state: UserState) -> Result<(), SignalError> {
        if self.delegate.call_status().await? == CallStatus::End {
            return Ok(());
        }
        for session in self.sessions(Some(state.user_id)).await? {
            let result = session.update_user_state(state).await;
            self.delivered(&session, result);
        }
        Ok(())
    }

    async fn user_accepted(&mut self, user_id: UserId) -> Result<(), SignalError> {
        debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id, "User accepted");
        let Some(mut state) = self.member_state(user_id).await? else {
            return Ok(());
        };
        if state.state != ParticipantState::Invited {
            return Ok(());
        }
        state.state = ParticipantState::Accepted;
        self.delegate.save_user_state(state).await?;
        self.delegate.update_user_ttl(user_id).await?;
        self.notify_user_state_updated(state).await
    }

    async fn user_online(&mut self, user_id: UserId) -> Result<(), SignalError> {
        debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id, "User online");
        let Some(mut state) = self.member_state(user_id).await? else {
            return Ok(());
        };
        if !self.transition_allowed(user_id, state.state, ParticipantState::Online) {
            return Ok(());
        }
        if state.state == ParticipantState::Dead {
            match self.delegate.lock_user(user_id).await {
                Ok(()) => {}
                Err(SignalError::UserLockInvalid) => {
                    info!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
                        "Returning user joined another call meanwhile");
                    return self.on_user_exit(user_id, ExitReason::ReenterBusy).await;
                }
                Err(e) => return Err(e),
            }
        }

        state.state = ParticipantState::Online;
        self.delegate.save_user_state(state).await?;
        self.delegate.update_user_ttl(user_id).await?;
        if self.delegate.call_status().await? == CallStatus::Ready {
            self.check_call_started(user_id).await?;
        }
        if let Some(session) = self.delegate.user_session(user_id).await? {
            let result = session
                .update_user_states(self.delegate.user_states().await?)
                .await;
            self.delivered(&session, result);
        }
        self.notify_user_state_updated(state).await
    }

    async fn check_call_started(&mut self, online_user: UserId) -> Result<(), SignalError> {
        if self.delegate.alive_user_count(true).await? >= 2 {
            self.delegate.call_start().await?;
            self.failure.deadline = None;
            metrics::record_call_started();
            info!(target: "sig.call.manager", call_id = %self.call_id, "Call started");
            for session in self.sessions(None).await? {
                let result = session.call_start().await;
                self.delivered(&session, result);
            }
        } else if online_user == self.delegate.caller_id() {
            self.failure.reason = EndReason::NoAnswer;
        }
        Ok(())
    }

    async fn user_offline(&mut self, user_id: UserId) -> Result<(), SignalError> {
        debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id, "User offline");
        let Some(mut state) = self.member_state(user_id).await? else {
            return Ok(());
        };
        if state.state == ParticipantState::Dead
            || !self.transition_allowed(user_id, state.state, ParticipantState::Offline)
        {
            return Ok(());
        }
        state.state = ParticipantState::Offline;
        self.delegate.save_user_state(state).await?;
        self.notify_user_state_updated(state).await
    }

    async fn user_dead(&mut self, user_id: UserId, reason: ExitReason) -> Result<(), SignalError> {
        let Some(mut state) = self.member_state(user_id).await? else {
            return Ok(());
        };
        if state.state == ParticipantState::Dead {
            debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id, "User already dead");
            return Ok(());
        }
        if !self.transition_allowed(user_id, state.state, ParticipantState::Dead) {
            return Ok(());
        }
        debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
            reason = ?reason, "User dead");

        state.state = ParticipantState::Dead;
        if reason == ExitReason::Lost {
            state.ping = PING_LOST;
            metrics::record_participant_dead();
        }
        self.delegate.save_user_state(state).await?;
        self.notify_user_state_updated(state).await?;
        self.on_user_exit(user_id, reason).await
    }

    async fn on_user_exit(&mut self, user_id: UserId, reason: ExitReason) -> Result<(), SignalError> {
        let status = self.delegate.call_status().await?;
        let caller_cancelling = reason == ExitReason::Normal
            && status == CallStatus::Ready
            && user_id == self.delegate.caller_id();
        let end_reason = reason.end_reason(caller_cancelling);

        self.clean_up_user(user_id, end_reason).await;
        if caller_cancelling || self.delegate.alive_user_count(false).await? < 2 {
            self.call_end(end_reason).await;
        }
        Ok(())
    }

    /// Tell the user's session the call is over for them, close it, and
    /// free their exclusivity claim.
    async fn clean_up_user(&self, user_id: UserId, reason: EndReason) {
        match self.delegate.user_session(user_id).await {
            Ok(Some(session)) => {
                let result = session.call_end(reason).await;
                self.delivered(&session, result);
                let result = session.close().await;
                self.delivered(&session, result);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
                    error = %e, "Failed to resolve session");
            }
        }
        if let Err(e) = self.delegate.unlock_user(user_id).await {
            debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id,
                error = %e, "User lock not released");
        }
    }

    async fn hangup(&mut self, user_id: UserId) -> Result<(), SignalError> {
        debug!(target: "sig.call.manager", call_id = %self.call_id, user_id = %user_id, "User hangup");
        let Some(mut state) = self.member_state(user_id).await? else {
            return Ok(());
        };
        if state.state == ParticipantState::Invited {
            state.state = ParticipantState::Rejected;
            self.delegate.save_user_state(state).await?;
            self.on_user_exit(user_id, ExitReason::Rejected).await?;
            self.notify_user_state_updated(state).await
        } else {
            self.user_dead(user_id, ExitReason::Normal).await
        }
    }

    async fn signaling(&self, signal: Signal) -> Result<(), SignalError> {
        match self.delegate.user_session(signal.to_user_id).await? {
            Some(session) => {
                let result = session.signaling(signal.from_user_id, signal.message).await;
                self.delivered(&session, result);
            }
            None => {
                debug!(target: "sig.call.manager", call_id = %self.call_id, to = %signal.to_user_id,
                    "Signaling target not connected");
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, user_id: UserId) -> Result<(), SignalError> {
        match self.delegate.user_state(user_id).await? {
            Some(state) if state.state.is_alive() && state.state != ParticipantState::Invited => {
                self.delegate.update_user_ttl(user_id).await
            }
            _ => Ok(()),
        }
    }

    /// Persist the end, notify every remaining session, release every
    /// claim, and stop the loop.
    async fn call_end(&mut self, reason: EndReason) {
        match self.delegate.call_status().await {
            Ok(CallStatus::End) => {
                warn!(target: "sig.call.manager", call_id = %self.call_id, "Call already ended");
                self.cancel.cancel();
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e,
                    "Call status unknown, ending anyway");
            }
        }

        if let Err(e) = self.delegate.call_end(reason).await {
            error!(target: "sig.call.manager", call_id = %self.call_id, error = %e,
                "Failed to persist call end");
        }
        metrics::record_call_ended(reason.label());
        info!(target: "sig.call.manager", call_id = %self.call_id, reason = ?reason, "Call ended");

        match self.delegate.user_ids().await {
            Ok(user_ids) => {
                for user_id in user_ids {
                    self.clean_up_user(user_id, reason).await;
                }
            }
            Err(e) => {
                warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e,
                    "Failed to load members for cleanup");
            }
        }
        self.failure.deadline = None;
        self.cancel.cancel();
    }

    async fn exit(&mut self) {
        self.failure.deadline = None;
        self.cancel.cancel();

        if !self.owns_call {
            if self.holds_lock {
                self.delegate.manager_unlock().await;
            }
            self.delegate.close(false).await;
            debug!(target: "sig.call.manager", call_id = %self.call_id, "Manager left the call untouched");
            return;
        }

        if !matches!(self.delegate.call_status().await, Ok(CallStatus::End)) {
            error!(target: "sig.call.manager", call_id = %self.call_id, "Manager exiting before call end");
            self.call_end(EndReason::Error).await;
        }
        if let Some(mailbox) = self.mailbox.take() {
            if let Err(e) = mailbox.close(true).await {
                warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e,
                    "Failed to close manager mailbox");
            }
        }
        self.delegate.manager_unlock().await;
        if let Err(e) = self.monitor.clear(self.call_id).await {
            warn!(target: "sig.call.manager", call_id = %self.call_id, error = %e,
                "Failed to clear manager marker");
        }
        self.delegate.close(true).await;
        debug!(target: "sig.call.manager", call_id = %self.call_id, "Manager exited");
    }

    /// Forced cleanup of a call whose manager stopped heartbeating.
    /// Skipped if a live manager still holds the manager lock.
    #[instrument(skip_all, name = "sig.call.monitor", fields(call_id = %self.call_id))]
    pub async fn clean_after_died(mut self) {
        if self.delegate.manager_lock().await.is_err() {
            info!(target: "sig.call.monitor", call_id = %self.call_id,
                "Call still has a live manager, skipping cleanup");
            self.delegate.close(false).await;
            return;
        }

        if matches!(self.delegate.call_status().await, Ok(CallStatus::End)) {
            warn!(target: "sig.call.monitor", call_id = %self.call_id, "Call already ended");
        } else {
            self.call_end(EndReason::Error).await;
            metrics::record_forced_cleanup();
        }

        // The dead manager's mailbox still reads Active.
        let mailbox = Queue::producer(Arc::clone(&self.store), &keys::manager_mailbox(self.call_id));
        if let Err(e) = mailbox.close(true).await {
            warn!(target: "sig.call.monitor", call_id = %self.call_id, error = %e,
                "Failed to clear manager mailbox");
        }
        self.delegate.manager_unlock().await;
        self.delegate.close(true).await;
        info!(target: "sig.call.monitor", call_id = %self.call_id, "Forced cleanup done");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::call::test_support::{test_context, wait_for_status};
    use crate::repositories::{CallRepository, NewCall};
    use crate::store::KeyTtl;

    #[tokio::test]
    async fn test_caller_busy_ends_call_without_ready() {
        let (ctx, calls) = test_context();
        // The caller is still claimed by another call.
        ctx.store
            .claim(&keys::user_lock(UserId(1)), "999", std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let call = calls
            .create_call(NewCall {
                room_id: 1,
                caller_id: UserId(1),
                members: vec![UserId(1), UserId(2), UserId(3)],
            })
            .await
            .unwrap();
        CallManager::start(&ctx, call.call_id)
            .await
            .unwrap()
            .await
            .unwrap();

        let row = calls.find_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::End);
        assert_eq!(row.end_reason, Some(EndReason::Busy));
        assert!(row.start_time.is_none());
        // Invitees were never claimed.
        assert!(ctx
            .store
            .get(&keys::user_lock(UserId(2)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_callee_busy_releases_caller() {
        let (ctx, calls) = test_context();
        ctx.store
            .claim(&keys::user_lock(UserId(2)), "999", std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let call = calls
            .create_call(NewCall {
                room_id: 1,
                caller_id: UserId(1),
                members: vec![UserId(1), UserId(2)],
            })
            .await
            .unwrap();
        CallManager::start(&ctx, call.call_id)
            .await
            .unwrap()
            .await
            .unwrap();

        let row = calls.find_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(row.end_reason, Some(EndReason::Busy));
        assert!(ctx
            .store
            .get(&keys::user_lock(UserId(1)))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            ctx.store.get(&keys::user_lock(UserId(2))).await.unwrap(),
            Some("999".to_string())
        );
    }

    #[tokio::test]
    async fn test_failure_timer_ends_unanswered_call() {
        let (ctx, calls) = test_context();
        let call = calls
            .create_call(NewCall {
                room_id: 1,
                caller_id: UserId(1),
                members: vec![UserId(1), UserId(2)],
            })
            .await
            .unwrap();
        let task = CallManager::start(&ctx, call.call_id).await.unwrap();
        wait_for_status(&calls, call.call_id, CallStatus::Ready).await;

        task.await.unwrap();
        let row = calls.find_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::End);
        assert_eq!(row.end_reason, Some(EndReason::Error));
        // Exit tears down the mailbox and cached state.
        assert!(crate::call::handle::find_manager(&ctx.store, call.call_id)
            .await
            .unwrap()
            .is_none());
        assert!(ctx
            .store
            .get(&keys::status(call.call_id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_second_manager_leaves_call_alone() {
        let (ctx, calls) = test_context();
        let call = calls
            .create_call(NewCall {
                room_id: 1,
                caller_id: UserId(1),
                members: vec![UserId(1), UserId(2)],
            })
            .await
            .unwrap();
        let first = CallManager::start(&ctx, call.call_id).await.unwrap();
        wait_for_status(&calls, call.call_id, CallStatus::Ready).await;

        CallManager::start(&ctx, call.call_id)
            .await
            .unwrap()
            .await
            .unwrap();
        let row = calls.find_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Ready);
        assert!(crate::call::handle::find_manager(&ctx.store, call.call_id)
            .await
            .unwrap()
            .is_some());

        first.abort();
    }

    #[tokio::test]
    async fn test_forced_cleanup_skips_live_manager() {
        let (ctx, calls) = test_context();
        let call = calls
            .create_call(NewCall {
                room_id: 1,
                caller_id: UserId(1),
                members: vec![UserId(1), UserId(2)],
            })
            .await
            .unwrap();
        let live = CallManager::start(&ctx, call.call_id).await.unwrap();
        wait_for_status(&calls, call.call_id, CallStatus::Ready).await;

        let delegate = StoreDelegate::load(&ctx, call.call_id).await.unwrap();
        CallManager::new(&ctx, Arc::new(delegate))
            .clean_after_died()
            .await;
        let row = calls.find_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Ready);

        live.abort();
    }

    #[tokio::test]
    async fn test_manager_for_started_call_caches_status_briefly() {
        let (ctx, calls) = test_context();
        let call = calls
            .create_call(NewCall {
                room_id: 1,
                caller_id: UserId(1),
                members: vec![UserId(1), UserId(2)],
            })
            .await
            .unwrap();
        calls.update_status(call.call_id, CallStatus::Ready).await.unwrap();

        CallManager::start(&ctx, call.call_id)
            .await
            .unwrap()
            .await
            .unwrap();
        let row = calls.find_call(call.call_id).await.unwrap().unwrap();
        assert_eq!(row.status, CallStatus::Ready);
        match ctx.store.ttl(&keys::status(call.call_id)).await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= ctx.timings.manager_ttl),
            other => panic!("status cache should expire, got {other:?}"),
        }
    }
}
