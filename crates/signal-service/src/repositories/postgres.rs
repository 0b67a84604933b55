//! Postgres repositories over the chat service's tables.
//!
//! # Security
//!
//! - All queries use parameterized statements (SQL injection safe)
//! - Call creation is one transaction: summary message, call row, back-link
//! - Status writes are guarded by the current status, so a late writer
//!   cannot move a call backwards or overwrite its end reason

use crate::call::types::{Call, CallStatus, EndReason};
use crate::errors::SignalError;
use crate::observability::metrics;
use crate::repositories::{CallRepository, NewCall, SessionDirectory};
use async_trait::async_trait;
use common::types::{CallId, MessageId, UserId};
use sqlx::{PgPool, Row};
use std::time::Instant;
use tracing::{debug, instrument};

/// Chat message type for call summaries.
const CHAT_MESSAGE_TYPE_CALL: i32 = 3;

fn db_id(id: u64) -> Result<i64, SignalError> {
    i64::try_from(id).map_err(|_| SignalError::BadRequest(format!("id {id} out of range")))
}

fn row_id(id: i64) -> u64 {
    id.unsigned_abs()
}

fn db_error(operation: &'static str, start: Instant) -> impl FnOnce(sqlx::Error) -> SignalError {
    move |e| {
        metrics::record_db_query(operation, "error", start.elapsed());
        SignalError::Database(e.to_string())
    }
}

/// Status writes only apply along the call status table; a row already
/// past `to` is left alone.
fn skipped_if_stale(rows_affected: u64, call_id: CallId, to: CallStatus) {
    if rows_affected == 0 {
        debug!(target: "sig.repo", call_id = %call_id, status = ?to,
            "Call status write skipped, row missing or already past it");
    }
}

/// Map a `calls` row to a [`Call`].
fn map_row_to_call(row: &sqlx::postgres::PgRow) -> Result<Call, SignalError> {
    let members: String = row.get("members");
    let members: Vec<UserId> = serde_json::from_str(&members)
        .map_err(|e| SignalError::Database(format!("invalid members column: {e}")))?;
    let status: i32 = row.get("status");
    let end_reason: i32 = row.get("end_reason");

    Ok(Call {
        call_id: CallId(row_id(row.get("call_id"))),
        caller_id: UserId(row_id(row.get("caller_id"))),
        message_id: MessageId(row_id(row.get("message_id"))),
        members,
        status: CallStatus::from_code(status)
            .ok_or_else(|| SignalError::Database(format!("invalid call status {status}")))?,
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        end_reason: EndReason::from_code(end_reason),
    })
}

/// Call rows in Postgres.
#[derive(Clone)]
pub struct PgCallRepository {
    pool: PgPool,
}

impl PgCallRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallRepository for PgCallRepository {
    #[instrument(skip_all, name = "sig.repo.create_call")]
    async fn create_call(&self, new_call: NewCall) -> Result<Call, SignalError> {
        let start = Instant::now();
        let members = serde_json::to_string(&new_call.members)
            .map_err(|e| SignalError::Internal(format!("encode members: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("create_call", start))?;

        let message_id: i64 = sqlx::query(
            r#"
            INSERT INTO chat_messages (room_id, sender_id, type, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            RETURNING message_id
            "#,
        )
        .bind(db_id(new_call.room_id)?) // $1
        .bind(db_id(new_call.caller_id.get())?) // $2
        .bind(CHAT_MESSAGE_TYPE_CALL) // $3
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("create_call", start))?
        .get("message_id");

        let row = sqlx::query(
            r#"
            INSERT INTO calls (caller_id, message_id, members, status, end_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, NOW(), NOW())
            RETURNING call_id, caller_id, message_id, members, status,
                      start_time, end_time, end_reason
            "#,
        )
        .bind(db_id(new_call.caller_id.get())?) // $1
        .bind(message_id) // $2
        .bind(&members) // $3
        .bind(CallStatus::New.code()) // $4
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("create_call", start))?;
        let call = map_row_to_call(&row)?;

        sqlx::query("UPDATE chat_messages SET call_id = $1 WHERE message_id = $2")
            .bind(db_id(call.call_id.get())?)
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("create_call", start))?;

        tx.commit().await.map_err(db_error("create_call", start))?;
        metrics::record_db_query("create_call", "success", start.elapsed());
        Ok(call)
    }

    #[instrument(skip_all, name = "sig.repo.find_call", fields(call_id = %call_id))]
    async fn find_call(&self, call_id: CallId) -> Result<Option<Call>, SignalError> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT call_id, caller_id, message_id, members, status,
                   start_time, end_time, end_reason
            FROM calls
            WHERE call_id = $1
            "#,
        )
        .bind(db_id(call_id.get())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find_call", start))?;

        metrics::record_db_query("find_call", "success", start.elapsed());
        row.as_ref().map(map_row_to_call).transpose()
    }

    async fn update_status(&self, call_id: CallId, status: CallStatus) -> Result<(), SignalError> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE calls
            SET status = $2, updated_at = NOW()
            WHERE call_id = $1 AND status = ANY($3)
            "#,
        )
        .bind(db_id(call_id.get())?) // $1
        .bind(status.code()) // $2
        .bind(CallStatus::predecessor_codes(status)) // $3
        .execute(&self.pool)
        .await
        .map_err(db_error("update_call_status", start))?;
        metrics::record_db_query("update_call_status", "success", start.elapsed());
        skipped_if_stale(result.rows_affected(), call_id, status);
        Ok(())
    }

    async fn mark_started(&self, call_id: CallId) -> Result<(), SignalError> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE calls
            SET start_time = NOW(), status = $2, updated_at = NOW()
            WHERE call_id = $1 AND status = ANY($3)
            "#,
        )
        .bind(db_id(call_id.get())?) // $1
        .bind(CallStatus::Active.code()) // $2
        .bind(CallStatus::predecessor_codes(CallStatus::Active)) // $3
        .execute(&self.pool)
        .await
        .map_err(db_error("mark_call_started", start))?;
        metrics::record_db_query("mark_call_started", "success", start.elapsed());
        skipped_if_stale(result.rows_affected(), call_id, CallStatus::Active);
        Ok(())
    }

    async fn mark_ended(&self, call_id: CallId, reason: EndReason) -> Result<(), SignalError> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE calls
            SET end_time = NOW(), end_reason = $2, status = $3, updated_at = NOW()
            WHERE call_id = $1 AND status = ANY($4)
            "#,
        )
        .bind(db_id(call_id.get())?) // $1
        .bind(reason.code()) // $2
        .bind(CallStatus::End.code()) // $3
        .bind(CallStatus::predecessor_codes(CallStatus::End)) // $4
        .execute(&self.pool)
        .await
        .map_err(db_error("mark_call_ended", start))?;
        metrics::record_db_query("mark_call_ended", "success", start.elapsed());
        skipped_if_stale(result.rows_affected(), call_id, CallStatus::End);
        Ok(())
    }
}

/// Login and delivery lookups in Postgres.
#[derive(Clone)]
pub struct PgSessionDirectory {
    pool: PgPool,
}

impl PgSessionDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionDirectory for PgSessionDirectory {
    async fn resolve_login(&self, login_id: &str) -> Result<Option<UserId>, SignalError> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT user_id FROM login_users
            WHERE login_id = $1 AND enabled = true AND expire_at > NOW()
            "#,
        )
        .bind(login_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("resolve_login", start))?;

        metrics::record_db_query("resolve_login", "success", start.elapsed());
        Ok(row.map(|row| UserId(row_id(row.get("user_id")))))
    }

    async fn last_delivery_id(&self, user_id: UserId) -> Result<u64, SignalError> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT id FROM message_deliveries
            WHERE receiver_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(db_id(user_id.get())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("last_delivery_id", start))?;

        metrics::record_db_query("last_delivery_id", "success", start.elapsed());
        Ok(row.map_or(0, |row| row_id(row.get("id"))))
    }
}
