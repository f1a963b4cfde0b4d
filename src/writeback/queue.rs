//! Durable pending-write queue.
//!
//! Rows move `pending -> claimed -> (deleted | pending | exhausted)`. Ownership
//! of a claimed row is the random `claim_token` written by the claiming
//! transaction; every later transition is conditional on that token, so a
//! worker whose claim was stolen (lease expiry) or whose row was removed
//! (undo) can never act on it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::config::WritebackConfig;
use crate::db::{format_ts, opt_ts_column, ts_column};
use crate::history::{ConversationScope, ConversationTurn};
use crate::memory::store::write_audit_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Claimed,
    Exhausted,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for PendingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "exhausted" => Ok(Self::Exhausted),
            _ => Err(format!("unknown pending status: {s}")),
        }
    }
}

/// A row of `pending_memory_writes`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingWrite {
    pub id: String,
    pub turn_id: String,
    pub scope: ConversationScope,
    pub text: String,
    pub metadata: Option<serde_json::Value>,
    pub status: PendingStatus,
    #[serde(skip)]
    pub claim_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

const PENDING_COLUMNS: &str = "id, turn_id, channel_id, character_id, persona_id, text, metadata, \
     status, claim_token, claimed_at, attempts, last_attempt_at, next_attempt_at, error, created_at";

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingWrite> {
    let metadata: Option<String> = row.get(6)?;
    let status: String = row.get(7)?;
    Ok(PendingWrite {
        id: row.get(0)?,
        turn_id: row.get(1)?,
        scope: ConversationScope {
            channel_id: row.get(2)?,
            character_id: row.get(3)?,
            persona_id: row.get(4)?,
        },
        text: row.get(5)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
        })?,
        claim_token: row.get(8)?,
        claimed_at: opt_ts_column(row, 9)?,
        attempts: row.get(10)?,
        last_attempt_at: opt_ts_column(row, 11)?,
        next_attempt_at: ts_column(row, 12)?,
        error: row.get(13)?,
        created_at: ts_column(row, 14)?,
    })
}

/// Retry and exhaustion policy for failed writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &WritebackConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base_secs: config.backoff_base_secs,
            backoff_max_secs: config.backoff_max_secs,
        }
    }

    /// Delay before the next try after `attempts` failures:
    /// `min(base * 2^(attempts - 1), max)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32);
        let secs = self
            .backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_secs);
        Duration::seconds(secs.min(u64::from(u32::MAX)) as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WritebackConfig::default())
    }
}

/// Enqueue the memory write for a freshly persisted turn.
///
/// Called inside the transaction that inserts the turn.
pub fn enqueue(
    conn: &Connection,
    turn: &ConversationTurn,
    metadata: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO pending_memory_writes \
         (id, turn_id, channel_id, character_id, persona_id, text, metadata, status, next_attempt_at, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
        params![
            id,
            turn.id,
            turn.scope.channel_id,
            turn.scope.character_id,
            turn.scope.persona_id,
            turn.content,
            metadata.to_string(),
            format_ts(&now),
        ],
    )?;
    Ok(id)
}

/// Atomically claim the next due row.
///
/// A row is due when it is pending with `next_attempt_at <= now`, or claimed
/// longer than `lease` ago (its worker is presumed dead). The claim runs in an
/// IMMEDIATE transaction so two connections cannot select the same row.
pub fn claim_next(
    conn: &mut Connection,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Option<PendingWrite>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let token = uuid::Uuid::new_v4().to_string();
    let stale_before = now - lease;

    let sql = format!(
        "UPDATE pending_memory_writes SET status = 'claimed', claim_token = ?1, claimed_at = ?2 \
         WHERE id = ( \
             SELECT id FROM pending_memory_writes \
             WHERE (status = 'pending' AND next_attempt_at <= ?2) \
                OR (status = 'claimed' AND claimed_at <= ?3) \
             ORDER BY next_attempt_at, created_at \
             LIMIT 1 \
         ) \
         RETURNING {PENDING_COLUMNS}"
    );
    let claimed = tx
        .query_row(
            &sql,
            params![token, format_ts(&now), format_ts(&stale_before)],
            pending_from_row,
        )
        .optional()?;
    tx.commit()?;

    if let Some(write) = &claimed {
        tracing::debug!(pending = %write.id, turn = %write.turn_id, attempts = write.attempts, "pending write claimed");
    }
    Ok(claimed)
}

/// Remove a claimed row on success. Returns `false` if the claim was lost.
///
/// Must run in the transaction that inserts the memory rows.
pub fn complete(conn: &Connection, id: &str, claim_token: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM pending_memory_writes WHERE id = ?1 AND claim_token = ?2 AND status = 'claimed'",
        params![id, claim_token],
    )?;
    Ok(rows == 1)
}

/// Result of [`record_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending; due again at `next_attempt_at`.
    Retrying { attempts: u32, next_attempt_at: DateTime<Utc> },
    /// Retained for inspection; no further automatic attempts.
    Exhausted { attempts: u32 },
    /// The row is no longer ours.
    ClaimLost,
}

/// Record a failed attempt on a claimed row.
///
/// Increments `attempts`, stores the error, and either schedules a retry
/// with backoff or marks the row exhausted (permanent error or attempts used
/// up).
pub fn record_failure(
    conn: &mut Connection,
    write: &PendingWrite,
    error: &str,
    permanent: bool,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<FailureOutcome> {
    let Some(token) = write.claim_token.as_deref() else {
        return Ok(FailureOutcome::ClaimLost);
    };
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let attempts: Option<u32> = tx
        .query_row(
            "SELECT attempts FROM pending_memory_writes WHERE id = ?1 AND claim_token = ?2 AND status = 'claimed'",
            params![write.id, token],
            |row| row.get(0),
        )
        .optional()?;
    let Some(attempts) = attempts.map(|a| a + 1) else {
        return Ok(FailureOutcome::ClaimLost);
    };

    let outcome = if permanent || attempts >= policy.max_attempts {
        tx.execute(
            "UPDATE pending_memory_writes SET status = 'exhausted', attempts = ?1, error = ?2, \
             last_attempt_at = ?3, claim_token = NULL, claimed_at = NULL WHERE id = ?4",
            params![attempts, error, format_ts(&now), write.id],
        )?;
        write_audit_log(
            &tx,
            "exhaust",
            &write.id,
            Some(&serde_json::json!({
                "turn_id": write.turn_id,
                "attempts": attempts,
                "permanent": permanent,
                "error": error,
            })),
            now,
        )?;
        FailureOutcome::Exhausted { attempts }
    } else {
        let next_attempt_at = now + policy.backoff(attempts);
        tx.execute(
            "UPDATE pending_memory_writes SET status = 'pending', attempts = ?1, error = ?2, \
             last_attempt_at = ?3, next_attempt_at = ?4, claim_token = NULL, claimed_at = NULL \
             WHERE id = ?5",
            params![attempts, error, format_ts(&now), format_ts(&next_attempt_at), write.id],
        )?;
        FailureOutcome::Retrying { attempts, next_attempt_at }
    };
    tx.commit()?;

    match &outcome {
        FailureOutcome::Exhausted { attempts } => tracing::error!(
            pending = %write.id,
            turn = %write.turn_id,
            scope = %write.scope,
            attempts,
            permanent,
            error,
            "memory write exhausted"
        ),
        FailureOutcome::Retrying { attempts, next_attempt_at } => tracing::warn!(
            pending = %write.id,
            turn = %write.turn_id,
            attempts,
            next_attempt_at = %next_attempt_at,
            error,
            "memory write failed, will retry"
        ),
        FailureOutcome::ClaimLost => {}
    }
    Ok(outcome)
}

pub fn get_pending(conn: &Connection, id: &str) -> Result<Option<PendingWrite>> {
    let sql = format!("SELECT {PENDING_COLUMNS} FROM pending_memory_writes WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], pending_from_row).optional()?)
}

pub fn pending_for_turn(conn: &Connection, turn_id: &str) -> Result<Option<PendingWrite>> {
    let sql = format!("SELECT {PENDING_COLUMNS} FROM pending_memory_writes WHERE turn_id = ?1");
    Ok(conn.query_row(&sql, params![turn_id], pending_from_row).optional()?)
}

/// Rows with the given status (all rows for `None`), oldest first.
pub fn list_by_status(
    conn: &Connection,
    status: Option<PendingStatus>,
    limit: usize,
) -> Result<Vec<PendingWrite>> {
    let sql = format!(
        "SELECT {PENDING_COLUMNS} FROM pending_memory_writes \
         WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![status.map(|s| s.as_str()), limit as i64], pending_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Put an exhausted row back in the queue with a fresh attempt budget.
///
/// Returns `false` if the row does not exist or is not exhausted.
pub fn requeue(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE pending_memory_writes SET status = 'pending', attempts = 0, error = NULL, \
         next_attempt_at = ?1 WHERE id = ?2 AND status = 'exhausted'",
        params![format_ts(&now), id],
    )?;
    if rows == 0 {
        return Ok(false);
    }
    write_audit_log(conn, "requeue", id, None, now)?;
    tracing::info!(pending = id, "exhausted write requeued");
    Ok(true)
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub claimed: i64,
    pub exhausted: i64,
}

pub fn status_counts(conn: &Connection) -> Result<QueueCounts> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM pending_memory_writes GROUP BY status")?;
    let mut counts = QueueCounts::default();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (status, n) = row?;
        match status.as_str() {
            "pending" => counts.pending = n,
            "claimed" => counts.claimed = n,
            "exhausted" => counts.exhausted = n,
            _ => {}
        }
    }
    Ok(counts)
}
