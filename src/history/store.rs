//! Persistence for turns and tombstones.
//!
//! Turns are append-only apart from the edit/delete markers. Tombstones are
//! never updated; a newer tombstone supersedes an older one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{ConversationScope, ConversationTurn, Tombstone, TurnEvent};
use crate::db::{format_ts, opt_ts_column, ts_column};

const TURN_COLUMNS: &str = "id, channel_id, character_id, persona_id, role, content, \
     attachments, external_refs, created_at, edited_at, deleted_at";

fn turn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationTurn> {
    let role: String = row.get(4)?;
    let attachments: String = row.get(6)?;
    let external_refs: String = row.get(7)?;
    Ok(ConversationTurn {
        id: row.get(0)?,
        scope: ConversationScope {
            channel_id: row.get(1)?,
            character_id: row.get(2)?,
            persona_id: row.get(3)?,
        },
        role: role.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        content: row.get(5)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        external_message_refs: serde_json::from_str(&external_refs).unwrap_or_default(),
        created_at: ts_column(row, 8)?,
        edited_at: opt_ts_column(row, 9)?,
        deleted_at: opt_ts_column(row, 10)?,
    })
}

/// Persist a completed turn and enqueue its memory write in one transaction.
///
/// Either both rows exist afterwards or neither does, so a turn can never be
/// left without its pending write (or vice versa).
pub fn append_turn(
    conn: &mut Connection,
    event: &TurnEvent,
    now: DateTime<Utc>,
) -> Result<ConversationTurn> {
    let tx = conn.transaction()?;

    let turn = ConversationTurn {
        id: uuid::Uuid::now_v7().to_string(),
        scope: event.scope.clone(),
        role: event.role,
        content: event.content.clone(),
        attachments: event.attachments.clone(),
        external_message_refs: event.external_message_refs.clone(),
        created_at: now,
        edited_at: None,
        deleted_at: None,
    };

    tx.execute(
        "INSERT INTO conversation_turns \
         (id, channel_id, character_id, persona_id, role, content, attachments, external_refs, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            turn.id,
            turn.scope.channel_id,
            turn.scope.character_id,
            turn.scope.persona_id,
            turn.role.as_str(),
            turn.content,
            serde_json::to_string(&turn.attachments)?,
            serde_json::to_string(&turn.external_message_refs)?,
            format_ts(&now),
        ],
    )?;

    let metadata = serde_json::json!({
        "role": turn.role.as_str(),
        "turn_created_at": format_ts(&now),
    });
    crate::writeback::queue::enqueue(&tx, &turn, &metadata, now)
        .context("failed to enqueue memory write")?;

    tx.commit()?;

    tracing::debug!(turn = %turn.id, scope = %turn.scope, role = %turn.role, "turn recorded");
    Ok(turn)
}

/// Fetch a turn by id regardless of deletion state.
pub fn get_turn(conn: &Connection, turn_id: &str) -> Result<Option<ConversationTurn>> {
    let sql = format!("SELECT {TURN_COLUMNS} FROM conversation_turns WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![turn_id], turn_from_row)
        .optional()?)
}

/// Replace a turn's content and stamp `edited_at`.
///
/// If the turn's memory write has not been claimed yet its text follows the
/// edit; once claimed or committed, the memory keeps the original wording.
/// Returns `false` if the turn does not exist or was deleted.
pub fn edit_turn(
    conn: &mut Connection,
    turn_id: &str,
    content: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let tx = conn.transaction()?;
    let updated = tx.execute(
        "UPDATE conversation_turns SET content = ?1, edited_at = ?2 \
         WHERE id = ?3 AND deleted_at IS NULL",
        params![content, format_ts(&now), turn_id],
    )?;
    if updated == 0 {
        return Ok(false);
    }
    let pending = tx.execute(
        "UPDATE pending_memory_writes SET text = ?1 WHERE turn_id = ?2 AND status = 'pending'",
        params![content, turn_id],
    )?;
    tx.commit()?;

    tracing::debug!(turn = turn_id, pending_updated = pending > 0, "turn edited");
    Ok(true)
}

/// Most recent tombstone for the scope, if any.
pub fn latest_tombstone(conn: &Connection, scope: &ConversationScope) -> Result<Option<Tombstone>> {
    Ok(conn
        .query_row(
            "SELECT id, deleted_at FROM tombstones \
             WHERE channel_id = ?1 AND character_id = ?2 AND persona_id = ?3 \
             ORDER BY deleted_at DESC LIMIT 1",
            params![scope.channel_id, scope.character_id, scope.persona_id],
            |row| {
                Ok(Tombstone {
                    id: row.get(0)?,
                    scope: scope.clone(),
                    deleted_at: ts_column(row, 1)?,
                })
            },
        )
        .optional()?)
}

/// Append a tombstone at `at`.
pub fn insert_tombstone(
    conn: &Connection,
    scope: &ConversationScope,
    at: DateTime<Utc>,
) -> Result<Tombstone> {
    let tombstone = Tombstone {
        id: uuid::Uuid::now_v7().to_string(),
        scope: scope.clone(),
        deleted_at: at,
    };
    conn.execute(
        "INSERT INTO tombstones (id, channel_id, character_id, persona_id, deleted_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            tombstone.id,
            scope.channel_id,
            scope.character_id,
            scope.persona_id,
            format_ts(&at),
        ],
    )?;
    Ok(tombstone)
}

/// Window over the visible turns of a scope.
#[derive(Debug, Clone, Default)]
pub struct TurnWindow {
    /// Only turns created strictly after this instant (the tombstone boundary).
    pub after: Option<DateTime<Utc>>,
    /// Only turns created at or after this instant (the age cutoff).
    pub not_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Non-deleted turns in the window, newest first.
pub fn visible_turns(
    conn: &Connection,
    scope: &ConversationScope,
    window: &TurnWindow,
) -> Result<Vec<ConversationTurn>> {
    if window.limit == 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {TURN_COLUMNS} FROM conversation_turns \
         WHERE channel_id = ?1 AND character_id = ?2 AND persona_id = ?3 \
           AND deleted_at IS NULL \
           AND (?4 IS NULL OR created_at > ?4) \
           AND (?5 IS NULL OR created_at >= ?5) \
         ORDER BY created_at DESC, rowid DESC \
         LIMIT ?6"
    );
    let mut stmt = conn.prepare(&sql)?;
    let turns = stmt
        .query_map(
            params![
                scope.channel_id,
                scope.character_id,
                scope.persona_id,
                window.after.as_ref().map(format_ts),
                window.not_before.as_ref().map(format_ts),
                window.limit as i64,
            ],
            turn_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(turns)
}
