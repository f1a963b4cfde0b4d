//! Clear, undo, and hard delete.
//!
//! These reconcile short-term history with the writeback queue and long-term
//! memory. Clear only hides history. Undo removes recent turns and cancels
//! their memory writes if they have not committed. Hard delete physically
//! removes history and can optionally purge derived memories.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ToSql, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::db::format_ts;
use crate::history::store::{insert_tombstone, latest_tombstone, visible_turns, TurnWindow};
use crate::history::ConversationScope;
use crate::memory::store::{purge_for_turns, PurgeCounts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearResult {
    pub tombstone_id: String,
    /// Turns that were visible and now are not.
    pub turns_hidden: usize,
}

/// Hide everything in `scope` up to `now`. Memories are untouched.
pub fn clear(conn: &mut Connection, scope: &ConversationScope, now: DateTime<Utc>) -> Result<ClearResult> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let boundary = latest_tombstone(&tx, scope)?.map(|t| format_ts(&t.deleted_at));
    let turns_hidden: usize = tx.query_row(
        "SELECT COUNT(*) FROM conversation_turns \
         WHERE channel_id = ?1 AND character_id = ?2 AND persona_id = ?3 \
           AND deleted_at IS NULL AND created_at <= ?4 \
           AND (?5 IS NULL OR created_at > ?5)",
        params![
            scope.channel_id,
            scope.character_id,
            scope.persona_id,
            format_ts(&now),
            boundary,
        ],
        |row| row.get(0),
    )?;
    let tombstone = insert_tombstone(&tx, scope, now)?;
    tx.commit()?;

    tracing::info!(scope = %scope, turns_hidden, "history cleared");
    Ok(ClearResult {
        tombstone_id: tombstone.id,
        turns_hidden,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UndoResult {
    /// Turns removed together with their uncommitted (pending, claimed or
    /// exhausted) memory write.
    pub turns_removed: usize,
    /// Turns whose memory was already committed; marked deleted and kept for
    /// provenance.
    pub turns_marked_deleted: usize,
    pub turn_ids: Vec<String>,
}

/// Undo the `n` most recent visible turns in `scope`.
pub fn undo(
    conn: &mut Connection,
    scope: &ConversationScope,
    n: usize,
    now: DateTime<Utc>,
) -> Result<UndoResult> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let window = TurnWindow {
        after: latest_tombstone(&tx, scope)?.map(|t| t.deleted_at),
        not_before: None,
        limit: n,
    };
    let turns = visible_turns(&tx, scope, &window)?;

    let mut result = UndoResult::default();
    for turn in &turns {
        let cancelled = tx.execute(
            "DELETE FROM pending_memory_writes WHERE turn_id = ?1",
            params![turn.id],
        )?;
        if cancelled > 0 {
            tx.execute("DELETE FROM conversation_turns WHERE id = ?1", params![turn.id])?;
            result.turns_removed += 1;
        } else {
            tx.execute(
                "UPDATE conversation_turns SET deleted_at = ?1 WHERE id = ?2",
                params![format_ts(&now), turn.id],
            )?;
            result.turns_marked_deleted += 1;
        }
        result.turn_ids.push(turn.id.clone());
    }
    tx.commit()?;

    tracing::info!(
        scope = %scope,
        requested = n,
        removed = result.turns_removed,
        marked_deleted = result.turns_marked_deleted,
        "turns undone"
    );
    Ok(result)
}

/// What a hard delete covers. `persona_id: None` means every persona in the
/// channel for that character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardDeleteTarget {
    pub character_id: String,
    pub channel_id: String,
    pub persona_id: Option<String>,
}

const TARGET_FILTER: &str =
    "channel_id = ?1 AND character_id = ?2 AND (?3 IS NULL OR persona_id = ?3)";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HardDeleteResult {
    pub turns_deleted: usize,
    pub pending_deleted: usize,
    pub tombstones_inserted: usize,
    pub memories_purged: usize,
    pub locked_memories_kept: usize,
}

/// Physically delete history for the target and cover it with tombstones.
///
/// Derived memories are purged only when `purge_memories` is set, and locked
/// memories survive even then.
pub fn hard_delete(
    conn: &mut Connection,
    target: &HardDeleteTarget,
    purge_memories: bool,
    now: DateTime<Utc>,
) -> Result<HardDeleteResult> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let key: &[&dyn ToSql] = &[&target.channel_id, &target.character_id, &target.persona_id];

    let turn_ids: Vec<String> = {
        let mut stmt = tx.prepare(&format!("SELECT id FROM conversation_turns WHERE {TARGET_FILTER}"))?;
        let ids = stmt
            .query_map(key, |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    // Tombstone every scope the target touches, including scopes whose turns
    // are all gone already, so nothing older can reappear.
    let personas: Vec<String> = match &target.persona_id {
        Some(p) => vec![p.clone()],
        None => {
            let mut stmt = tx.prepare(
                "SELECT persona_id FROM conversation_turns WHERE channel_id = ?1 AND character_id = ?2 \
                 UNION SELECT persona_id FROM tombstones WHERE channel_id = ?1 AND character_id = ?2",
            )?;
            let ids = stmt
                .query_map(params![target.channel_id, target.character_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        }
    };
    for persona_id in &personas {
        let scope = ConversationScope::new(&target.channel_id, &target.character_id, persona_id);
        insert_tombstone(&tx, &scope, now)?;
    }

    let pending_deleted = tx.execute(
        &format!(
            "DELETE FROM pending_memory_writes WHERE turn_id IN \
             (SELECT id FROM conversation_turns WHERE {TARGET_FILTER})"
        ),
        key,
    )?;
    let turns_deleted = tx.execute(
        &format!("DELETE FROM conversation_turns WHERE {TARGET_FILTER}"),
        key,
    )?;

    let purge = if purge_memories {
        purge_for_turns(&tx, &turn_ids, now)?
    } else {
        PurgeCounts::default()
    };
    tx.commit()?;

    let result = HardDeleteResult {
        turns_deleted,
        pending_deleted,
        tombstones_inserted: personas.len(),
        memories_purged: purge.purged,
        locked_memories_kept: purge.locked_kept,
    };
    tracing::info!(
        character = %target.character_id,
        channel = %target.channel_id,
        persona = target.persona_id.as_deref().unwrap_or("*"),
        turns = result.turns_deleted,
        pending = result.pending_deleted,
        memories_purged = result.memories_purged,
        "hard delete complete"
    );
    Ok(result)
}
