//! Write path and lifecycle for long-term memories.
//!
//! [`insert_memories`] is the single insertion point. It writes one memory, or
//! one chunk group when given several pieces, together with their vectors and
//! an audit entry. It takes a plain `&Connection` so the writeback pipeline can
//! run it inside the same transaction that removes the pending row.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::embedding_to_bytes;
use super::types::{ChunkInfo, EmbeddedPiece, Memory, NewMemory, Visibility};
use crate::db::{format_ts, ts_column};

pub(crate) const MEMORY_COLUMNS: &str = "id, character_id, persona_id, channel_id, content, \
     chunk_group_id, chunk_index, total_chunks, visibility, is_locked, source_turn_id, metadata, created_at";

pub(crate) fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let group_id: Option<String> = row.get(5)?;
    let index: Option<u32> = row.get(6)?;
    let total: Option<u32> = row.get(7)?;
    let visibility: String = row.get(8)?;
    let metadata: Option<String> = row.get(11)?;
    Ok(Memory {
        id: row.get(0)?,
        character_id: row.get(1)?,
        persona_id: row.get(2)?,
        channel_id: row.get(3)?,
        content: row.get(4)?,
        chunk: match (group_id, index, total) {
            (Some(group_id), Some(index), Some(total)) => Some(ChunkInfo { group_id, index, total }),
            _ => None,
        },
        visibility: visibility.parse().unwrap_or(Visibility::Normal),
        is_locked: row.get(9)?,
        source_turn_id: row.get(10)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: ts_column(row, 12)?,
    })
}

/// Insert one memory (single piece) or a chunk group (several pieces).
///
/// Returns the new memory ids in chunk order. A second insert for the same
/// `source_turn_id` trips the unique index and fails.
pub fn insert_memories(
    conn: &Connection,
    new: &NewMemory,
    pieces: &[EmbeddedPiece],
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    if pieces.is_empty() {
        bail!("no content to store");
    }

    let total = pieces.len() as u32;
    let group_id = (total > 1).then(|| uuid::Uuid::now_v7().to_string());
    let metadata_json = new.metadata.as_ref().map(serde_json::to_string).transpose()?;
    let created_at = format_ts(&new.created_at.unwrap_or(now));

    let mut ids = Vec::with_capacity(pieces.len());
    for (index, piece) in pieces.iter().enumerate() {
        let id = uuid::Uuid::now_v7().to_string();
        let (chunk_index, total_chunks) = match group_id {
            Some(_) => (Some(index as u32), Some(total)),
            None => (None, None),
        };

        conn.execute(
            "INSERT INTO memories (id, character_id, persona_id, channel_id, content, \
             chunk_group_id, chunk_index, total_chunks, source_turn_id, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                new.character_id,
                new.persona_id,
                new.channel_id,
                piece.content,
                group_id,
                chunk_index,
                total_chunks,
                new.source_turn_id,
                metadata_json,
                created_at,
            ],
        )?;
        conn.execute(
            "INSERT INTO memory_vectors (memory_id, embedding) VALUES (?1, ?2)",
            params![id, embedding_to_bytes(&piece.embedding)],
        )?;
        ids.push(id);
    }

    let target = group_id.as_deref().unwrap_or(&ids[0]);
    write_audit_log(
        conn,
        "create",
        target,
        Some(&serde_json::json!({
            "chunks": total,
            "source_turn_id": new.source_turn_id,
        })),
        now,
    )?;

    Ok(ids)
}

/// Transactional wrapper around [`insert_memories`] for callers outside the
/// writeback pipeline.
pub fn store_memories(
    conn: &mut Connection,
    new: &NewMemory,
    pieces: &[EmbeddedPiece],
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let tx = conn.transaction()?;
    let ids = insert_memories(&tx, new, pieces, now)?;
    tx.commit()?;
    Ok(ids)
}

pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], memory_from_row).optional()?)
}

/// Every chunk of a group, ordered by `chunk_index`.
pub fn get_chunk_group(conn: &Connection, group_id: &str) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE chunk_group_id = ?1 ORDER BY chunk_index"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![group_id], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All memories, optionally for one character, in creation order with chunk
/// groups kept contiguous.
pub fn list_memories(conn: &Connection, character_id: Option<&str>) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE (?1 IS NULL OR character_id = ?1) \
         ORDER BY created_at, COALESCE(chunk_group_id, id), COALESCE(chunk_index, 0)"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![character_id], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Memories derived from one turn.
pub fn memories_for_turn(conn: &Connection, turn_id: &str) -> Result<Vec<Memory>> {
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories WHERE source_turn_id = ?1 ORDER BY COALESCE(chunk_index, 0)"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![turn_id], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `WHERE` fragment matching a memory and, if it is a chunk, its whole group.
const UNIT_FILTER: &str = "(id = ?1 OR (chunk_group_id IS NOT NULL AND chunk_group_id = \
     (SELECT chunk_group_id FROM memories WHERE id = ?1)))";

/// Hide or unhide a memory. Applies to the whole chunk group.
///
/// Returns the number of rows changed.
pub fn set_visibility(
    conn: &Connection,
    id: &str,
    visibility: Visibility,
    now: DateTime<Utc>,
) -> Result<usize> {
    let sql = format!("UPDATE memories SET visibility = ?2 WHERE {UNIT_FILTER}");
    let rows = conn.execute(&sql, params![id, visibility.as_str()])?;
    if rows > 0 {
        let op = match visibility {
            Visibility::Hidden => "hide",
            Visibility::Normal => "unhide",
        };
        write_audit_log(conn, op, id, None, now)?;
    }
    Ok(rows)
}

/// Lock or unlock a memory. Applies to the whole chunk group.
pub fn set_locked(conn: &Connection, id: &str, locked: bool, now: DateTime<Utc>) -> Result<usize> {
    let sql = format!("UPDATE memories SET is_locked = ?2 WHERE {UNIT_FILTER}");
    let rows = conn.execute(&sql, params![id, locked])?;
    if rows > 0 {
        write_audit_log(conn, if locked { "lock" } else { "unlock" }, id, None, now)?;
    }
    Ok(rows)
}

/// Outcome of [`forget_memory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForgetOutcome {
    Deleted { rows: usize },
    Locked,
    NotFound,
}

/// Physically delete a memory (and the rest of its chunk group).
///
/// Locked memories are refused.
pub fn forget_memory(conn: &mut Connection, id: &str, now: DateTime<Utc>) -> Result<ForgetOutcome> {
    let tx = conn.transaction()?;

    let locked: Option<bool> = tx
        .query_row(
            &format!("SELECT MAX(is_locked) FROM memories WHERE {UNIT_FILTER}"),
            params![id],
            |row| row.get(0),
        )?;
    match locked {
        None => return Ok(ForgetOutcome::NotFound),
        Some(true) => {
            tracing::info!(memory = id, "refusing to forget locked memory");
            return Ok(ForgetOutcome::Locked);
        }
        Some(false) => {}
    }

    let rows = tx.execute(&format!("DELETE FROM memories WHERE {UNIT_FILTER}"), params![id])?;
    write_audit_log(&tx, "delete", id, Some(&serde_json::json!({"rows": rows})), now)?;
    tx.commit()?;

    tracing::info!(memory = id, rows, "memory forgotten");
    Ok(ForgetOutcome::Deleted { rows })
}

/// Counts from [`purge_for_turns`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeCounts {
    pub purged: usize,
    pub locked_kept: usize,
}

/// Delete memories derived from the given turns, skipping locked ones.
///
/// Runs on the caller's connection so it can share a transaction.
pub fn purge_for_turns(
    conn: &Connection,
    turn_ids: &[String],
    now: DateTime<Utc>,
) -> Result<PurgeCounts> {
    let mut counts = PurgeCounts::default();
    for turn_id in turn_ids {
        counts.locked_kept += conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE source_turn_id = ?1 AND is_locked = 1",
            params![turn_id],
            |row| row.get::<_, usize>(0),
        )?;
        let purged = conn.execute(
            "DELETE FROM memories WHERE source_turn_id = ?1 AND is_locked = 0",
            params![turn_id],
        )?;
        if purged > 0 {
            write_audit_log(
                conn,
                "delete",
                turn_id,
                Some(&serde_json::json!({"reason": "hard_delete", "rows": purged})),
                now,
            )?;
        }
        counts.purged += purged;
    }
    Ok(counts)
}

/// Replace a memory's stored vector.
pub fn replace_embedding(conn: &Connection, id: &str, embedding: &[f32]) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_vectors (memory_id, embedding) VALUES (?1, ?2) \
         ON CONFLICT(memory_id) DO UPDATE SET embedding = excluded.embedding",
        params![id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    target_id: &str,
    details: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, target_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, target_id, details_json, format_ts(&now)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spike(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; crate::embedding::EMBEDDING_DIM];
        v[seed % crate::embedding::EMBEDDING_DIM] = 1.0;
        v
    }

    fn piece(content: &str, seed: usize) -> EmbeddedPiece {
        EmbeddedPiece { content: content.into(), embedding: spike(seed) }
    }

    fn owner(turn: Option<&str>) -> NewMemory {
        NewMemory {
            character_id: "char".into(),
            persona_id: "persona".into(),
            channel_id: Some("chan".into()),
            source_turn_id: turn.map(String::from),
            metadata: Some(serde_json::json!({"role": "user"})),
            created_at: None,
        }
    }

    #[test]
    fn single_piece_has_no_chunk_info() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let ids = store_memories(&mut conn, &owner(None), &[piece("likes tea", 1)], Utc::now()).unwrap();
        assert_eq!(ids.len(), 1);

        let memory = get_memory(&conn, &ids[0]).unwrap().unwrap();
        assert_eq!(memory.content, "likes tea");
        assert!(memory.chunk.is_none());
        assert_eq!(memory.visibility, Visibility::Normal);
        assert_eq!(memory.metadata, Some(serde_json::json!({"role": "user"})));

        let op: String = conn
            .query_row("SELECT operation FROM memory_log WHERE target_id = ?1", params![ids[0]], |row| row.get(0))
            .unwrap();
        assert_eq!(op, "create");
    }

    #[test]
    fn explicit_created_at_is_kept_for_every_chunk() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let original = Utc.with_ymd_and_hms(2025, 11, 3, 8, 30, 0).unwrap();
        let new = NewMemory { created_at: Some(original), ..owner(None) };
        let ids = store_memories(&mut conn, &new, &[piece("a", 1), piece("b", 2)], Utc::now()).unwrap();

        for id in &ids {
            assert_eq!(get_memory(&conn, id).unwrap().unwrap().created_at, original);
        }
    }

    #[test]
    fn chunk_group_is_consistent() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let pieces = [piece("one", 1), piece("two", 2), piece("three", 3)];
        let ids = store_memories(&mut conn, &owner(None), &pieces, Utc::now()).unwrap();

        let first = get_memory(&conn, &ids[0]).unwrap().unwrap();
        let group = first.chunk.clone().unwrap();
        let chunks = get_chunk_group(&conn, &group.group_id).unwrap();
        let contents: Vec<&str> = chunks.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert!(chunks.iter().all(|m| m.chunk.as_ref().unwrap().total == 3));
    }

    #[test]
    fn second_insert_for_same_turn_fails() {
        let mut conn = crate::db::open_memory_database().unwrap();
        conn.execute(
            "INSERT INTO conversation_turns (id, channel_id, character_id, persona_id, role, content, created_at) \
             VALUES ('t1', 'chan', 'char', 'persona', 'user', 'x', '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();
        store_memories(&mut conn, &owner(Some("t1")), &[piece("x", 1)], Utc::now()).unwrap();
        assert!(store_memories(&mut conn, &owner(Some("t1")), &[piece("x", 1)], Utc::now()).is_err());
        assert_eq!(memories_for_turn(&conn, "t1").unwrap().len(), 1);
    }

    #[test]
    fn locked_memory_cannot_be_forgotten() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let ids = store_memories(&mut conn, &owner(None), &[piece("keep", 1)], Utc::now()).unwrap();
        assert_eq!(set_locked(&conn, &ids[0], true, Utc::now()).unwrap(), 1);

        assert_eq!(forget_memory(&mut conn, &ids[0], Utc::now()).unwrap(), ForgetOutcome::Locked);
        assert!(get_memory(&conn, &ids[0]).unwrap().is_some());

        set_locked(&conn, &ids[0], false, Utc::now()).unwrap();
        assert_eq!(
            forget_memory(&mut conn, &ids[0], Utc::now()).unwrap(),
            ForgetOutcome::Deleted { rows: 1 }
        );
        let vectors: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_vectors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vectors, 0);
        assert_eq!(forget_memory(&mut conn, &ids[0], Utc::now()).unwrap(), ForgetOutcome::NotFound);
    }

    #[test]
    fn hiding_one_chunk_hides_the_group() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let ids = store_memories(&mut conn, &owner(None), &[piece("a", 1), piece("b", 2)], Utc::now()).unwrap();
        assert_eq!(set_visibility(&conn, &ids[1], Visibility::Hidden, Utc::now()).unwrap(), 2);
        let first = get_memory(&conn, &ids[0]).unwrap().unwrap();
        assert_eq!(first.visibility, Visibility::Hidden);
    }
}
