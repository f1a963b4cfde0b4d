//! User personas and their long-term memory sharing policy.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::{format_ts, ts_column};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// When set, memories formed under any of the user's personas are visible
    /// to this one (for the same character).
    pub share_ltm_across_personas: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert a persona or update its name and sharing flag. `created_at` is kept
/// from the first insert.
pub fn upsert_persona(
    conn: &Connection,
    id: &str,
    user_id: &str,
    name: &str,
    share_ltm_across_personas: bool,
    now: DateTime<Utc>,
) -> Result<Persona> {
    conn.execute(
        "INSERT INTO personas (id, user_id, name, share_ltm_across_personas, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, name = excluded.name, \
         share_ltm_across_personas = excluded.share_ltm_across_personas",
        params![id, user_id, name, share_ltm_across_personas, format_ts(&now)],
    )?;
    get_persona(conn, id)?.ok_or_else(|| anyhow::anyhow!("persona {id} vanished after upsert"))
}

pub fn get_persona(conn: &Connection, id: &str) -> Result<Option<Persona>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, name, share_ltm_across_personas, created_at \
             FROM personas WHERE id = ?1",
            params![id],
            |row| {
                Ok(Persona {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    share_ltm_across_personas: row.get(3)?,
                    created_at: ts_column(row, 4)?,
                })
            },
        )
        .optional()?)
}

/// Persona ids whose memories are visible to `persona_id`.
///
/// Unknown personas, and personas that do not share, see only themselves.
pub fn memory_owners(conn: &Connection, persona_id: &str) -> Result<Vec<String>> {
    let persona = match get_persona(conn, persona_id)? {
        Some(p) if p.share_ltm_across_personas => p,
        _ => return Ok(vec![persona_id.to_string()]),
    };
    let mut stmt = conn.prepare("SELECT id FROM personas WHERE user_id = ?1 ORDER BY id")?;
    let mut ids = stmt
        .query_map(params![persona.user_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if !ids.iter().any(|id| id == persona_id) {
        ids.push(persona_id.to_string());
    }
    Ok(ids)
}
