//! Similarity retrieval of long-term memories.
//!
//! A query is embedded once and compared against every stored vector owned by
//! the (character, persona) scope with sqlite-vec's `vec_distance_cosine`.
//! Chunks of one group compete as a single unit (best chunk wins) and are
//! reassembled in `chunk_index` order before being returned.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use super::embedding_to_bytes;
use super::store::{get_chunk_group, get_memory};
use super::types::{Memory, Visibility};
use crate::db::format_ts;
use crate::embedding::EmbeddingProvider;
use crate::error::{CoreError, CoreResult};
use crate::settings::ResolvedSettings;

// ── Public types ──────────────────────────────────────────────────────────────

/// What to retrieve memories for.
#[derive(Debug, Clone)]
pub struct MemoryQuery<'a> {
    pub character_id: &'a str,
    pub persona_id: &'a str,
    pub query_text: &'a str,
    /// Only memories created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

/// Ownership filter for a vector search.
#[derive(Debug, Clone)]
pub struct SearchScope {
    pub character_id: String,
    /// Personas whose memories are visible. Never empty.
    pub persona_ids: Vec<String>,
    pub created_before: Option<DateTime<Utc>>,
}

/// A retrieved memory; chunk groups are returned whole.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    /// Id of the best-matching row (a chunk, for groups).
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_group_id: Option<String>,
    /// Full content; chunks joined in order.
    pub content: String,
    /// Cosine similarity of the best-matching row, `1 - distance`.
    pub score: f64,
    pub chunk_count: usize,
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_turn_id: Option<String>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Retrieve memories relevant to `query` under the resolved settings.
///
/// Returns nothing without touching the embedder when `memoryLimit` is 0 or
/// focus mode is on. Any failure is logged and yields no memories.
pub fn retrieve_memories(
    conn: &Connection,
    embedder: &dyn EmbeddingProvider,
    query: &MemoryQuery<'_>,
    settings: &ResolvedSettings,
) -> Vec<RetrievedMemory> {
    if !settings.retrieval_enabled() {
        tracing::debug!(
            character = query.character_id,
            persona = query.persona_id,
            memory_limit = settings.memory_limit,
            focus = settings.focus_mode_enabled,
            "memory retrieval skipped"
        );
        return Vec::new();
    }
    if query.query_text.trim().is_empty() {
        return Vec::new();
    }

    match try_retrieve_memories(conn, embedder, query, settings) {
        Ok(memories) => {
            tracing::debug!(
                character = query.character_id,
                persona = query.persona_id,
                count = memories.len(),
                "memories retrieved"
            );
            memories
        }
        Err(e) => {
            tracing::warn!(
                character = query.character_id,
                persona = query.persona_id,
                error = %e,
                "memory retrieval failed, continuing without memories"
            );
            Vec::new()
        }
    }
}

/// Fallible core of [`retrieve_memories`].
pub fn try_retrieve_memories(
    conn: &Connection,
    embedder: &dyn EmbeddingProvider,
    query: &MemoryQuery<'_>,
    settings: &ResolvedSettings,
) -> CoreResult<Vec<RetrievedMemory>> {
    let embedding = embedder
        .embed(query.query_text)
        .map_err(|e| CoreError::TransientRetrieval(e.to_string()))?;
    retrieve_with_embedding(conn, &embedding, query, settings)
}

/// Retrieval for a query that has already been embedded.
pub fn retrieve_with_embedding(
    conn: &Connection,
    embedding: &[f32],
    query: &MemoryQuery<'_>,
    settings: &ResolvedSettings,
) -> CoreResult<Vec<RetrievedMemory>> {
    let scope = SearchScope {
        character_id: query.character_id.to_string(),
        persona_ids: crate::persona::memory_owners(conn, query.persona_id)
            .map_err(|e| CoreError::TransientRetrieval(e.to_string()))?,
        created_before: query.created_before,
    };

    search_similar(
        conn,
        embedding,
        &scope,
        settings.memory_score_threshold,
        settings.memory_limit as usize,
    )
    .map_err(|e| CoreError::TransientRetrieval(e.to_string()))
}

/// Scope-restricted vector search over visible memories.
///
/// Scores below `threshold` are dropped; at most `limit` units (single
/// memories or whole chunk groups) are returned, best first.
pub fn search_similar(
    conn: &Connection,
    embedding: &[f32],
    scope: &SearchScope,
    threshold: f64,
    limit: usize,
) -> Result<Vec<RetrievedMemory>> {
    if limit == 0 || scope.persona_ids.is_empty() {
        return Ok(Vec::new());
    }

    let persona_slots = vec!["?"; scope.persona_ids.len()].join(", ");
    let sql = format!(
        "SELECT unit, MAX(score) AS best, id FROM ( \
             SELECT COALESCE(m.chunk_group_id, m.id) AS unit, m.id AS id, \
                    1.0 - vec_distance_cosine(v.embedding, ?) AS score \
             FROM memories m JOIN memory_vectors v ON v.memory_id = m.id \
             WHERE m.character_id = ? \
               AND m.visibility = 'normal' \
               AND (? IS NULL OR m.created_at < ?) \
               AND m.persona_id IN ({persona_slots}) \
         ) \
         GROUP BY unit \
         HAVING best >= ? \
         ORDER BY best DESC, unit \
         LIMIT ?"
    );

    let cutoff = match scope.created_before {
        Some(ts) => Value::Text(format_ts(&ts)),
        None => Value::Null,
    };
    let mut bind: Vec<Value> = vec![
        Value::Blob(embedding_to_bytes(embedding).to_vec()),
        Value::Text(scope.character_id.clone()),
        cutoff.clone(),
        cutoff,
    ];
    bind.extend(scope.persona_ids.iter().cloned().map(Value::Text));
    bind.push(Value::Real(threshold));
    bind.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let hits: Vec<(String, f64, String)> = stmt
        .query_map(params_from_iter(bind), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut results = Vec::with_capacity(hits.len());
    for (unit, score, id) in hits {
        let rows = if unit == id {
            get_memory(conn, &id)?.into_iter().collect()
        } else {
            get_chunk_group(conn, &unit)?
        };
        if let Some(memory) = assemble(rows, id, score) {
            results.push(memory);
        }
    }
    Ok(results)
}

// ── Internals ─────────────────────────────────────────────────────────────────

/// Join a unit's rows (already in chunk order) into one result.
fn assemble(rows: Vec<Memory>, id: String, score: f64) -> Option<RetrievedMemory> {
    let rows: Vec<Memory> = rows
        .into_iter()
        .filter(|m| m.visibility == Visibility::Normal)
        .collect();
    let first = rows.first()?;

    Some(RetrievedMemory {
        chunk_group_id: first.chunk.as_ref().map(|c| c.group_id.clone()),
        content: rows.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n"),
        score,
        chunk_count: rows.len(),
        is_locked: rows.iter().any(|m| m.is_locked),
        created_at: first.created_at,
        source_turn_id: first.source_turn_id.clone(),
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingError, EMBEDDING_DIM};
    use crate::memory::store::{set_locked, set_visibility, store_memories};
    use crate::memory::types::{EmbeddedPiece, NewMemory};
    use crate::settings::resolver::resolve_layers;
    use crate::settings::{HardcodedDefaults, LayerSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spike(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[seed % EMBEDDING_DIM] = 1.0;
        v
    }

    /// Mostly `seed`, a little of `other`.
    fn blend(seed: usize, other: usize, weight: f32) -> Vec<f32> {
        let mut v = spike(seed);
        v[other % EMBEDDING_DIM] = weight;
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    struct SpikeEmbedder {
        seed: usize,
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for SpikeEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(spike(self.seed))
        }
    }

    fn settings(limit: u32, threshold: f64, focus: bool) -> ResolvedSettings {
        let hardcoded = HardcodedDefaults {
            memory_limit: limit,
            memory_score_threshold: threshold,
            focus_mode_enabled: focus,
            ..Default::default()
        };
        resolve_layers(&hardcoded, &LayerSet::default())
    }

    fn owner(persona: &str) -> NewMemory {
        NewMemory {
            character_id: "char".into(),
            persona_id: persona.into(),
            ..Default::default()
        }
    }

    fn store(conn: &mut Connection, persona: &str, pieces: &[(&str, Vec<f32>)]) -> Vec<String> {
        let pieces: Vec<EmbeddedPiece> = pieces
            .iter()
            .map(|(c, e)| EmbeddedPiece { content: c.to_string(), embedding: e.clone() })
            .collect();
        store_memories(conn, &owner(persona), &pieces, Utc::now()).unwrap()
    }

    fn query<'a>(persona: &'a str) -> MemoryQuery<'a> {
        MemoryQuery {
            character_id: "char",
            persona_id: persona,
            query_text: "what do they drink?",
            created_before: None,
        }
    }

    #[test]
    fn zero_limit_never_calls_embedder() {
        let conn = crate::db::open_memory_database().unwrap();
        let embedder = SpikeEmbedder { seed: 1, calls: AtomicUsize::new(0) };
        assert!(retrieve_memories(&conn, &embedder, &query("p"), &settings(0, 0.0, false)).is_empty());
        assert!(retrieve_memories(&conn, &embedder, &query("p"), &settings(5, 0.0, true)).is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn threshold_and_limit_apply() {
        let mut conn = crate::db::open_memory_database().unwrap();
        store(&mut conn, "p", &[("exact", spike(1))]);
        store(&mut conn, "p", &[("close", blend(1, 2, 0.3))]);
        store(&mut conn, "p", &[("unrelated", spike(50))]);

        let embedder = SpikeEmbedder { seed: 1, calls: AtomicUsize::new(0) };
        let hits = retrieve_memories(&conn, &embedder, &query("p"), &settings(10, 0.5, false));
        let contents: Vec<&str> = hits.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["exact", "close"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        let hits = retrieve_memories(&conn, &embedder, &query("p"), &settings(1, 0.5, false));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "exact");
    }

    #[test]
    fn hidden_excluded_locked_included() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let hidden = store(&mut conn, "p", &[("hidden", spike(1))]);
        let locked = store(&mut conn, "p", &[("locked", spike(1))]);
        set_visibility(&conn, &hidden[0], Visibility::Hidden, Utc::now()).unwrap();
        set_locked(&conn, &locked[0], true, Utc::now()).unwrap();

        let embedder = SpikeEmbedder { seed: 1, calls: AtomicUsize::new(0) };
        let hits = retrieve_memories(&conn, &embedder, &query("p"), &settings(10, 0.5, false));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "locked");
        assert!(hits[0].is_locked);
    }

    #[test]
    fn chunk_group_counts_once_and_reassembles_in_order() {
        let mut conn = crate::db::open_memory_database().unwrap();
        // The last chunk matches best; output must still be in chunk order.
        store(
            &mut conn,
            "p",
            &[("part one", blend(1, 3, 1.0)), ("part two", blend(1, 4, 0.8)), ("part three", spike(1))],
        );
        store(&mut conn, "p", &[("single", blend(1, 5, 0.5))]);

        let embedder = SpikeEmbedder { seed: 1, calls: AtomicUsize::new(0) };
        let hits = retrieve_memories(&conn, &embedder, &query("p"), &settings(2, 0.5, false));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "part one\npart two\npart three");
        assert_eq!(hits[0].chunk_count, 3);
        assert!(hits[0].chunk_group_id.is_some());
        assert_eq!(hits[1].content, "single");
    }

    #[test]
    fn scope_is_character_and_persona() {
        let mut conn = crate::db::open_memory_database().unwrap();
        store(&mut conn, "mine", &[("mine", spike(1))]);
        store(&mut conn, "theirs", &[("theirs", spike(1))]);
        store_memories(
            &mut conn,
            &NewMemory { character_id: "other-char".into(), persona_id: "mine".into(), ..Default::default() },
            &[EmbeddedPiece { content: "other character".into(), embedding: spike(1) }],
            Utc::now(),
        )
        .unwrap();

        let embedder = SpikeEmbedder { seed: 1, calls: AtomicUsize::new(0) };
        let hits = retrieve_memories(&conn, &embedder, &query("mine"), &settings(10, 0.5, false));
        let contents: Vec<&str> = hits.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["mine"]);
    }

    #[test]
    fn shared_persona_sees_siblings() {
        let mut conn = crate::db::open_memory_database().unwrap();
        crate::persona::upsert_persona(&conn, "a", "user", "A", true, Utc::now()).unwrap();
        crate::persona::upsert_persona(&conn, "b", "user", "B", false, Utc::now()).unwrap();
        store(&mut conn, "a", &[("from a", spike(1))]);
        store(&mut conn, "b", &[("from b", spike(1))]);

        let embedder = SpikeEmbedder { seed: 1, calls: AtomicUsize::new(0) };
        let hits = retrieve_memories(&conn, &embedder, &query("a"), &settings(10, 0.5, false));
        assert_eq!(hits.len(), 2);
        let hits = retrieve_memories(&conn, &embedder, &query("b"), &settings(10, 0.5, false));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn storage_error_degrades_to_empty() {
        let conn = crate::db::open_memory_database().unwrap();
        conn.execute_batch("DROP TABLE memory_vectors").unwrap();
        let embedder = SpikeEmbedder { seed: 1, calls: AtomicUsize::new(0) };
        assert!(retrieve_memories(&conn, &embedder, &query("p"), &settings(10, 0.5, false)).is_empty());
    }
}
