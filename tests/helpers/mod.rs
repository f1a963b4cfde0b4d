#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use recollect::db;
use recollect::embedding::{EmbeddingError, EmbeddingProvider, EMBEDDING_DIM};
use recollect::history::store::append_turn;
use recollect::history::{ConversationScope, ConversationTurn, Role, TurnEvent};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();
    db::migrations::run_migrations(&conn).unwrap();
    conn
}

/// An on-disk database for tests that need several connections.
/// Keep the `TempDir` alive for the duration of the test.
pub fn file_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("recollect.db");
    db::open_database(&path).unwrap();
    (dir, path)
}

/// Fixed base instant so timestamps in assertions are stable.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

/// Generate a deterministic 384-dim embedding with a spike at position `seed`.
/// Each seed produces a distinct, orthogonal vector.
pub fn test_embedding(seed: u8) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[seed as usize % EMBEDDING_DIM] = 1.0;
    v
}

/// Embeds text as a spike keyed by its first byte, and counts calls.
/// Texts with the same first letter are identical vectors (score 1.0);
/// different first letters are orthogonal (score 0.0).
#[derive(Default)]
pub struct CountingEmbedder {
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for CountingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".into()));
        }
        Ok(test_embedding(text.as_bytes()[0]))
    }
}

/// Always fails with a transient error.
pub struct DownEmbedder;

impl EmbeddingProvider for DownEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Timeout("provider unreachable".into()))
    }
}

pub fn scope(persona: &str) -> ConversationScope {
    ConversationScope::new("general", "aria", persona)
}

pub fn user_turn(scope: &ConversationScope, content: &str) -> TurnEvent {
    TurnEvent {
        scope: scope.clone(),
        role: Role::User,
        content: content.into(),
        attachments: vec![],
        external_message_refs: vec![],
    }
}

/// Record a user turn at `at`.
pub fn record(conn: &mut Connection, scope: &ConversationScope, content: &str, at: DateTime<Utc>) -> ConversationTurn {
    append_turn(conn, &user_turn(scope, content), at).unwrap()
}

pub fn count(conn: &Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |row| row.get(0)).unwrap()
}
