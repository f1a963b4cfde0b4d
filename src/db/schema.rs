//! SQL DDL for all tables.
//!
//! History lives in `conversation_turns` and `tombstones`; the writeback queue
//! in `pending_memory_writes`; long-term memory in `memories` with one vector per
//! row in `memory_vectors`. `settings_overrides` backs the precedence store.
//! All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Short-term history
CREATE TABLE IF NOT EXISTS conversation_turns (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    character_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user','assistant','system')),
    content TEXT NOT NULL,
    attachments TEXT NOT NULL DEFAULT '[]',
    external_refs TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    edited_at TEXT,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_turns_scope_time
    ON conversation_turns(channel_id, character_id, persona_id, created_at);

CREATE TABLE IF NOT EXISTS tombstones (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    character_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    deleted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tombstones_scope_time
    ON tombstones(channel_id, character_id, persona_id, deleted_at);

CREATE TABLE IF NOT EXISTS personas (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    share_ltm_across_personas INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_personas_user ON personas(user_id);

-- Writeback queue: at most one pending write per turn
CREATE TABLE IF NOT EXISTS pending_memory_writes (
    id TEXT PRIMARY KEY,
    turn_id TEXT NOT NULL UNIQUE REFERENCES conversation_turns(id) ON DELETE CASCADE,
    channel_id TEXT NOT NULL,
    character_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT,
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','claimed','exhausted')),
    claim_token TEXT,
    claimed_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    next_attempt_at TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_status_due
    ON pending_memory_writes(status, next_attempt_at);

-- Long-term memory
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    character_id TEXT NOT NULL,
    persona_id TEXT NOT NULL,
    channel_id TEXT,
    content TEXT NOT NULL,
    chunk_group_id TEXT,
    chunk_index INTEGER,
    total_chunks INTEGER,
    visibility TEXT NOT NULL DEFAULT 'normal' CHECK(visibility IN ('normal','hidden')),
    is_locked INTEGER NOT NULL DEFAULT 0,
    source_turn_id TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    CHECK((chunk_group_id IS NULL) = (chunk_index IS NULL)),
    CHECK((chunk_index IS NULL) = (total_chunks IS NULL)),
    CHECK(chunk_index IS NULL OR (chunk_index >= 0 AND chunk_index < total_chunks))
);

CREATE INDEX IF NOT EXISTS idx_memories_owner ON memories(character_id, persona_id);
CREATE INDEX IF NOT EXISTS idx_memories_group ON memories(chunk_group_id);

-- One memory (or one chunk per index) per source turn, ever.
CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_turn_chunk
    ON memories(source_turn_id, COALESCE(chunk_index, 0))
    WHERE source_turn_id IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_group_chunk
    ON memories(chunk_group_id, chunk_index)
    WHERE chunk_group_id IS NOT NULL;

-- Raw f32 vectors, compared with sqlite-vec's vec_distance_cosine()
CREATE TABLE IF NOT EXISTS memory_vectors (
    memory_id TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL
);

-- Settings cascade (the hardcoded tier lives in code/config, not here)
CREATE TABLE IF NOT EXISTS settings_overrides (
    tier TEXT NOT NULL CHECK(tier IN ('admin','character-default','user-default','user-per-character')),
    user_id TEXT NOT NULL DEFAULT '',
    character_id TEXT NOT NULL DEFAULT '',
    overrides TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (tier, user_id, character_id)
);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','delete','hide','unhide','lock','unlock','exhaust','requeue')),
    target_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
