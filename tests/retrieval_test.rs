mod helpers;

use helpers::{t0, test_embedding, CountingEmbedder, DownEmbedder};
use recollect::memory::embedding_to_bytes;
use recollect::memory::retrieval::{retrieve_memories, MemoryQuery};
use recollect::memory::store::store_memories;
use recollect::memory::types::{EmbeddedPiece, NewMemory};
use recollect::persona::upsert_persona;
use recollect::settings::resolver::resolve_layers;
use recollect::settings::{HardcodedDefaults, LayerSet, ResolvedSettings};
use rusqlite::params;

fn settings(limit: u32) -> ResolvedSettings {
    let mut s = resolve_layers(&HardcodedDefaults::default(), &LayerSet::default());
    s.memory_limit = limit;
    s.memory_score_threshold = 0.5;
    s
}

fn query<'a>(persona: &'a str, text: &'a str) -> MemoryQuery<'a> {
    MemoryQuery {
        character_id: "aria",
        persona_id: persona,
        query_text: text,
        created_before: None,
    }
}

/// Store one memory whose vector matches queries starting with `content`'s first letter.
fn remember(conn: &mut rusqlite::Connection, persona: &str, content: &str) -> String {
    let new = NewMemory {
        character_id: "aria".into(),
        persona_id: persona.into(),
        ..NewMemory::default()
    };
    let piece = EmbeddedPiece {
        content: content.into(),
        embedding: test_embedding(content.as_bytes()[0]),
    };
    store_memories(conn, &new, &[piece], t0()).unwrap().remove(0)
}

#[test]
fn zero_memory_limit_never_embeds() {
    let mut conn = helpers::test_db();
    remember(&mut conn, "p1", "kiwis are great");
    let embedder = CountingEmbedder::default();

    let found = retrieve_memories(&conn, &embedder, &query("p1", "kiwi?"), &settings(0));
    assert!(found.is_empty());
    assert_eq!(embedder.calls(), 0);
}

#[test]
fn focus_mode_never_embeds() {
    let mut conn = helpers::test_db();
    remember(&mut conn, "p1", "kiwis are great");
    let embedder = CountingEmbedder::default();
    let mut s = settings(5);
    s.focus_mode_enabled = true;

    assert!(retrieve_memories(&conn, &embedder, &query("p1", "kiwi?"), &s).is_empty());
    assert_eq!(embedder.calls(), 0);
}

#[test]
fn matches_above_threshold_within_scope() {
    let mut conn = helpers::test_db();
    remember(&mut conn, "p1", "kiwis are great");
    remember(&mut conn, "p1", "bananas are fine");
    remember(&mut conn, "p2", "kiwis from another persona");
    let embedder = CountingEmbedder::default();

    let found = retrieve_memories(&conn, &embedder, &query("p1", "kiwi?"), &settings(5));
    assert_eq!(embedder.calls(), 1);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, "kiwis are great");
    assert!(found[0].score > 0.99);
}

#[test]
fn shared_personas_see_each_others_memories() {
    let mut conn = helpers::test_db();
    upsert_persona(&conn, "p1", "u1", "Knight", true, t0()).unwrap();
    upsert_persona(&conn, "p2", "u1", "Bard", false, t0()).unwrap();
    upsert_persona(&conn, "p3", "u2", "Stranger", false, t0()).unwrap();
    remember(&mut conn, "p2", "kiwis, said the bard");
    remember(&mut conn, "p3", "kiwis, said the stranger");
    let embedder = CountingEmbedder::default();

    let shared = retrieve_memories(&conn, &embedder, &query("p1", "kiwi"), &settings(5));
    let contents: Vec<&str> = shared.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["kiwis, said the bard"]);

    // Sharing is decided by the querying persona.
    let unshared = retrieve_memories(&conn, &embedder, &query("p2", "kiwi"), &settings(5));
    assert_eq!(unshared.len(), 1);
    assert_eq!(unshared[0].content, "kiwis, said the bard");
}

#[test]
fn chunk_group_reassembled_by_index_not_storage_order() {
    let conn = helpers::test_db();
    // Insert the group back to front so rowid order disagrees with chunk order.
    for (id, index, content, seed) in [
        ("m3", 2, "third", b'z'),
        ("m2", 1, "second", b'y'),
        ("m1", 0, "first", b'k'),
    ] {
        conn.execute(
            "INSERT INTO memories (id, character_id, persona_id, content, chunk_group_id, chunk_index, total_chunks, created_at) \
             VALUES (?1, 'aria', 'p1', ?2, 'g1', ?3, 3, '2026-05-01T09:00:00.000000Z')",
            params![id, content, index],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memory_vectors (memory_id, embedding) VALUES (?1, ?2)",
            params![id, embedding_to_bytes(&test_embedding(seed))],
        )
        .unwrap();
    }

    let embedder = CountingEmbedder::default();
    let found = retrieve_memories(&conn, &embedder, &query("p1", "kiwi"), &settings(5));
    assert_eq!(found.len(), 1, "a group counts once");
    assert_eq!(found[0].content, "first\nsecond\nthird");
    assert_eq!(found[0].chunk_count, 3);
    assert_eq!(found[0].id, "m1");
}

#[test]
fn provider_outage_degrades_to_no_memories() {
    let mut conn = helpers::test_db();
    remember(&mut conn, "p1", "kiwis are great");
    let found = retrieve_memories(&conn, &DownEmbedder, &query("p1", "kiwi"), &settings(5));
    assert!(found.is_empty());
}
