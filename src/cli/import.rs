use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use std::path::Path;
use std::sync::Arc;

use recollect::config::RecollectConfig;
use recollect::embedding::{self, EmbeddingProvider};
use recollect::memory::chunking::split_content;
use recollect::memory::store;
use recollect::memory::types::{EmbeddedPiece, NewMemory, Visibility};

use super::export::ExportData;

/// Import memories from a JSON file in the `export` format.
///
/// Content is re-chunked and re-embedded with the configured model. Entries
/// whose (character, persona, content) already exist are skipped.
pub async fn import(config: &RecollectConfig, file: &Path) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read import file: {}", file.display()))?;
    let data: ExportData = serde_json::from_str(&json).context("failed to parse import JSON")?;

    let mut conn = recollect::db::open_database(config.resolved_db_path())?;
    let provider: Arc<dyn EmbeddingProvider> = Arc::from(
        embedding::create_provider(&config.embedding)
            .context("failed to create embedding provider")?,
    );

    let mut imported = 0u64;
    let mut skipped = 0u64;
    println!("Importing {} memories...", data.memories.len());

    for entry in data.memories {
        let pieces = split_content(&entry.content, config.writeback.chunk_max_chars);
        let Some(first) = pieces.first() else {
            skipped += 1;
            continue;
        };

        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM memories \
             WHERE character_id = ?1 AND persona_id = ?2 AND content = ?3 AND COALESCE(chunk_index, 0) = 0",
            params![entry.character_id, entry.persona_id, first],
            |row| row.get(0),
        )?;
        if exists {
            skipped += 1;
            continue;
        }

        let ep = Arc::clone(&provider);
        let texts = pieces.clone();
        let embeddings = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            ep.embed_batch(&refs)
        })
        .await??;

        let embedded: Vec<EmbeddedPiece> = pieces
            .into_iter()
            .zip(embeddings)
            .map(|(content, embedding)| EmbeddedPiece { content, embedding })
            .collect();
        let now = Utc::now();
        // Keep the original timestamp so created-before cutoffs still apply.
        let new = NewMemory {
            character_id: entry.character_id,
            persona_id: entry.persona_id,
            channel_id: entry.channel_id,
            source_turn_id: None,
            metadata: entry.metadata,
            created_at: Some(entry.created_at.unwrap_or(now)),
        };
        let ids = store::store_memories(&mut conn, &new, &embedded, now)?;
        if let Some(id) = ids.first() {
            if entry.hidden {
                store::set_visibility(&conn, id, Visibility::Hidden, now)?;
            }
            if entry.is_locked {
                store::set_locked(&conn, id, true, now)?;
            }
        }
        imported += 1;
    }

    println!("Import complete:");
    println!("  Memories imported: {imported}");
    println!("  Memories skipped:  {skipped} (empty or already present)");
    Ok(())
}
