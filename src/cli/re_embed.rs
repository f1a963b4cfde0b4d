//! CLI `re-embed` command: regenerate all embeddings with the current model.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;

use recollect::config::RecollectConfig;
use recollect::db;
use recollect::embedding::{self, EmbeddingProvider};
use recollect::memory::store::replace_embedding;

const BATCH_SIZE: usize = 32;

/// Re-embed every memory (hidden ones included) with the configured model.
pub async fn re_embed(config: &RecollectConfig) -> Result<()> {
    let mut conn = db::open_database(config.resolved_db_path()).context("failed to open database")?;

    let provider: Arc<dyn EmbeddingProvider> = Arc::from(
        embedding::create_provider(&config.embedding)
            .context("failed to create embedding provider")?,
    );

    let memories: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT id, content FROM memories")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let total = memories.len();
    if total == 0 {
        println!("No memories to re-embed.");
        return Ok(());
    }

    println!("Re-embedding {total} memories with model '{}'...", config.embedding.model);

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} ({eta})")
            .context("invalid progress template")?
            .progress_chars("##-"),
    );

    for batch in memories.chunks(BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|(_, content)| content.clone()).collect();
        let provider = Arc::clone(&provider);

        let embeddings = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            provider.embed_batch(&refs)
        })
        .await?
        .context("embedding batch failed")?;

        let tx = conn.transaction()?;
        for ((id, _), emb) in batch.iter().zip(embeddings.iter()) {
            replace_embedding(&tx, id, emb)?;
        }
        tx.commit()?;

        pb.inc(batch.len() as u64);
    }

    pb.finish_and_clear();

    db::migrations::set_embedding_model(&conn, &config.embedding.model)?;

    println!("Re-embedded {total} memories with model '{}'.", config.embedding.model);
    Ok(())
}
