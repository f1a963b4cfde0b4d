//! Long-running service: the writeback pool plus a ready [`MemoryEngine`].
//!
//! [`serve`] is what `recollect serve` runs. It validates the hardcoded
//! settings tier, opens the database, loads the embedding model, and drives
//! the writeback workers until Ctrl-C.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::RecollectConfig;
use crate::db;
use crate::embedding;
use crate::engine::MemoryEngine;
use crate::writeback::WritebackPool;

/// Shared setup: open DB, create embedding provider, check model version.
pub fn setup_engine(config: RecollectConfig) -> Result<(MemoryEngine, Arc<dyn embedding::EmbeddingProvider>)> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    if let Ok(Some(stored_model)) = db::migrations::get_embedding_model(&conn) {
        if stored_model != config.embedding.model {
            tracing::warn!(
                stored = %stored_model,
                configured = %config.embedding.model,
                "embedding model changed, run `recollect re-embed` to update all vectors"
            );
        }
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let embedding: Arc<dyn embedding::EmbeddingProvider> = Arc::from(provider);
    tracing::info!("embedding provider ready");

    let engine = MemoryEngine::new(
        Arc::new(std::sync::Mutex::new(conn)),
        Arc::clone(&embedding),
        Arc::new(config),
    )?;
    Ok((engine, embedding))
}

/// Run the writeback pool until Ctrl-C.
pub async fn serve(config: RecollectConfig) -> Result<()> {
    tracing::info!("starting recollect writeback service");

    let (engine, embedding) = setup_engine(config)?;
    let config = engine.config();
    let pool = WritebackPool::new(
        config.resolved_db_path(),
        embedding,
        config.writeback.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pool_task = tokio::spawn(pool.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutdown requested, waiting for in-flight writes");
        }
        joined = &mut pool_task => {
            // The pool only returns on its own if startup failed.
            let result = joined?;
            if let Err(e) = &result {
                tracing::error!(error = %e, "writeback pool stopped unexpectedly");
            }
            return result;
        }
    }

    // Workers finish their current row; unclaimed rows stay queued.
    let _ = shutdown_tx.send(true);
    pool_task.await??;
    Ok(())
}
