//! The public facade over the settings cascade, history, retrieval and
//! deletion.
//!
//! [`MemoryEngine`] holds shared state (database connection, embedding
//! provider, settings resolver, config). Every method is async and moves
//! blocking work (SQLite, ONNX inference) onto the blocking pool. The
//! writeback pool is separate: it runs its own connections against the same
//! database file (see [`crate::writeback::WritebackPool`]).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RecollectConfig;
use crate::deletion::{self, ClearResult, HardDeleteResult, HardDeleteTarget, UndoResult};
use crate::embedding::EmbeddingProvider;
use crate::history::context::assemble_context;
use crate::history::{store as history_store, Attachment, ConversationScope, ConversationTurn, TurnEvent};
use crate::memory::retrieval::{retrieve_with_embedding, MemoryQuery, RetrievedMemory};
use crate::settings::resolver::SettingsResolver;
use crate::settings::store::{self as settings_store, SqlitePrecedenceStore};
use crate::settings::{HardcodedDefaults, OverrideLayer, ResolvedSettings, Tier};

/// A generation request needing context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    pub user_id: String,
    pub scope: ConversationScope,
    /// Text used as the memory query, usually the incoming user message.
    pub query_text: String,
    /// Only consider memories created before this instant.
    #[serde(default)]
    pub memories_before: Option<DateTime<Utc>>,
}

/// Everything the generation layer needs for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationContext {
    pub settings: ResolvedSettings,
    /// Oldest first.
    pub turns: Vec<ConversationTurn>,
    pub images: Vec<Attachment>,
    pub memories: Vec<RetrievedMemory>,
}

#[derive(Clone)]
pub struct MemoryEngine {
    db: Arc<Mutex<Connection>>,
    embedding: Arc<dyn EmbeddingProvider>,
    resolver: Arc<SettingsResolver>,
    config: Arc<RecollectConfig>,
}

/// Load the hardcoded floor: the configured defaults file, or the built-in one.
pub fn load_hardcoded_defaults(config: &RecollectConfig) -> Result<HardcodedDefaults> {
    let defaults = match &config.cascade.defaults_file {
        Some(path) => HardcodedDefaults::load_from_file(crate::config::expand_tilde(path))?,
        None => HardcodedDefaults::default(),
    };
    defaults.validate()?;
    Ok(defaults)
}

impl MemoryEngine {
    /// Build an engine over an open connection.
    ///
    /// Fails with a configuration defect if the hardcoded tier is incomplete.
    pub fn new(
        db: Arc<Mutex<Connection>>,
        embedding: Arc<dyn EmbeddingProvider>,
        config: Arc<RecollectConfig>,
    ) -> Result<Self> {
        let hardcoded = load_hardcoded_defaults(&config)?;
        let store = Arc::new(SqlitePrecedenceStore::new(Arc::clone(&db)));
        let resolver = Arc::new(SettingsResolver::new(
            hardcoded,
            store,
            Duration::from_secs(config.cascade.cache_ttl_secs),
        ));
        Ok(Self {
            db,
            embedding,
            resolver,
            config,
        })
    }

    /// Open the configured database file and build an engine over it.
    pub fn open(config: RecollectConfig, embedding: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let conn = crate::db::open_database(config.resolved_db_path())?;
        Self::new(Arc::new(Mutex::new(conn)), embedding, Arc::new(config))
    }

    pub fn config(&self) -> &RecollectConfig {
        &self.config
    }

    pub fn resolver(&self) -> &SettingsResolver {
        &self.resolver
    }

    /// Run `f` with the locked connection on the blocking pool.
    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .context("db task failed")?
    }

    /// Effective settings for (user, character).
    pub async fn resolve(&self, user_id: &str, character_id: &str) -> Result<ResolvedSettings> {
        let resolver = Arc::clone(&self.resolver);
        let (user, character) = (user_id.to_string(), character_id.to_string());
        tokio::task::spawn_blocking(move || resolver.resolve(&user, &character))
            .await
            .context("resolve task failed")
    }

    /// Persist a completed turn and enqueue its memory write.
    pub async fn record_turn(&self, event: TurnEvent) -> Result<ConversationTurn> {
        tracing::info!(scope = %event.scope, role = %event.role, content_len = event.content.len(), "record_turn called");
        self.with_db(move |conn| history_store::append_turn(conn, &event, Utc::now()))
            .await
    }

    /// Replace a turn's content. Returns `false` if the turn is gone.
    pub async fn edit_turn(&self, turn_id: &str, content: &str) -> Result<bool> {
        let (turn_id, content) = (turn_id.to_string(), content.to_string());
        self.with_db(move |conn| history_store::edit_turn(conn, &turn_id, &content, Utc::now()))
            .await
    }

    /// Build the generation context: resolved settings, the short-term turn
    /// window, images, and retrieved memories.
    ///
    /// History and memory failures degrade to empty sections; only a broken
    /// runtime (task join, poisoned lock) is an error.
    pub async fn assemble_context(&self, request: ContextRequest) -> Result<GenerationContext> {
        let settings = self
            .resolve(&request.user_id, &request.scope.character_id)
            .await?;

        let query_embedding = if settings.retrieval_enabled() && !request.query_text.trim().is_empty() {
            let provider = Arc::clone(&self.embedding);
            let text = request.query_text.clone();
            match tokio::task::spawn_blocking(move || provider.embed(&text))
                .await
                .context("embedding task failed")?
            {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    tracing::warn!(scope = %request.scope, error = %e, "query embedding failed, continuing without memories");
                    None
                }
            }
        } else {
            None
        };

        let settings_for_db = settings.clone();
        let (turns, images, memories) = self
            .with_db(move |conn| {
                let history = assemble_context(conn, &settings_for_db, &request.scope, Utc::now());
                let memories = match query_embedding {
                    Some(embedding) => {
                        let query = MemoryQuery {
                            character_id: &request.scope.character_id,
                            persona_id: &request.scope.persona_id,
                            query_text: &request.query_text,
                            created_before: request.memories_before,
                        };
                        retrieve_with_embedding(conn, &embedding, &query, &settings_for_db)
                            .unwrap_or_else(|e| {
                                tracing::warn!(scope = %request.scope, error = %e, "memory retrieval failed, continuing without memories");
                                Vec::new()
                            })
                    }
                    None => Vec::new(),
                };
                Ok((history.turns, history.images, memories))
            })
            .await?;

        Ok(GenerationContext {
            settings,
            turns,
            images,
            memories,
        })
    }

    /// Hide the scope's history up to now.
    pub async fn clear(&self, scope: ConversationScope) -> Result<ClearResult> {
        self.with_db(move |conn| deletion::clear(conn, &scope, Utc::now()))
            .await
    }

    /// Undo the `n` most recent visible turns.
    pub async fn undo(&self, scope: ConversationScope, n: usize) -> Result<UndoResult> {
        self.with_db(move |conn| deletion::undo(conn, &scope, n, Utc::now()))
            .await
    }

    /// Physically delete history. `purge_memories: None` uses
    /// `deletion.hard_delete_purges_memories`.
    pub async fn hard_delete(
        &self,
        target: HardDeleteTarget,
        purge_memories: Option<bool>,
    ) -> Result<HardDeleteResult> {
        let purge = purge_memories.unwrap_or(self.config.deletion.hard_delete_purges_memories);
        self.with_db(move |conn| deletion::hard_delete(conn, &target, purge, Utc::now()))
            .await
    }

    /// Store an override layer and drop cached resolutions.
    pub async fn put_override(
        &self,
        tier: Tier,
        user_id: Option<String>,
        character_id: Option<String>,
        layer: OverrideLayer,
    ) -> Result<()> {
        self.with_db(move |conn| {
            settings_store::put_layer(conn, tier, user_id.as_deref(), character_id.as_deref(), &layer)
        })
        .await?;
        // Admin and default tiers fan out to many pairs.
        self.resolver.invalidate_all();
        Ok(())
    }

    /// Remove an override layer and drop cached resolutions.
    pub async fn delete_override(
        &self,
        tier: Tier,
        user_id: Option<String>,
        character_id: Option<String>,
    ) -> Result<bool> {
        let removed = self
            .with_db(move |conn| {
                settings_store::delete_layer(conn, tier, user_id.as_deref(), character_id.as_deref())
            })
            .await?;
        self.resolver.invalidate_all();
        Ok(removed)
    }
}
