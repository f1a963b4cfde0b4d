//! Writeback workers and the pool that drives them.
//!
//! Each [`Worker`] owns its own database connection and processes one claimed
//! row at a time: chunk, embed, then commit the memory rows and delete the
//! pending row in a single transaction. The [`WritebackPool`] runs workers as
//! tokio tasks, moving each blocking step onto the blocking thread pool.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use super::queue::{self, FailureOutcome, PendingWrite, RetryPolicy};
use crate::config::WritebackConfig;
use crate::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use crate::error::{CoreError, CoreResult};
use crate::memory::chunking::split_content;
use crate::memory::store::insert_memories;
use crate::memory::types::{EmbeddedPiece, NewMemory};

/// What happened to one claimed row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Nothing was due.
    Idle,
    Committed { turn_id: String, memory_ids: Vec<String> },
    Retrying { turn_id: String, attempts: u32, next_attempt_at: DateTime<Utc> },
    Exhausted { turn_id: String, attempts: u32 },
    /// Another worker or an undo took the row; nothing was written.
    ClaimLost { turn_id: String },
    /// Memories for the turn already existed; the pending row was dropped.
    AlreadyCommitted { turn_id: String },
}

/// Settings a worker needs from [`WritebackConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub retry: RetryPolicy,
    pub lease: Duration,
    pub chunk_max_chars: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &WritebackConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            lease: Duration::seconds(config.claim_lease_secs.min(u64::from(u32::MAX)) as i64),
            chunk_max_chars: config.chunk_max_chars,
        }
    }
}

pub struct Worker {
    name: String,
    conn: Connection,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        conn: Connection,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            name: name.into(),
            conn,
            embedder,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Claim and process the next due row, if any.
    pub fn process_next(&mut self, now: DateTime<Utc>) -> Result<Outcome> {
        match queue::claim_next(&mut self.conn, now, self.settings.lease)? {
            Some(write) => self.process_claimed(&write, now),
            None => Ok(Outcome::Idle),
        }
    }

    /// Process rows until nothing is due. Returns every non-idle outcome.
    pub fn drain(&mut self, now: DateTime<Utc>) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        loop {
            match self.process_next(now)? {
                Outcome::Idle => return Ok(outcomes),
                outcome => outcomes.push(outcome),
            }
        }
    }

    /// Embed and commit a row this worker has already claimed.
    pub fn process_claimed(&mut self, write: &PendingWrite, now: DateTime<Utc>) -> Result<Outcome> {
        match self.embed(write) {
            Ok(pieces) => self.commit(write, &pieces, now),
            Err(e) => self.fail(write, &e, now),
        }
    }

    fn embed(&self, write: &PendingWrite) -> CoreResult<Vec<EmbeddedPiece>> {
        let chunks = split_content(&write.text, self.settings.chunk_max_chars);
        if chunks.is_empty() {
            return Err(CoreError::PermanentWriteback("turn has no content to remember".into()));
        }

        let texts: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let vectors = self.embedder.embed_batch(&texts).map_err(|e| {
            if e.is_transient() {
                CoreError::TransientWriteback(e.to_string())
            } else {
                CoreError::PermanentWriteback(e.to_string())
            }
        })?;

        if vectors.len() != chunks.len() {
            return Err(CoreError::TransientWriteback(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != EMBEDDING_DIM) {
            return Err(CoreError::PermanentWriteback(format!(
                "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                bad.len()
            )));
        }

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(content, embedding)| EmbeddedPiece { content, embedding })
            .collect())
    }

    fn commit(
        &mut self,
        write: &PendingWrite,
        pieces: &[EmbeddedPiece],
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let turn_id = write.turn_id.clone();
        let Some(token) = write.claim_token.as_deref() else {
            return Ok(Outcome::ClaimLost { turn_id });
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !queue::complete(&tx, &write.id, token)? {
            tracing::info!(worker = %self.name, turn = %turn_id, "claim lost before commit, discarding");
            return Ok(Outcome::ClaimLost { turn_id });
        }

        let new = NewMemory {
            character_id: write.scope.character_id.clone(),
            persona_id: write.scope.persona_id.clone(),
            channel_id: Some(write.scope.channel_id.clone()),
            source_turn_id: Some(turn_id.clone()),
            metadata: write.metadata.clone(),
            created_at: None,
        };

        match insert_memories(&tx, &new, pieces, now) {
            Ok(memory_ids) => {
                tx.commit()?;
                tracing::info!(
                    worker = %self.name,
                    turn = %turn_id,
                    chunks = memory_ids.len(),
                    "memory committed"
                );
                Ok(Outcome::Committed { turn_id, memory_ids })
            }
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                let violation = CoreError::ConsistencyViolation(format!(
                    "memories for turn {turn_id} already exist"
                ));
                tracing::error!(worker = %self.name, turn = %turn_id, error = %violation, "duplicate memory write refused");
                if queue::complete(&self.conn, &write.id, token)? {
                    Ok(Outcome::AlreadyCommitted { turn_id })
                } else {
                    Ok(Outcome::ClaimLost { turn_id })
                }
            }
            Err(e) => {
                drop(tx);
                self.fail(write, &CoreError::TransientWriteback(e.to_string()), now)
            }
        }
    }

    fn fail(&mut self, write: &PendingWrite, err: &CoreError, now: DateTime<Utc>) -> Result<Outcome> {
        let turn_id = write.turn_id.clone();
        let permanent = !err.is_retryable();
        let outcome = queue::record_failure(
            &mut self.conn,
            write,
            &err.to_string(),
            permanent,
            &self.settings.retry,
            now,
        )?;
        Ok(match outcome {
            FailureOutcome::Retrying { attempts, next_attempt_at } => Outcome::Retrying {
                turn_id,
                attempts,
                next_attempt_at,
            },
            FailureOutcome::Exhausted { attempts } => Outcome::Exhausted { turn_id, attempts },
            FailureOutcome::ClaimLost => Outcome::ClaimLost { turn_id },
        })
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// A fixed set of workers polling the queue until shutdown.
pub struct WritebackPool {
    db_path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    config: WritebackConfig,
}

impl WritebackPool {
    pub fn new(
        db_path: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: WritebackConfig,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            embedder,
            config,
        }
    }

    /// Open one connection per worker. Fails without spawning anything if
    /// any connection cannot be opened.
    fn open_workers(&self) -> Result<Vec<Worker>> {
        let settings = WorkerSettings::from_config(&self.config);
        (0..self.config.workers.max(1))
            .map(|i| {
                let conn = crate::db::open_database(&self.db_path)?;
                Ok(Worker::new(
                    format!("writeback-{i}"),
                    conn,
                    Arc::clone(&self.embedder),
                    settings.clone(),
                ))
            })
            .collect()
    }

    /// Run until `shutdown` flips to `true`. Each worker opens its own
    /// connection to the database file.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll = std::time::Duration::from_millis(self.config.poll_interval_ms.max(1));
        let workers = self.open_workers()?;
        let count = workers.len();

        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| tokio::spawn(run_worker(worker, poll, shutdown.clone())))
            .collect();
        tracing::info!(workers = count, db = %self.db_path.display(), "writeback pool started");

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "writeback worker task panicked");
            }
        }
        tracing::info!("writeback pool stopped");
        Ok(())
    }
}

async fn run_worker(mut worker: Worker, poll: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let joined = tokio::task::spawn_blocking(move || {
            let result = worker.process_next(Utc::now());
            (worker, result)
        })
        .await;
        let result = match joined {
            Ok((w, result)) => {
                worker = w;
                result
            }
            Err(e) => {
                tracing::error!(error = %e, "writeback step panicked, worker stopping");
                return;
            }
        };

        let idle = match result {
            Ok(Outcome::Idle) => true,
            Ok(outcome) => {
                tracing::debug!(worker = %worker.name(), ?outcome, "writeback step");
                false
            }
            Err(e) => {
                tracing::error!(worker = %worker.name(), error = %e, "writeback step failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    tracing::debug!(worker = %worker.name(), "writeback worker stopped");
}
