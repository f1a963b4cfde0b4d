//! Conversation memory core for character chat.
//!
//! recollect decides how much short-term history and how much long-term memory
//! a character sees on each generation, keeps that memory up to date in the
//! background, and lets users clear, undo, or erase what was said.
//!
//! | Concern | Where |
//! |---------|-------|
//! | Five-tier settings cascade (hardcoded, admin, character, user, user-per-character) | [`settings`] |
//! | Turn storage, tombstones, and the context window | [`history`] |
//! | Vector retrieval over long-term memories | [`memory`] |
//! | Durable queue turning turns into memories | [`writeback`] |
//! | Clear, undo, and hard delete | [`deletion`] |
//!
//! # Architecture
//!
//! - **Storage**: SQLite in WAL mode with
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for cosine distance
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions)
//! - **Writeback**: a pool of workers, each on its own connection, claiming rows
//!   from `pending_memory_writes` with a claim token and lease
//! - **Facade**: [`engine::MemoryEngine`] exposes the async entry points
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`db`]: SQLite database initialization, schema, migrations, and health checks
//! - [`embedding`]: Text-to-vector embedding pipeline via ONNX Runtime
//! - [`error`]: Error taxonomy with retry and degrade policy
//! - [`persona`]: Personas and cross-persona memory sharing
//! - [`server`]: The long-running writeback service

pub mod config;
pub mod db;
pub mod deletion;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod history;
pub mod memory;
pub mod persona;
pub mod server;
pub mod settings;
pub mod writeback;

pub use engine::{ContextRequest, GenerationContext, MemoryEngine};
pub use error::{CoreError, CoreResult};
