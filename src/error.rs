//! Error taxonomy for the settings cascade and memory pipeline.
//!
//! Read-path failures ([`CoreError::TransientRetrieval`]) are logged and degraded
//! by callers; write-path failures are recorded on the pending row. Application
//! and CLI code wraps these in `anyhow` like the rest of the crate.

use thiserror::Error;

/// Domain errors that carry a handling policy.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The hardcoded settings tier is incomplete or invalid. Fatal at startup.
    #[error("configuration defect: {0}")]
    ConfigurationDefect(String),

    /// Context or memory read failed. Callers degrade to an empty result.
    #[error("retrieval failed: {0}")]
    TransientRetrieval(String),

    /// Embedding call failed in a way that may succeed on retry.
    #[error("transient writeback failure: {0}")]
    TransientWriteback(String),

    /// Content can never be embedded (empty, malformed). Exhausts immediately.
    #[error("permanent writeback failure: {0}")]
    PermanentWriteback(String),

    /// A second successful outcome for one turn was attempted and refused.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl CoreError {
    /// Whether a writeback failure should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientWriteback(_) | Self::Database(_))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
