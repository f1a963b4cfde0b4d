//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait and a local implementation using
//! all-MiniLM-L6-v2 (384 dimensions, L2-normalized). The provider is created
//! via [`create_provider`] from configuration. Failures are classified through
//! [`EmbeddingError::is_transient`] so the writeback pipeline knows whether to
//! retry.

pub mod local;

use thiserror::Error;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Why an embedding call failed.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("embedding request timed out: {0}")]
    Timeout(String),

    #[error("embedding provider rate limited: {0}")]
    RateLimited(String),

    /// The input can never be embedded (empty, over-long after truncation, ...).
    #[error("invalid embedding input: {0}")]
    InvalidInput(String),

    #[error("embedding provider error: {0}")]
    Provider(String),
}

impl EmbeddingError {
    /// Transient failures are worth retrying; invalid input never is.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidInput(_))
    }
}

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`] dimensions.
/// All methods are synchronous; callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a batch of text strings. Implementations may override for batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Create an embedding provider from config.
///
/// Currently only `"local"` is supported (ONNX Runtime + all-MiniLM-L6-v2).
/// Returns an error if model files are not found; run `recollect model download` first.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> anyhow::Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Box::new(provider))
        }
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_is_permanent() {
        assert!(!EmbeddingError::InvalidInput("empty".into()).is_transient());
        assert!(EmbeddingError::Timeout("30s".into()).is_transient());
        assert!(EmbeddingError::RateLimited("429".into()).is_transient());
        assert!(EmbeddingError::Provider("session".into()).is_transient());
    }
}
