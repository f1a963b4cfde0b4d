use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RecollectConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub writeback: WritebackConfig,
    pub cascade: CascadeConfig,
    pub deletion: DeletionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WritebackConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub claim_lease_secs: u64,
    pub chunk_max_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CascadeConfig {
    pub cache_ttl_secs: u64,
    /// JSON file replacing the built-in hardcoded tier. Must define every field.
    pub defaults_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DeletionConfig {
    pub hard_delete_purges_memories: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_recollect_dir()
            .join("recollect.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_recollect_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 500,
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            claim_lease_secs: 300,
            chunk_max_chars: 2000,
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            defaults_file: None,
        }
    }
}

/// Returns `~/.recollect/`
pub fn default_recollect_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".recollect")
}

/// Returns the default config file path: `~/.recollect/config.toml`
pub fn default_config_path() -> PathBuf {
    default_recollect_dir().join("config.toml")
}

impl RecollectConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            RecollectConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (RECOLLECT_DB, RECOLLECT_LOG_LEVEL, RECOLLECT_WORKERS).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RECOLLECT_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("RECOLLECT_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("RECOLLECT_WORKERS") {
            match val.parse() {
                Ok(n) => self.writeback.workers = n,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid RECOLLECT_WORKERS"),
            }
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RecollectConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.writeback.max_attempts, 5);
        assert_eq!(config.writeback.chunk_max_chars, 2000);
        assert!(!config.deletion.hard_delete_purges_memories);
        assert!(config.cascade.defaults_file.is_none());
        assert!(config.storage.db_path.ends_with("recollect.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[writeback]
workers = 8
max_attempts = 3

[deletion]
hard_delete_purges_memories = true
"#;
        let config: RecollectConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.writeback.workers, 8);
        assert_eq!(config.writeback.max_attempts, 3);
        assert!(config.deletion.hard_delete_purges_memories);
        // defaults still apply for unset fields
        assert_eq!(config.writeback.backoff_base_secs, 30);
        assert_eq!(config.cascade.cache_ttl_secs, 30);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = RecollectConfig::default();
        std::env::set_var("RECOLLECT_DB", "/tmp/override.db");
        std::env::set_var("RECOLLECT_LOG_LEVEL", "trace");
        std::env::set_var("RECOLLECT_WORKERS", "7");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.writeback.workers, 7);

        std::env::remove_var("RECOLLECT_DB");
        std::env::remove_var("RECOLLECT_LOG_LEVEL");
        std::env::remove_var("RECOLLECT_WORKERS");
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/db.sqlite"), PathBuf::from("/var/db.sqlite"));
    }
}
