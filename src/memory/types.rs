//! Long-term memory record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a memory may be returned by retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Normal,
    /// Kept in storage but never retrieved.
    Hidden,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Hidden => "hidden",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "hidden" => Ok(Self::Hidden),
            _ => Err(format!("unknown visibility: {s}")),
        }
    }
}

/// Position of a memory inside a chunk group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub group_id: String,
    /// 0-based.
    pub index: u32,
    pub total: u32,
}

/// A row of the `memories` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 primary key.
    pub id: String,
    pub character_id: String,
    pub persona_id: String,
    /// Channel the source turn came from. Provenance only; not part of the scope.
    pub channel_id: Option<String>,
    pub content: String,
    pub chunk: Option<ChunkInfo>,
    pub visibility: Visibility,
    /// Locked memories are retrievable but cannot be forgotten or purged.
    pub is_locked: bool,
    pub source_turn_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Ownership and provenance for memories about to be written.
#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub character_id: String,
    pub persona_id: String,
    pub channel_id: Option<String>,
    pub source_turn_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Row timestamp when it differs from the write time (imports).
    pub created_at: Option<DateTime<Utc>>,
}

/// One piece of content with its embedding.
#[derive(Debug, Clone)]
pub struct EmbeddedPiece {
    pub content: String,
    pub embedding: Vec<f32>,
}
