//! Short-term conversation history: turns and tombstones per
//! (channel, character, persona) scope, plus the context assembler.

pub mod context;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The (channel, character, persona) triple that scopes history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationScope {
    pub channel_id: String,
    pub character_id: String,
    pub persona_id: String,
}

impl ConversationScope {
    pub fn new(
        channel_id: impl Into<String>,
        character_id: impl Into<String>,
        persona_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            character_id: character_id.into(),
            persona_id: persona_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.channel_id, self.character_id, self.persona_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// A file attached to a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// A persisted conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// UUID v7 primary key.
    pub id: String,
    pub scope: ConversationScope,
    pub role: Role,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Transport-side message ids (one turn may span several chunks on the wire).
    pub external_message_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Turns in `scope` created at or before `deleted_at` are hidden from context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub scope: ConversationScope,
    pub deleted_at: DateTime<Utc>,
}

/// A completed turn as reported by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEvent {
    pub scope: ConversationScope,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub external_message_refs: Vec<String>,
}
