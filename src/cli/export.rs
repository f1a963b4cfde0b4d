use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recollect::config::RecollectConfig;
use recollect::memory::store::list_memories;
use recollect::memory::types::{Memory, Visibility};

/// One memory unit in the export file. Chunk groups are written reassembled;
/// import splits them again with the configured chunk size.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportedMemory {
    pub character_id: String,
    pub persona_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Export format shared with `import`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportData {
    pub memories: Vec<ExportedMemory>,
}

/// Collapse chunk rows (already contiguous and ordered) into one entry per unit.
fn into_units(rows: Vec<Memory>) -> Vec<ExportedMemory> {
    let mut units: Vec<ExportedMemory> = Vec::new();
    let mut current_group: Option<String> = None;
    for memory in rows {
        let group = memory.chunk.as_ref().map(|c| c.group_id.clone());
        if let (Some(g), Some(last)) = (&group, units.last_mut()) {
            if current_group.as_ref() == Some(g) {
                last.content.push('\n');
                last.content.push_str(&memory.content);
                continue;
            }
        }
        current_group = group;
        units.push(ExportedMemory {
            character_id: memory.character_id,
            persona_id: memory.persona_id,
            channel_id: memory.channel_id,
            content: memory.content,
            is_locked: memory.is_locked,
            hidden: memory.visibility == Visibility::Hidden,
            metadata: memory.metadata,
            created_at: Some(memory.created_at),
        });
    }
    units
}

/// Export memories (optionally for one character) as JSON to stdout.
pub fn export(config: &RecollectConfig, character: Option<&str>) -> Result<()> {
    let conn = recollect::db::open_database(config.resolved_db_path())?;
    let data = ExportData {
        memories: into_units(list_memories(&conn, character)?),
    };

    println!("{}", serde_json::to_string_pretty(&data)?);
    eprintln!("Exported {} memories.", data.memories.len());
    Ok(())
}
