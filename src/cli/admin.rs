//! Operator commands: settings, personas, deletion, and the writeback queue.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use recollect::config::RecollectConfig;
use recollect::deletion::{self, HardDeleteTarget};
use recollect::engine::{load_hardcoded_defaults, ContextRequest};
use recollect::history::ConversationScope;
use recollect::settings::resolver::SettingsResolver;
use recollect::settings::store::{self, SqlitePrecedenceStore};
use recollect::settings::{OverrideLayer, SettingField, Tier};
use recollect::writeback::{queue, PendingStatus};
use recollect::{db, persona};

/// Which stored override layer a command addresses.
#[derive(clap::Args, Clone, Debug)]
pub struct LayerKey {
    /// admin, character-default, user-default, or user-per-character
    #[arg(long)]
    pub tier: Tier,
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub character: Option<String>,
}

fn open(config: &RecollectConfig) -> Result<rusqlite::Connection> {
    db::open_database(config.resolved_db_path()).context("failed to open database")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print each effective field with the tier that supplied it.
pub fn resolve(config: &RecollectConfig, user: &str, character: &str) -> Result<()> {
    let hardcoded = load_hardcoded_defaults(config)?;
    let db = Arc::new(Mutex::new(open(config)?));
    let resolver = SettingsResolver::new(
        hardcoded,
        Arc::new(SqlitePrecedenceStore::new(db)),
        Duration::ZERO,
    );
    let settings = resolver.resolve(user, character);

    let value = serde_json::to_value(&settings)?;
    println!("Effective settings for user {user} / character {character}");
    println!("{}", "=".repeat(48));
    for field in SettingField::ALL {
        let shown = value
            .get(field.as_str())
            .map(|v| v.to_string())
            .unwrap_or_default();
        println!("  {:<22} {:<10} ({})", field.as_str(), shown, settings.source(field));
    }
    Ok(())
}

/// Print the full generation context as JSON.
pub async fn context(
    config: RecollectConfig,
    user: String,
    scope: ConversationScope,
    query: String,
) -> Result<()> {
    let (engine, _) = recollect::server::setup_engine(config)?;
    let ctx = engine
        .assemble_context(ContextRequest {
            user_id: user,
            scope,
            query_text: query,
            memories_before: None,
        })
        .await?;
    print_json(&ctx)
}

pub fn clear(config: &RecollectConfig, scope: &ConversationScope) -> Result<()> {
    let mut conn = open(config)?;
    let result = deletion::clear(&mut conn, scope, Utc::now())?;
    println!(
        "Cleared {scope}: {} turn(s) hidden (tombstone {}).",
        result.turns_hidden, result.tombstone_id
    );
    Ok(())
}

pub fn undo(config: &RecollectConfig, scope: &ConversationScope, n: usize) -> Result<()> {
    let mut conn = open(config)?;
    let result = deletion::undo(&mut conn, scope, n, Utc::now())?;
    println!(
        "Undid {} turn(s) in {scope}: {} removed before writeback, {} marked deleted.",
        result.turn_ids.len(),
        result.turns_removed,
        result.turns_marked_deleted
    );
    Ok(())
}

pub fn hard_delete(
    config: &RecollectConfig,
    target: &HardDeleteTarget,
    purge: Option<bool>,
) -> Result<()> {
    let mut conn = open(config)?;
    let purge = purge.unwrap_or(config.deletion.hard_delete_purges_memories);
    let result = deletion::hard_delete(&mut conn, target, purge, Utc::now())?;
    println!("Hard delete complete:");
    println!("  Turns deleted:       {}", result.turns_deleted);
    println!("  Pending deleted:     {}", result.pending_deleted);
    println!("  Tombstones inserted: {}", result.tombstones_inserted);
    if purge {
        println!("  Memories purged:     {}", result.memories_purged);
        println!("  Locked kept:         {}", result.locked_memories_kept);
    } else {
        println!("  Memories:            kept");
    }
    Ok(())
}

pub fn pending_list(config: &RecollectConfig, status: Option<&str>, limit: usize) -> Result<()> {
    let status: Option<PendingStatus> = status
        .map(|s| s.parse().map_err(anyhow::Error::msg))
        .transpose()?;
    let conn = open(config)?;

    let counts = queue::status_counts(&conn)?;
    println!(
        "Queue: {} pending, {} claimed, {} exhausted",
        counts.pending, counts.claimed, counts.exhausted
    );
    println!();

    for write in queue::list_by_status(&conn, status, limit)? {
        println!(
            "{}  {:<9} attempts={} next={} turn={} scope={}",
            write.id,
            write.status,
            write.attempts,
            write.next_attempt_at.format("%Y-%m-%d %H:%M:%S"),
            write.turn_id,
            write.scope
        );
        if let Some(error) = &write.error {
            println!("    last error: {error}");
        }
    }
    Ok(())
}

pub fn pending_requeue(config: &RecollectConfig, id: &str) -> Result<()> {
    let conn = open(config)?;
    if queue::requeue(&conn, id, Utc::now())? {
        println!("Requeued {id}.");
    } else {
        println!("No exhausted write with id {id}.");
    }
    Ok(())
}

pub fn settings_show(config: &RecollectConfig, key: &LayerKey) -> Result<()> {
    let conn = open(config)?;
    match store::get_layer(&conn, key.tier, key.user.as_deref(), key.character.as_deref())? {
        Some(layer) => print_json(&layer),
        None => {
            println!("No {} layer stored for this key.", key.tier);
            Ok(())
        }
    }
}

pub fn settings_set(config: &RecollectConfig, key: &LayerKey, field: &str, value: &str) -> Result<()> {
    let field: SettingField = field.parse().map_err(anyhow::Error::msg)?;
    let value: serde_json::Value =
        serde_json::from_str(value).with_context(|| format!("value is not JSON: {value}"))?;
    let conn = open(config)?;

    let (user, character) = (key.user.as_deref(), key.character.as_deref());
    let current = store::get_layer(&conn, key.tier, user, character)?.unwrap_or_default();
    let updated = current
        .with_field(field, value)
        .with_context(|| format!("invalid value for {field}"))?;
    store::put_layer(&conn, key.tier, user, character, &updated)?;
    println!("Set {field} on {} layer.", key.tier);
    Ok(())
}

pub fn settings_unset(config: &RecollectConfig, key: &LayerKey, field: &str) -> Result<()> {
    let field: SettingField = field.parse().map_err(anyhow::Error::msg)?;
    let conn = open(config)?;

    let (user, character) = (key.user.as_deref(), key.character.as_deref());
    let Some(current) = store::get_layer(&conn, key.tier, user, character)? else {
        println!("No {} layer stored for this key.", key.tier);
        return Ok(());
    };
    let updated: OverrideLayer = current.without_field(field)?;
    if updated.is_empty() {
        store::delete_layer(&conn, key.tier, user, character)?;
        println!("Removed {field}; {} layer is now empty and was deleted.", key.tier);
    } else {
        store::put_layer(&conn, key.tier, user, character, &updated)?;
        println!("Removed {field} from {} layer.", key.tier);
    }
    Ok(())
}

pub fn persona_set(
    config: &RecollectConfig,
    id: &str,
    user: &str,
    name: &str,
    share_memories: bool,
) -> Result<()> {
    let conn = open(config)?;
    let persona = persona::upsert_persona(&conn, id, user, name, share_memories, Utc::now())?;
    print_json(&persona)
}
