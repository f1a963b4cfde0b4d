//! CLI `memory` commands: inspect, hide, lock, and forget single memories.

use anyhow::{Context, Result};
use chrono::Utc;

use recollect::config::RecollectConfig;
use recollect::memory::store::{self, ForgetOutcome};
use recollect::memory::types::Visibility;

#[derive(Debug, Clone, Copy)]
pub enum Toggle {
    Hide,
    Unhide,
    Lock,
    Unlock,
}

fn open(config: &RecollectConfig) -> Result<rusqlite::Connection> {
    recollect::db::open_database(config.resolved_db_path()).context("failed to open database")
}

/// Print a memory; for a chunk, print the whole group in order.
pub fn show(config: &RecollectConfig, id: &str) -> Result<()> {
    let conn = open(config)?;
    let Some(memory) = store::get_memory(&conn, id)? else {
        println!("Memory not found: {id}");
        return Ok(());
    };

    let members = match &memory.chunk {
        Some(chunk) => store::get_chunk_group(&conn, &chunk.group_id)?,
        None => vec![memory],
    };
    println!("{}", serde_json::to_string_pretty(&members)?);
    Ok(())
}

pub fn toggle(config: &RecollectConfig, id: &str, toggle: Toggle) -> Result<()> {
    let conn = open(config)?;
    let now = Utc::now();
    let rows = match toggle {
        Toggle::Hide => store::set_visibility(&conn, id, Visibility::Hidden, now)?,
        Toggle::Unhide => store::set_visibility(&conn, id, Visibility::Normal, now)?,
        Toggle::Lock => store::set_locked(&conn, id, true, now)?,
        Toggle::Unlock => store::set_locked(&conn, id, false, now)?,
    };
    if rows == 0 {
        println!("Memory not found: {id}");
    } else {
        println!("{toggle:?}: {rows} row(s) updated.");
    }
    Ok(())
}

pub fn forget(config: &RecollectConfig, id: &str) -> Result<()> {
    let mut conn = open(config)?;
    match store::forget_memory(&mut conn, id, Utc::now())? {
        ForgetOutcome::Deleted { rows } => println!("Forgot {id} ({rows} row(s))."),
        ForgetOutcome::Locked => println!("Memory {id} is locked; unlock it first."),
        ForgetOutcome::NotFound => println!("Memory not found: {id}"),
    }
    Ok(())
}
