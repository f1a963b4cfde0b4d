//! Short-term context assembly.
//!
//! Builds the chronological turn window for a generation request from the
//! resolved settings: the most recent `maxMessages` turns after the latest
//! tombstone, optionally bounded by `maxAge`, plus the newest `maxImages`
//! image attachments from that window.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::store::{latest_tombstone, visible_turns, TurnWindow};
use super::{Attachment, ConversationScope, ConversationTurn};
use crate::settings::ResolvedSettings;

/// Turn window handed to the generation layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationContext {
    /// Oldest first.
    pub turns: Vec<ConversationTurn>,
    /// Newest first, at most `maxImages`.
    pub images: Vec<Attachment>,
}

impl ConversationContext {
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Lower bound on `created_at` implied by `maxAge`. Zero means unbounded.
fn age_cutoff(max_age: Option<u64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match max_age {
        None | Some(0) => None,
        Some(secs) => {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            Duration::try_seconds(secs).and_then(|d| now.checked_sub_signed(d))
        }
    }
}

/// Assemble context, propagating storage errors.
pub fn try_assemble_context(
    conn: &Connection,
    settings: &ResolvedSettings,
    scope: &ConversationScope,
    now: DateTime<Utc>,
) -> Result<ConversationContext> {
    let window = TurnWindow {
        after: latest_tombstone(conn, scope)?.map(|t| t.deleted_at),
        not_before: age_cutoff(settings.max_age, now),
        limit: settings.max_messages as usize,
    };

    let mut turns = visible_turns(conn, scope, &window)?;

    // Newest-first scan for images, then flip turns to chronological order.
    let images: Vec<Attachment> = turns
        .iter()
        .flat_map(|t| t.attachments.iter().filter(|a| a.is_image()).rev())
        .take(settings.max_images as usize)
        .cloned()
        .collect();
    turns.reverse();

    Ok(ConversationContext { turns, images })
}

/// Assemble context for a generation request.
///
/// Never fails: a storage error is logged and an empty context returned so
/// generation can proceed without history.
pub fn assemble_context(
    conn: &Connection,
    settings: &ResolvedSettings,
    scope: &ConversationScope,
    now: DateTime<Utc>,
) -> ConversationContext {
    match try_assemble_context(conn, settings, scope, now) {
        Ok(ctx) => {
            tracing::debug!(
                scope = %scope,
                turns = ctx.turns.len(),
                images = ctx.images.len(),
                "context assembled"
            );
            ctx
        }
        Err(e) => {
            tracing::warn!(scope = %scope, error = %e, "context assembly failed, continuing without history");
            ConversationContext::default()
        }
    }
}
