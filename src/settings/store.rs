//! Precedence store: read access to the four store-backed override tiers.
//!
//! Rows in `settings_overrides` are keyed by `(tier, user_id, character_id)`,
//! with the empty string standing in for "not keyed by this dimension".

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

use super::{LayerSet, OverrideLayer, Tier};

/// Source of override layers for the resolver.
pub trait PrecedenceStore: Send + Sync {
    fn load_layers(&self, user_id: &str, character_id: &str) -> Result<LayerSet>;
}

/// [`PrecedenceStore`] over the shared SQLite connection.
pub struct SqlitePrecedenceStore {
    db: Arc<Mutex<Connection>>,
}

impl SqlitePrecedenceStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

impl PrecedenceStore for SqlitePrecedenceStore {
    fn load_layers(&self, user_id: &str, character_id: &str) -> Result<LayerSet> {
        let conn = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        load_layer_set(&conn, user_id, character_id)
    }
}

/// Fetch every tier that applies to this (user, character) pair.
///
/// A row whose JSON no longer parses is skipped with a warning; the tier is
/// treated as absent rather than failing resolution.
pub fn load_layer_set(conn: &Connection, user_id: &str, character_id: &str) -> Result<LayerSet> {
    let mut stmt = conn.prepare(
        "SELECT tier, overrides FROM settings_overrides \
         WHERE (tier = 'admin' AND user_id = '' AND character_id = '') \
            OR (tier = 'character-default' AND user_id = '' AND character_id = ?2) \
            OR (tier = 'user-default' AND user_id = ?1 AND character_id = '') \
            OR (tier = 'user-per-character' AND user_id = ?1 AND character_id = ?2)",
    )?;
    let rows = stmt
        .query_map(params![user_id, character_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut layers = LayerSet::default();
    for (tier_raw, overrides) in rows {
        let tier: Tier = match tier_raw.parse() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(tier = %tier_raw, error = %e, "skipping override row");
                continue;
            }
        };
        match OverrideLayer::from_json(&overrides) {
            Ok(layer) => layers.set(tier, layer),
            Err(e) => {
                tracing::warn!(tier = %tier, user = user_id, character = character_id, error = %e, "malformed override layer ignored");
            }
        }
    }
    Ok(layers)
}

/// Validate that the key columns match the tier's shape and map `None` to `''`.
fn tier_key<'a>(
    tier: Tier,
    user_id: Option<&'a str>,
    character_id: Option<&'a str>,
) -> Result<(&'a str, &'a str)> {
    if tier == Tier::Hardcoded {
        bail!("the hardcoded tier is not stored; use cascade.defaults_file");
    }
    let (wants_user, wants_character) = tier.key_shape();
    if wants_user != user_id.is_some() {
        bail!(
            "tier {tier} {} a user id",
            if wants_user { "requires" } else { "does not take" }
        );
    }
    if wants_character != character_id.is_some() {
        bail!(
            "tier {tier} {} a character id",
            if wants_character { "requires" } else { "does not take" }
        );
    }
    Ok((user_id.unwrap_or(""), character_id.unwrap_or("")))
}

/// Fetch a single stored layer.
pub fn get_layer(
    conn: &Connection,
    tier: Tier,
    user_id: Option<&str>,
    character_id: Option<&str>,
) -> Result<Option<OverrideLayer>> {
    let (user, character) = tier_key(tier, user_id, character_id)?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT overrides FROM settings_overrides WHERE tier = ?1 AND user_id = ?2 AND character_id = ?3",
            params![tier.as_str(), user, character],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match raw {
        Some(raw) => Some(OverrideLayer::from_json(&raw)?),
        None => None,
    })
}

/// Insert or replace a stored layer.
pub fn put_layer(
    conn: &Connection,
    tier: Tier,
    user_id: Option<&str>,
    character_id: Option<&str>,
    layer: &OverrideLayer,
) -> Result<()> {
    let (user, character) = tier_key(tier, user_id, character_id)?;
    layer.validate()?;
    let json = serde_json::to_string(layer)?;
    let now = crate::db::format_ts(&chrono::Utc::now());
    conn.execute(
        "INSERT INTO settings_overrides (tier, user_id, character_id, overrides, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(tier, user_id, character_id) DO UPDATE SET overrides = excluded.overrides, updated_at = excluded.updated_at",
        params![tier.as_str(), user, character, json, now],
    )?;
    tracing::info!(tier = %tier, user, character, fields = ?layer.defined_fields(), "override layer stored");
    Ok(())
}

/// Remove a stored layer. Returns `true` if a row existed.
pub fn delete_layer(
    conn: &Connection,
    tier: Tier,
    user_id: Option<&str>,
    character_id: Option<&str>,
) -> Result<bool> {
    let (user, character) = tier_key(tier, user_id, character_id)?;
    let rows = conn.execute(
        "DELETE FROM settings_overrides WHERE tier = ?1 AND user_id = ?2 AND character_id = ?3",
        params![tier.as_str(), user, character],
    )?;
    Ok(rows > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Override, SettingField};

    fn layer(json: &str) -> OverrideLayer {
        OverrideLayer::from_json(json).unwrap()
    }

    #[test]
    fn loads_only_applicable_rows() {
        let conn = crate::db::open_memory_database().unwrap();
        put_layer(&conn, Tier::Admin, None, None, &layer(r#"{"maxImages": 2}"#)).unwrap();
        put_layer(&conn, Tier::CharacterDefault, None, Some("c1"), &layer(r#"{"maxMessages": 30}"#)).unwrap();
        put_layer(&conn, Tier::CharacterDefault, None, Some("c2"), &layer(r#"{"maxMessages": 99}"#)).unwrap();
        put_layer(&conn, Tier::UserDefault, Some("u1"), None, &layer(r#"{"memoryLimit": 3}"#)).unwrap();
        put_layer(&conn, Tier::UserPerCharacter, Some("u1"), Some("c1"), &layer(r#"{"maxAge": null}"#)).unwrap();
        put_layer(&conn, Tier::UserPerCharacter, Some("u2"), Some("c1"), &layer(r#"{"maxAge": 60}"#)).unwrap();

        let layers = load_layer_set(&conn, "u1", "c1").unwrap();
        assert_eq!(layers.admin.unwrap().max_images, Override::Set(2));
        assert_eq!(layers.character_default.unwrap().max_messages, Override::Set(30));
        assert_eq!(layers.user_default.unwrap().memory_limit, Override::Set(3));
        assert_eq!(layers.user_per_character.unwrap().max_age, Override::Set(None));
    }

    #[test]
    fn key_shape_is_enforced() {
        let conn = crate::db::open_memory_database().unwrap();
        let l = layer("{}");
        assert!(put_layer(&conn, Tier::Admin, Some("u"), None, &l).is_err());
        assert!(put_layer(&conn, Tier::UserPerCharacter, Some("u"), None, &l).is_err());
        assert!(put_layer(&conn, Tier::Hardcoded, None, None, &l).is_err());
    }

    #[test]
    fn out_of_range_threshold_is_not_stored() {
        let conn = crate::db::open_memory_database().unwrap();
        let bad = OverrideLayer {
            memory_score_threshold: Override::Set(1.5),
            ..Default::default()
        };
        assert!(put_layer(&conn, Tier::Admin, None, None, &bad).is_err());
        assert!(get_layer(&conn, Tier::Admin, None, None).unwrap().is_none());

        let negative = OverrideLayer {
            memory_score_threshold: Override::Set(-3.0),
            ..Default::default()
        };
        assert!(put_layer(&conn, Tier::UserDefault, Some("u"), None, &negative).is_err());
    }

    #[test]
    fn put_replaces_and_delete_removes() {
        let conn = crate::db::open_memory_database().unwrap();
        put_layer(&conn, Tier::UserDefault, Some("u"), None, &layer(r#"{"maxImages": 1}"#)).unwrap();
        let updated = get_layer(&conn, Tier::UserDefault, Some("u"), None)
            .unwrap()
            .unwrap()
            .with_field(SettingField::FocusModeEnabled, serde_json::json!(true))
            .unwrap();
        put_layer(&conn, Tier::UserDefault, Some("u"), None, &updated).unwrap();

        let stored = get_layer(&conn, Tier::UserDefault, Some("u"), None).unwrap().unwrap();
        assert_eq!(stored.max_images, Override::Set(1));
        assert_eq!(stored.focus_mode_enabled, Override::Set(true));

        assert!(delete_layer(&conn, Tier::UserDefault, Some("u"), None).unwrap());
        assert!(!delete_layer(&conn, Tier::UserDefault, Some("u"), None).unwrap());
    }

    #[test]
    fn malformed_row_is_skipped() {
        let conn = crate::db::open_memory_database().unwrap();
        conn.execute(
            "INSERT INTO settings_overrides (tier, user_id, character_id, overrides, updated_at) \
             VALUES ('admin', '', '', '{\"maxMessages\": null}', '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();
        let layers = load_layer_set(&conn, "u", "c").unwrap();
        assert!(layers.admin.is_none());
    }
}
