//! Cascade resolution and the caching resolver service.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::store::PrecedenceStore;
use super::{HardcodedDefaults, LayerSet, Override, OverrideLayer, ResolvedSettings, SettingField, Tier};

/// Merge the hardcoded floor with the store tiers. Pure and total.
///
/// For every field the highest-precedence tier that defines it wins, where
/// "defines" includes an explicit null.
pub fn resolve_layers(hardcoded: &HardcodedDefaults, layers: &LayerSet) -> ResolvedSettings {
    let mut sources = BTreeMap::new();

    let max_messages = cascade(
        SettingField::MaxMessages,
        hardcoded.max_messages,
        layers,
        |l| &l.max_messages,
        &mut sources,
    );
    let max_age = cascade(
        SettingField::MaxAge,
        hardcoded.max_age,
        layers,
        |l| &l.max_age,
        &mut sources,
    );
    let max_images = cascade(
        SettingField::MaxImages,
        hardcoded.max_images,
        layers,
        |l| &l.max_images,
        &mut sources,
    );
    let memory_score_threshold = cascade(
        SettingField::MemoryScoreThreshold,
        hardcoded.memory_score_threshold,
        layers,
        |l| &l.memory_score_threshold,
        &mut sources,
    );
    let memory_limit = cascade(
        SettingField::MemoryLimit,
        hardcoded.memory_limit,
        layers,
        |l| &l.memory_limit,
        &mut sources,
    );
    let focus_mode_enabled = cascade(
        SettingField::FocusModeEnabled,
        hardcoded.focus_mode_enabled,
        layers,
        |l| &l.focus_mode_enabled,
        &mut sources,
    );

    ResolvedSettings {
        max_messages,
        max_age,
        max_images,
        memory_score_threshold,
        memory_limit,
        focus_mode_enabled,
        sources,
    }
}

fn cascade<T: Clone>(
    field: SettingField,
    floor: T,
    layers: &LayerSet,
    pick: impl Fn(&OverrideLayer) -> &Override<T>,
    sources: &mut BTreeMap<SettingField, Tier>,
) -> T {
    let mut value = floor;
    let mut source = Tier::Hardcoded;

    for tier in Tier::OVERRIDABLE {
        if let Some(Override::Set(v)) = layers.get(tier).map(&pick) {
            value = v.clone();
            source = tier;
        }
    }

    sources.insert(field, source);
    value
}

/// Resolves settings for (user, character) pairs against a [`PrecedenceStore`],
/// caching results for a short TTL.
pub struct SettingsResolver {
    hardcoded: HardcodedDefaults,
    store: Arc<dyn PrecedenceStore>,
    ttl: Duration,
    cache: Mutex<HashMap<(String, String), (Instant, ResolvedSettings)>>,
}

impl SettingsResolver {
    pub fn new(hardcoded: HardcodedDefaults, store: Arc<dyn PrecedenceStore>, ttl: Duration) -> Self {
        Self {
            hardcoded,
            store,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn hardcoded(&self) -> &HardcodedDefaults {
        &self.hardcoded
    }

    /// Effective settings for this pair. Never fails: if the store cannot be
    /// read the hardcoded floor applies.
    pub fn resolve(&self, user_id: &str, character_id: &str) -> ResolvedSettings {
        let key = (user_id.to_string(), character_id.to_string());

        if !self.ttl.is_zero() {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, settings)) = cache.get(&key) {
                if at.elapsed() < self.ttl {
                    return settings.clone();
                }
            }
        }

        let layers = match self.store.load_layers(user_id, character_id) {
            Ok(layers) => layers,
            Err(e) => {
                tracing::warn!(
                    user = user_id,
                    character = character_id,
                    error = %e,
                    "override layers unavailable, resolving from hardcoded tier"
                );
                // Don't cache a degraded result.
                return resolve_layers(&self.hardcoded, &LayerSet::default());
            }
        };

        let settings = resolve_layers(&self.hardcoded, &layers);
        tracing::debug!(
            user = user_id,
            character = character_id,
            max_messages = settings.max_messages,
            memory_limit = settings.memory_limit,
            "settings resolved"
        );

        if !self.ttl.is_zero() {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(key, (Instant::now(), settings.clone()));
        }
        settings
    }

    /// Drop the cached entry for one pair.
    pub fn invalidate(&self, user_id: &str, character_id: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(&(user_id.to_string(), character_id.to_string()));
    }

    /// Drop every cached entry, e.g. after an admin or character-default change.
    pub fn invalidate_all(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
