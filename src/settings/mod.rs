//! Five-tier settings cascade.
//!
//! Each tier contributes an [`OverrideLayer`] whose fields are tagged
//! [`Override`] values: `Inherit` keeps cascading, `Set` wins at that tier.
//! For the nullable `maxAge` field `Set(None)` is an explicit null, which is a
//! terminal value ("unbounded") and not the same as leaving the key out.
//! The hardcoded floor is a fully-typed [`HardcodedDefaults`], so resolution
//! is total.

pub mod resolver;
pub mod store;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, CoreResult};

/// One layer of the cascade, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Hardcoded,
    Admin,
    CharacterDefault,
    UserDefault,
    UserPerCharacter,
}

impl Tier {
    /// Tiers that come from the precedence store, in ascending precedence.
    pub const OVERRIDABLE: [Tier; 4] = [
        Tier::Admin,
        Tier::CharacterDefault,
        Tier::UserDefault,
        Tier::UserPerCharacter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hardcoded => "hardcoded",
            Self::Admin => "admin",
            Self::CharacterDefault => "character-default",
            Self::UserDefault => "user-default",
            Self::UserPerCharacter => "user-per-character",
        }
    }

    /// Whether rows for this tier are keyed by user and/or character.
    pub fn key_shape(&self) -> (bool, bool) {
        match self {
            Self::Hardcoded | Self::Admin => (false, false),
            Self::CharacterDefault => (false, true),
            Self::UserDefault => (true, false),
            Self::UserPerCharacter => (true, true),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hardcoded" => Ok(Self::Hardcoded),
            "admin" => Ok(Self::Admin),
            "character-default" => Ok(Self::CharacterDefault),
            "user-default" => Ok(Self::UserDefault),
            "user-per-character" => Ok(Self::UserPerCharacter),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

/// The cascaded field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettingField {
    MaxMessages,
    MaxAge,
    MaxImages,
    MemoryScoreThreshold,
    MemoryLimit,
    FocusModeEnabled,
}

impl SettingField {
    pub const ALL: [SettingField; 6] = [
        SettingField::MaxMessages,
        SettingField::MaxAge,
        SettingField::MaxImages,
        SettingField::MemoryScoreThreshold,
        SettingField::MemoryLimit,
        SettingField::FocusModeEnabled,
    ];

    /// JSON key used in override layers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxMessages => "maxMessages",
            Self::MaxAge => "maxAge",
            Self::MaxImages => "maxImages",
            Self::MemoryScoreThreshold => "memoryScoreThreshold",
            Self::MemoryLimit => "memoryLimit",
            Self::FocusModeEnabled => "focusModeEnabled",
        }
    }
}

impl std::fmt::Display for SettingField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for SettingField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown setting field: {s}"))
    }
}

/// A single field in an override layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Override<T> {
    /// The tier does not address this field.
    Inherit,
    /// The tier defines this field, possibly as an explicit null when `T` is an `Option`.
    Set(T),
}

impl<T> Default for Override<T> {
    fn default() -> Self {
        Self::Inherit
    }
}

impl<T> Override<T> {
    pub fn is_inherit(&self) -> bool {
        matches!(self, Self::Inherit)
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Self::Inherit => None,
            Self::Set(v) => Some(v),
        }
    }
}

// A present key always deserializes to `Set`; absent keys fall back to
// `Default` (Inherit) through `#[serde(default)]` on the layer fields.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Override<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Override::Set)
    }
}

impl<T: Serialize> Serialize for Override<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Set(v) => v.serialize(serializer),
            Self::Inherit => serializer.serialize_none(),
        }
    }
}

/// A partial settings record owned by one tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideLayer {
    #[serde(default, skip_serializing_if = "Override::is_inherit")]
    pub max_messages: Override<u32>,
    /// Seconds. `Set(None)` = explicitly unbounded.
    #[serde(default, skip_serializing_if = "Override::is_inherit")]
    pub max_age: Override<Option<u64>>,
    #[serde(default, skip_serializing_if = "Override::is_inherit")]
    pub max_images: Override<u32>,
    #[serde(default, skip_serializing_if = "Override::is_inherit")]
    pub memory_score_threshold: Override<f64>,
    #[serde(default, skip_serializing_if = "Override::is_inherit")]
    pub memory_limit: Override<u32>,
    #[serde(default, skip_serializing_if = "Override::is_inherit")]
    pub focus_mode_enabled: Override<bool>,
}

impl OverrideLayer {
    /// Fields this layer defines (including explicit nulls).
    pub fn defined_fields(&self) -> Vec<SettingField> {
        SettingField::ALL
            .into_iter()
            .filter(|f| self.defines(*f))
            .collect()
    }

    pub fn defines(&self, field: SettingField) -> bool {
        match field {
            SettingField::MaxMessages => !self.max_messages.is_inherit(),
            SettingField::MaxAge => !self.max_age.is_inherit(),
            SettingField::MaxImages => !self.max_images.is_inherit(),
            SettingField::MemoryScoreThreshold => !self.memory_score_threshold.is_inherit(),
            SettingField::MemoryLimit => !self.memory_limit.is_inherit(),
            SettingField::FocusModeEnabled => !self.focus_mode_enabled.is_inherit(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.defined_fields().is_empty()
    }

    /// Range-check the fields a layer sets, with the same bounds as the floor.
    pub fn validate(&self) -> CoreResult<()> {
        if let Some(threshold) = self.memory_score_threshold.as_set() {
            check_threshold(*threshold)?;
        }
        Ok(())
    }

    /// Parse a layer from its JSON form, rejecting wrong types and nulls on
    /// non-nullable fields.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Return a copy with `field` set to the given JSON value (which may be `null`).
    pub fn with_field(&self, field: SettingField, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut map = self.to_json_map()?;
        map.insert(field.as_str().to_string(), value);
        let layer: Self = serde_json::from_value(serde_json::Value::Object(map))?;
        layer
            .validate()
            .map_err(<serde_json::Error as serde::de::Error>::custom)?;
        Ok(layer)
    }

    /// Return a copy with `field` back to `Inherit`.
    pub fn without_field(&self, field: SettingField) -> Result<Self, serde_json::Error> {
        let mut map = self.to_json_map()?;
        map.remove(field.as_str());
        serde_json::from_value(serde_json::Value::Object(map))
    }

    fn to_json_map(&self) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }
}

/// The absolute floor of the cascade. Every field is concrete.
#[derive(Debug, Clone, PartialEq)]
pub struct HardcodedDefaults {
    pub max_messages: u32,
    pub max_age: Option<u64>,
    pub max_images: u32,
    pub memory_score_threshold: f64,
    pub memory_limit: u32,
    pub focus_mode_enabled: bool,
}

impl Default for HardcodedDefaults {
    fn default() -> Self {
        Self {
            max_messages: 50,
            max_age: None,
            max_images: 10,
            memory_score_threshold: 0.5,
            memory_limit: 20,
            focus_mode_enabled: false,
        }
    }
}

impl HardcodedDefaults {
    /// Reject values that would make every lookup misbehave.
    pub fn validate(&self) -> CoreResult<()> {
        check_threshold(self.memory_score_threshold)
    }

    /// Load a replacement floor from a JSON file. Every field must be present.
    pub fn load_from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigurationDefect(format!(
                "cannot read hardcoded defaults {}: {e}",
                path.display()
            ))
        })?;
        let layer = OverrideLayer::from_json(&raw).map_err(|e| {
            CoreError::ConfigurationDefect(format!(
                "invalid hardcoded defaults {}: {e}",
                path.display()
            ))
        })?;
        Self::try_from(&layer)
    }

    /// View the floor as a layer where every field is `Set`.
    pub fn as_layer(&self) -> OverrideLayer {
        OverrideLayer {
            max_messages: Override::Set(self.max_messages),
            max_age: Override::Set(self.max_age),
            max_images: Override::Set(self.max_images),
            memory_score_threshold: Override::Set(self.memory_score_threshold),
            memory_limit: Override::Set(self.memory_limit),
            focus_mode_enabled: Override::Set(self.focus_mode_enabled),
        }
    }
}

impl TryFrom<&OverrideLayer> for HardcodedDefaults {
    type Error = CoreError;

    fn try_from(layer: &OverrideLayer) -> CoreResult<Self> {
        let missing: Vec<&str> = SettingField::ALL
            .into_iter()
            .filter(|f| !layer.defines(*f))
            .map(|f| f.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::ConfigurationDefect(format!(
                "hardcoded tier must define every field; missing: {}",
                missing.join(", ")
            )));
        }

        let defaults = Self {
            max_messages: *layer.max_messages.as_set().unwrap_or(&0),
            max_age: layer.max_age.as_set().copied().flatten(),
            max_images: *layer.max_images.as_set().unwrap_or(&0),
            memory_score_threshold: *layer.memory_score_threshold.as_set().unwrap_or(&0.0),
            memory_limit: *layer.memory_limit.as_set().unwrap_or(&0),
            focus_mode_enabled: *layer.focus_mode_enabled.as_set().unwrap_or(&false),
        };
        defaults.validate()?;
        Ok(defaults)
    }
}

fn check_threshold(value: f64) -> CoreResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(CoreError::ConfigurationDefect(format!(
            "memoryScoreThreshold must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

/// The store-backed tiers for one (user, character) pair. `None` = tier absent.
#[derive(Debug, Clone, Default)]
pub struct LayerSet {
    pub admin: Option<OverrideLayer>,
    pub character_default: Option<OverrideLayer>,
    pub user_default: Option<OverrideLayer>,
    pub user_per_character: Option<OverrideLayer>,
}

impl LayerSet {
    pub fn get(&self, tier: Tier) -> Option<&OverrideLayer> {
        match tier {
            Tier::Hardcoded => None,
            Tier::Admin => self.admin.as_ref(),
            Tier::CharacterDefault => self.character_default.as_ref(),
            Tier::UserDefault => self.user_default.as_ref(),
            Tier::UserPerCharacter => self.user_per_character.as_ref(),
        }
    }

    pub fn set(&mut self, tier: Tier, layer: OverrideLayer) {
        match tier {
            Tier::Hardcoded => {}
            Tier::Admin => self.admin = Some(layer),
            Tier::CharacterDefault => self.character_default = Some(layer),
            Tier::UserDefault => self.user_default = Some(layer),
            Tier::UserPerCharacter => self.user_per_character = Some(layer),
        }
    }
}

/// Effective settings for one (user, character) pair, with the winning tier per field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSettings {
    pub max_messages: u32,
    /// Seconds; `None` = unbounded.
    pub max_age: Option<u64>,
    pub max_images: u32,
    pub memory_score_threshold: f64,
    pub memory_limit: u32,
    pub focus_mode_enabled: bool,
    pub sources: BTreeMap<SettingField, Tier>,
}

impl ResolvedSettings {
    /// Tier that supplied `field`.
    pub fn source(&self, field: SettingField) -> Tier {
        self.sources.get(&field).copied().unwrap_or(Tier::Hardcoded)
    }

    /// Whether long-term memory should be looked up at all.
    pub fn retrieval_enabled(&self) -> bool {
        self.memory_limit > 0 && !self.focus_mode_enabled
    }
}
