use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

pub const TRAITS: [&str; 10] = [
    "humor",
    "sarcasm",
    "honesty",
    "respectfulness",
    "optimism",
    "confidence",
    "warmth",
    "curiosity",
    "verbosity",
    "formality",
];

pub const DEFAULT_LEVEL: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Min,
    Low,
    Med,
    High,
    Max,
}

impl Bucket {
    pub fn of(value: u8) -> Self {
        match value {
            0..=9 => Bucket::Min,
            10..=29 => Bucket::Low,
            30..=69 => Bucket::Med,
            70..=89 => Bucket::High,
            _ => Bucket::Max,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Min => "min",
            Bucket::Low => "low",
            Bucket::Med => "med",
            Bucket::High => "high",
            Bucket::Max => "max",
        }
    }
}

/// Trait name to level in `0..=100`. Always holds every known trait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonalityTraits(BTreeMap<String, u8>);

impl Default for PersonalityTraits {
    fn default() -> Self {
        Self(TRAITS.iter().map(|t| (t.to_string(), DEFAULT_LEVEL)).collect())
    }
}

impl PersonalityTraits {
    pub fn get(&self, name: &str) -> Option<u8> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Drops unknown or out-of-range entries and fills in missing traits.
    fn normalized(self) -> Self {
        let mut traits = Self::default();
        for (name, value) in self.0 {
            if traits.0.contains_key(&name) && value <= 100 {
                traits.0.insert(name, value);
            } else {
                warn!(%name, value, "ignoring stored personality trait");
            }
        }
        traits
    }

    /// Applies every valid `trait: integer` pair from a function call's
    /// arguments and returns what changed. Anything else is skipped.
    pub fn apply_updates(&mut self, args: &Value) -> Vec<(String, u8)> {
        let Some(object) = args.as_object() else {
            return Vec::new();
        };
        let mut applied = Vec::new();
        for (name, value) in object {
            let level = value.as_u64().filter(|v| *v <= 100);
            match (self.0.get_mut(name), level) {
                (Some(slot), Some(level)) => {
                    *slot = level as u8;
                    applied.push((name.clone(), level as u8));
                }
                _ => debug!(%name, %value, "rejected personality update"),
            }
        }
        applied
    }

    /// Personality section of the session instructions.
    pub fn instructions(&self) -> String {
        let mut text = String::from("Your personality traits (0-100):\n");
        for (name, value) in self.iter() {
            text.push_str(&format!("- {name}: {} ({value}%)\n", Bucket::of(value).as_str()));
        }
        text
    }

    /// JSON schema of the `update_personality` tool parameters.
    pub fn tool_parameters() -> Value {
        let properties: serde_json::Map<String, Value> = TRAITS
            .iter()
            .map(|t| (t.to_string(), json!({"type": "integer", "minimum": 0, "maximum": 100})))
            .collect();
        json!({"type": "object", "properties": properties})
    }
}

/// Where personality traits survive restarts.
#[cfg_attr(test, automock)]
pub trait PersonaStore: Send + Sync {
    fn load(&self) -> anyhow::Result<PersonalityTraits>;
    fn save(&self, traits: &PersonalityTraits) -> anyhow::Result<()>;
}

/// Traits stored as a JSON object in a single file.
#[derive(Debug, Clone)]
pub struct JsonPersonaStore {
    path: PathBuf,
}

impl JsonPersonaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PersonaStore for JsonPersonaStore {
    fn load(&self) -> anyhow::Result<PersonalityTraits> {
        if !self.path.exists() {
            return Ok(PersonalityTraits::default());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let traits: PersonalityTraits = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(traits.normalized())
    }

    fn save(&self, traits: &PersonalityTraits) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(traits)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

/// Non-persistent store, used when no persona file is configured.
#[derive(Debug, Default)]
pub struct MemoryPersonaStore(Mutex<PersonalityTraits>);

impl PersonaStore for MemoryPersonaStore {
    fn load(&self) -> anyhow::Result<PersonalityTraits> {
        Ok(crate::lock(&self.0).clone())
    }

    fn save(&self, traits: &PersonalityTraits) -> anyhow::Result<()> {
        *crate::lock(&self.0) = traits.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_edges() {
        let cases = [(0, Bucket::Min), (9, Bucket::Min), (10, Bucket::Low), (29, Bucket::Low),
            (30, Bucket::Med), (69, Bucket::Med), (70, Bucket::High), (89, Bucket::High),
            (90, Bucket::Max), (100, Bucket::Max)];
        for (value, bucket) in cases {
            assert_eq!(Bucket::of(value), bucket, "{value}");
        }
    }

    #[test]
    fn only_valid_updates_apply() {
        let mut traits = PersonalityTraits::default();
        let mut applied = traits.apply_updates(&json!({
            "humor": 80,
            "sarcasm": 101,
            "warmth": -3,
            "honesty": 12.5,
            "charisma": 40,
            "verbosity": "high",
            "formality": 0,
        }));
        applied.sort();
        assert_eq!(applied, vec![("formality".to_string(), 0), ("humor".to_string(), 80)]);
        assert_eq!(traits.get("humor"), Some(80));
        assert_eq!(traits.get("sarcasm"), Some(DEFAULT_LEVEL));
        assert_eq!(traits.get("charisma"), None);
    }

    #[test]
    fn non_object_arguments_change_nothing() {
        let mut traits = PersonalityTraits::default();
        assert!(traits.apply_updates(&json!([1, 2])).is_empty());
        assert_eq!(traits, PersonalityTraits::default());
    }

    #[test]
    fn instructions_name_every_bucket() {
        let mut traits = PersonalityTraits::default();
        traits.apply_updates(&json!({"humor": 95, "sarcasm": 5}));
        let text = traits.instructions();
        assert!(text.contains("- humor: max (95%)"));
        assert!(text.contains("- sarcasm: min (5%)"));
        assert!(text.contains("- warmth: med (50%)"));
    }

    #[test]
    fn tool_schema_lists_all_traits() {
        let schema = PersonalityTraits::tool_parameters();
        assert_eq!(schema["properties"].as_object().unwrap().len(), TRAITS.len());
        assert_eq!(schema["properties"]["humor"]["maximum"], 100);
    }

    #[test]
    fn json_store_round_trips_and_fills_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.json");
        let store = JsonPersonaStore::new(&path);
        assert_eq!(store.load().unwrap(), PersonalityTraits::default());

        std::fs::write(&path, r#"{"humor": 90, "mystery": 10}"#).unwrap();
        let mut traits = store.load().unwrap();
        assert_eq!(traits.get("humor"), Some(90));
        assert_eq!(traits.get("mystery"), None);
        assert_eq!(traits.get("warmth"), Some(DEFAULT_LEVEL));

        traits.apply_updates(&json!({"warmth": 20}));
        store.save(&traits).unwrap();
        assert_eq!(store.load().unwrap().get("warmth"), Some(20));
    }

    #[test]
    fn corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(JsonPersonaStore::new(&path).load().is_err());
    }
}
