use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use crate::utils::{clamp_speed, finite_number};

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 16.0;
pub const NORMAL_SPEED: f64 = 1.0;
pub const DEFAULT_PREFERRED_SPEED: f64 = 1.8;

pub const PREFERRED_SPEED_KEY: &str = "preferredSpeed";
pub const SHORTCUT_KEYS_KEY: &str = "shortcutKeys";

pub fn clamp_to_range(speed: f64) -> f64 {
    clamp_speed(speed, MIN_SPEED, MAX_SPEED)
}

pub fn normalize_shortcut_key(raw: &str) -> Option<char> {
    let mut chars = raw.chars();
    let (Some(key), None) = (chars.next(), chars.next()) else {
        return None;
    };
    if key.is_whitespace() || key.is_control() {
        return None;
    }
    key.to_lowercase().next()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutBindings {
    pub decrease: char,
    pub increase: char,
    pub toggle: char,
}

impl Default for ShortcutBindings {
    fn default() -> Self {
        Self {
            decrease: ',',
            increase: '.',
            toggle: 'r',
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawShortcutBindings {
    decrease: String,
    increase: String,
    toggle: String,
}

impl ShortcutBindings {
    pub fn parse(decrease: &str, increase: &str, toggle: &str) -> anyhow::Result<Self> {
        let normalize = |raw: &str| {
            normalize_shortcut_key(raw)
                .ok_or_else(|| anyhow!("Shortcut '{raw}' must be exactly one key"))
        };
        let bindings = Self {
            decrease: normalize(decrease)?,
            increase: normalize(increase)?,
            toggle: normalize(toggle)?,
        };

        if bindings.decrease == bindings.increase
            || bindings.decrease == bindings.toggle
            || bindings.increase == bindings.toggle
        {
            return Err(anyhow!("Each shortcut must use a different key"));
        }
        Ok(bindings)
    }

    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        let raw: RawShortcutBindings =
            serde_json::from_value(value.clone()).context("Malformed shortcut keys")?;
        Self::parse(&raw.decrease, &raw.increase, &raw.toggle)
    }

    pub fn to_value(self) -> Value {
        json!({
            "decrease": self.decrease.to_string(),
            "increase": self.increase.to_string(),
            "toggle": self.toggle.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preferences {
    pub preferred_speed: f64,
    pub shortcuts: ShortcutBindings,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            preferred_speed: DEFAULT_PREFERRED_SPEED,
            shortcuts: ShortcutBindings::default(),
        }
    }
}

impl Preferences {
    fn from_stored(values: &Map<String, Value>) -> Self {
        let preferred_speed = values
            .get(PREFERRED_SPEED_KEY)
            .and_then(finite_number)
            .map(clamp_to_range)
            .unwrap_or(DEFAULT_PREFERRED_SPEED);

        let shortcuts = match values.get(SHORTCUT_KEYS_KEY) {
            Some(value) => ShortcutBindings::from_value(value).unwrap_or_else(|err| {
                log::warn!("Ignoring stored shortcut keys: {err:#}");
                ShortcutBindings::default()
            }),
            None => ShortcutBindings::default(),
        };

        Self {
            preferred_speed,
            shortcuts,
        }
    }

    fn to_stored(self) -> Map<String, Value> {
        let mut values = Map::new();
        values.insert(PREFERRED_SPEED_KEY.to_string(), json!(self.preferred_speed));
        values.insert(SHORTCUT_KEYS_KEY.to_string(), self.shortcuts.to_value());
        values
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PreferenceUpdate {
    pub preferred_speed: Option<f64>,
    pub shortcuts: Option<ShortcutBindings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceChange {
    pub key: String,
    pub new_value: Value,
}

pub struct PreferenceStore {
    path: Option<PathBuf>,
    values: Mutex<Map<String, Value>>,
    changes: broadcast::Sender<PreferenceChange>,
}

impl PreferenceStore {
    const CHANGE_CAPACITY: usize = 32;

    fn with_values(path: Option<PathBuf>, values: Map<String, Value>) -> Self {
        let (changes, _) = broadcast::channel(Self::CHANGE_CAPACITY);
        Self {
            path,
            values: Mutex::new(values),
            changes,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_values(None, Preferences::default().to_stored())
    }

    /// Opens the preference file, seeding it with defaults if it doesn't exist yet.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let values: Map<String, Value> = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse preferences {}", path.display()))?;
                Ok(Self::with_values(Some(path), values))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::info!(
                    "No preferences at {}; seeding defaults",
                    path.display()
                );
                let defaults = Preferences::default().to_stored();
                let store = Self::with_values(Some(path), defaults.clone());
                store.persist(&defaults).await?;
                Ok(store)
            }
            Err(err) => Err(err)
                .with_context(|| format!("Failed to read preferences {}", path.display())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreferenceChange> {
        self.changes.subscribe()
    }

    pub async fn get(&self) -> anyhow::Result<Preferences> {
        Ok(Preferences::from_stored(&self.values.lock()))
    }

    /// Persists first; memory and subscribers only see values that were written.
    pub async fn set(&self, update: PreferenceUpdate) -> anyhow::Result<Preferences> {
        let mut changes = Vec::new();
        if let Some(speed) = update.preferred_speed {
            let speed = if speed.is_finite() {
                clamp_to_range(speed)
            } else {
                DEFAULT_PREFERRED_SPEED
            };
            changes.push(PreferenceChange {
                key: PREFERRED_SPEED_KEY.to_string(),
                new_value: json!(speed),
            });
        }
        if let Some(shortcuts) = update.shortcuts {
            // Callers may have built the struct by hand.
            let shortcuts = ShortcutBindings::parse(
                &shortcuts.decrease.to_string(),
                &shortcuts.increase.to_string(),
                &shortcuts.toggle.to_string(),
            )?;
            changes.push(PreferenceChange {
                key: SHORTCUT_KEYS_KEY.to_string(),
                new_value: shortcuts.to_value(),
            });
        }

        let mut updated = self.values.lock().clone();
        for change in &changes {
            updated.insert(change.key.clone(), change.new_value.clone());
        }
        self.persist(&updated).await?;
        *self.values.lock() = updated;

        for change in changes {
            // No subscribers is not an error.
            let _ = self.changes.send(change);
        }
        self.get().await
    }

    async fn persist(&self, values: &Map<String, Value>) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents =
            serde_json::to_string_pretty(values).context("Failed to serialize preferences")?;
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write preferences {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn should_normalize_single_keys() {
        assert_eq!(normalize_shortcut_key("R"), Some('r'));
        assert_eq!(normalize_shortcut_key(","), Some(','));
        assert_eq!(normalize_shortcut_key(""), None);
        assert_eq!(normalize_shortcut_key("ab"), None);
        assert_eq!(normalize_shortcut_key(" "), None);
        assert_eq!(normalize_shortcut_key("Enter"), None);
    }

    #[test]
    fn should_reject_duplicate_bindings() {
        // when
        let result = ShortcutBindings::parse("a", "A", "c");

        // then
        assert!(result.is_err());
    }

    #[test]
    fn should_parse_bindings_from_json() {
        // given
        let value = json!({ "decrease": "Z", "increase": "x", "toggle": "c" });

        // when
        let bindings = ShortcutBindings::from_value(&value).unwrap();

        // then
        assert_eq!(
            bindings,
            ShortcutBindings {
                decrease: 'z',
                increase: 'x',
                toggle: 'c'
            }
        );
    }

    #[test]
    fn should_fall_back_to_defaults_for_malformed_values() {
        // given
        let mut values = Map::new();
        values.insert(PREFERRED_SPEED_KEY.to_string(), json!("fast"));
        values.insert(
            SHORTCUT_KEYS_KEY.to_string(),
            json!({ "decrease": "a", "increase": "a", "toggle": "b" }),
        );

        // when
        let prefs = Preferences::from_stored(&values);

        // then
        assert_eq!(prefs, Preferences::default());
    }

    #[test]
    fn should_clamp_stored_speed() {
        // given
        let mut values = Map::new();
        values.insert(PREFERRED_SPEED_KEY.to_string(), json!(42.0));

        // when
        let prefs = Preferences::from_stored(&values);

        // then
        assert_eq!(prefs.preferred_speed, MAX_SPEED);
    }

    #[tokio::test]
    async fn should_seed_defaults_when_file_is_missing() {
        // given
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");

        // when
        let store = PreferenceStore::open(&path).await.unwrap();

        // then
        assert_eq!(store.get().await.unwrap(), Preferences::default());
        let persisted: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(persisted[PREFERRED_SPEED_KEY], json!(DEFAULT_PREFERRED_SPEED));
    }

    #[tokio::test]
    async fn should_return_error_on_invalid_file() {
        // given
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "{ not json").unwrap();

        // when
        let result = PreferenceStore::open(&path).await;

        // then
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn should_persist_and_notify_changes() {
        // given
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        let store = PreferenceStore::open(&path).await.unwrap();
        let mut changes = store.subscribe();

        // when
        let saved = store
            .set(PreferenceUpdate {
                preferred_speed: Some(99.0),
                shortcuts: None,
            })
            .await
            .unwrap();

        // then
        assert_eq!(saved.preferred_speed, MAX_SPEED);
        assert_eq!(
            changes.recv().await.unwrap(),
            PreferenceChange {
                key: PREFERRED_SPEED_KEY.to_string(),
                new_value: json!(MAX_SPEED)
            }
        );
        let reopened = PreferenceStore::open(&path).await.unwrap();
        assert_eq!(reopened.get().await.unwrap().preferred_speed, MAX_SPEED);
    }

    #[tokio::test]
    async fn should_keep_previous_values_when_write_fails() {
        // given
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        let store = PreferenceStore::open(&path).await.unwrap();
        let mut changes = store.subscribe();
        std::fs::remove_dir_all(dir.path()).unwrap();

        // when
        let result = store
            .set(PreferenceUpdate {
                preferred_speed: Some(3.0),
                shortcuts: None,
            })
            .await;

        // then
        assert!(result.is_err());
        assert_eq!(
            store.get().await.unwrap().preferred_speed,
            DEFAULT_PREFERRED_SPEED
        );
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn should_reject_duplicate_shortcuts_on_set() {
        // given
        let store = PreferenceStore::in_memory();

        // when
        let result = store
            .set(PreferenceUpdate {
                preferred_speed: None,
                shortcuts: Some(ShortcutBindings {
                    decrease: 'a',
                    increase: 'a',
                    toggle: 'b',
                }),
            })
            .await;

        // then
        assert!(result.is_err());
        assert_eq!(
            store.get().await.unwrap().shortcuts,
            ShortcutBindings::default()
        );
    }
}
