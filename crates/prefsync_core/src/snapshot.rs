//! Snapshots: ordered views over a full settings set.

use crate::error::{CoreError, CoreResult};
use crate::setting::{Setting, SettingSource, SettingValue};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Reserved key carrying the snapshot timestamp in the durable document.
pub const LAST_MODIFIED_KEY: &str = "_lastModified";

/// An ordered mapping from setting key to [`Setting`], plus a
/// snapshot-level `last_modified` timestamp.
///
/// Three snapshots exist logically at any time: the cache view, the
/// durable local view, and the remote view. Snapshots are rebuilt on
/// demand and compared by the conflict resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: BTreeMap<String, Setting>,
    last_modified: u64,
}

impl Snapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a snapshot from settings, taking `last_modified` as the
    /// maximum entry timestamp.
    #[must_use]
    pub fn from_settings(settings: impl IntoIterator<Item = Setting>) -> Self {
        let mut snapshot = Self::new();
        for setting in settings {
            snapshot.insert(setting);
        }
        snapshot
    }

    /// Inserts a setting, bumping `last_modified` if the entry is newer.
    pub fn insert(&mut self, setting: Setting) {
        if setting.timestamp > self.last_modified {
            self.last_modified = setting.timestamp;
        }
        self.entries.insert(setting.key.clone(), setting);
    }

    /// Looks up a setting by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Setting> {
        self.entries.get(key)
    }

    /// Returns true if no settings are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the snapshot-level timestamp.
    #[must_use]
    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    /// Overrides the snapshot-level timestamp.
    pub fn set_last_modified(&mut self, timestamp: u64) {
        self.last_modified = timestamp;
    }

    /// Iterates settings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Setting)> {
        self.entries.iter()
    }

    /// Returns a plain key → value map, as sent to the remote store.
    #[must_use]
    pub fn to_value_map(&self) -> BTreeMap<String, SettingValue> {
        self.entries
            .iter()
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect()
    }

    /// Serializes to the durable slot document:
    /// `{ ...settingKey: value, "_lastModified": u64 }`.
    ///
    /// Per-key timestamps are not stored in the slot; the document carries
    /// only the snapshot-level timestamp.
    #[must_use]
    pub fn to_document(&self) -> Value {
        let mut map = Map::new();
        for (key, setting) in &self.entries {
            map.insert(key.clone(), setting.value.0.clone());
        }
        map.insert(LAST_MODIFIED_KEY.into(), Value::from(self.last_modified));
        Value::Object(map)
    }

    /// Deserializes from a durable slot document.
    ///
    /// Every entry is assigned the document's `_lastModified` as its
    /// timestamp, since the slot stores no per-key timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedDocument`] if the document is not a
    /// JSON object.
    pub fn from_document(document: &Value, source: SettingSource) -> CoreResult<Self> {
        let map = document
            .as_object()
            .ok_or_else(|| CoreError::MalformedDocument("expected a JSON object".into()))?;

        let last_modified = map
            .get(LAST_MODIFIED_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut entries = BTreeMap::new();
        for (key, value) in map {
            if key == LAST_MODIFIED_KEY {
                continue;
            }
            entries.insert(
                key.clone(),
                Setting::new(key.clone(), value.clone(), last_modified, source),
            );
        }

        Ok(Self {
            entries,
            last_modified,
        })
    }

    /// Builds a snapshot from a plain value map, stamping every entry
    /// with `timestamp` and `source`.
    #[must_use]
    pub fn from_value_map(
        values: &BTreeMap<String, SettingValue>,
        timestamp: u64,
        source: SettingSource,
    ) -> Self {
        let mut snapshot = Self::new();
        for (key, value) in values {
            snapshot.insert(Setting::new(key.clone(), value.clone(), timestamp, source));
        }
        snapshot
    }
}
