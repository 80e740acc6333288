//! Settings: keys, values, sources and the setting record itself.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in milliseconds since the epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Validates a setting key.
///
/// Keys are globally unique, dot/underscore namespaced strings. A valid
/// key is non-empty, starts with an ASCII letter, and contains only
/// ASCII alphanumerics, `.`, `_` and `-`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidKey`] describing the first violation.
pub fn validate_key(key: &str) -> CoreResult<()> {
    let mut chars = key.chars();
    match chars.next() {
        None => return Err(CoreError::invalid_key("empty key")),
        Some(c) if !c.is_ascii_alphabetic() => {
            return Err(CoreError::invalid_key(format!(
                "key must start with an ASCII letter, got {c:?}"
            )));
        }
        Some(_) => {}
    }

    for c in chars {
        if !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
            return Err(CoreError::invalid_key(format!(
                "key contains invalid character {c:?}"
            )));
        }
    }

    Ok(())
}

/// An opaque, JSON-serializable setting value.
///
/// The engine never interprets values; it only stores and forwards them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingValue(pub serde_json::Value);

impl SettingValue {
    /// Returns the inner JSON value.
    #[must_use]
    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Returns the value as a string slice, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<serde_json::Value> for SettingValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self(serde_json::Value::String(value))
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self(serde_json::Value::Bool(value))
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

/// Which tier a setting was last observed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettingSource {
    /// The in-process cache.
    Cache,
    /// The durable local store.
    Local,
    /// The authoritative remote store.
    Remote,
    /// Another concurrently running engine instance.
    CrossProcess,
}

impl fmt::Display for SettingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingSource::Cache => "cache",
            SettingSource::Local => "local",
            SettingSource::Remote => "remote",
            SettingSource::CrossProcess => "cross-process",
        };
        write!(f, "{name}")
    }
}

/// A single versioned setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    /// Globally unique key.
    pub key: String,
    /// Opaque value.
    pub value: SettingValue,
    /// Milliseconds since epoch of the accepted write.
    pub timestamp: u64,
    /// Tier the setting was last observed from.
    pub source: SettingSource,
}

impl Setting {
    /// Creates a new setting record.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<SettingValue>,
        timestamp: u64,
        source: SettingSource,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys() {
        assert!(validate_key("admin_bar_background").is_ok());
        assert!(validate_key("menu.width").is_ok());
        assert!(validate_key("a").is_ok());
        assert!(validate_key("theme-dark.enabled_v2").is_ok());
    }

    #[test]
    fn invalid_keys() {
        assert!(validate_key("").is_err());
        assert!(validate_key("1leading_digit").is_err());
        assert!(validate_key("_leading_underscore").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("emoji🎨").is_err());
    }

    #[test]
    fn value_conversions() {
        assert_eq!(SettingValue::from("#23282d").as_str(), Some("#23282d"));
        assert_eq!(
            SettingValue::from(true).as_json(),
            &serde_json::Value::Bool(true)
        );
        assert_eq!(SettingValue::from(42i64).to_string(), "42");
    }

    #[test]
    fn source_display() {
        assert_eq!(SettingSource::CrossProcess.to_string(), "cross-process");
        assert_eq!(SettingSource::Remote.to_string(), "remote");
    }

    #[test]
    fn now_ms_is_nonzero() {
        assert!(now_ms() > 0);
    }
}
