//! Error types for prefsync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The setting key is not a valid key.
    #[error("invalid setting key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable slot document has an unexpected shape.
    #[error("malformed settings document: {0}")]
    MalformedDocument(String),
}

impl CoreError {
    /// Creates an invalid-key error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_key_display() {
        let err = CoreError::invalid_key("empty key");
        assert_eq!(err.to_string(), "invalid setting key: empty key");
    }
}
