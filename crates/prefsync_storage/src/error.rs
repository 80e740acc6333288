//! Error types for durable store operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing the durable slot.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The write would exceed the store's capacity.
    ///
    /// This is the distinguished "quota exceeded" condition; the engine
    /// reacts by switching the session to remote-only persistence.
    #[error("quota exceeded: write of {needed} bytes exceeds capacity {capacity}")]
    QuotaExceeded {
        /// Bytes the write required.
        needed: usize,
        /// The store's capacity in bytes.
        capacity: usize,
    },

    /// The stored document could not be parsed.
    #[error("slot corrupted: {0}")]
    Corrupted(String),

    /// The store rejected the operation for a backend-specific reason.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Returns true if this is the quota-exceeded condition.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_detection() {
        let err = StorageError::QuotaExceeded {
            needed: 2048,
            capacity: 1024,
        };
        assert!(err.is_quota_exceeded());
        assert!(err.to_string().contains("2048"));

        let err = StorageError::Corrupted("bad json".into());
        assert!(!err.is_quota_exceeded());
    }
}
