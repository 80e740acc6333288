//! Error types and failure classification for the engine.

use prefsync_core::CoreError;
use prefsync_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level failure (timeout, connection refused).
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// The remote call timed out.
    #[error("remote call timed out")]
    Timeout,

    /// The engine is offline.
    #[error("engine is offline")]
    Offline,

    /// The remote target is rate limited.
    #[error("rate limited by remote store")]
    RateLimited,

    /// The remote store rejected or mangled the request.
    #[error("remote store error: {0}")]
    RemoteStore(String),

    /// A collaborator validator rejected the value.
    #[error("validation failed for {key}: {message}")]
    Validation {
        /// The rejected key.
        key: String,
        /// Validator message.
        message: String,
    },

    /// Divergent writes could not be reconciled.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Durable store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Core data-model failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The offline queue was full and this request was evicted.
    #[error("request queue full, oldest entry evicted")]
    QueueFull,

    /// The engine was shut down while the request was in flight.
    #[error("engine shut down")]
    Shutdown,

    /// Anything that escaped classification.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Classifies this error into a [`FailureKind`].
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Network { .. } | EngineError::Timeout | EngineError::Offline => {
                FailureKind::Network
            }
            EngineError::RateLimited | EngineError::RemoteStore(_) => FailureKind::RemoteStore,
            EngineError::Validation { .. } => FailureKind::Validation,
            EngineError::Conflict(_) => FailureKind::Conflict,
            EngineError::Storage(e) if e.is_quota_exceeded() => FailureKind::StorageQuota,
            EngineError::Storage(_)
            | EngineError::Core(_)
            | EngineError::QueueFull
            | EngineError::Shutdown
            | EngineError::Unknown(_) => FailureKind::Unknown,
        }
    }

    /// Maps this error to a retry [`Disposition`].
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        match self {
            EngineError::Network { .. } | EngineError::Timeout => Disposition::Retryable,
            EngineError::RemoteStore(_) => Disposition::Retryable,
            EngineError::Offline => Disposition::Offline,
            EngineError::RateLimited => Disposition::RateLimited,
            _ => Disposition::Terminal,
        }
    }
}

/// How the retry executor should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry with backoff, up to the attempt limit.
    Retryable,
    /// Propagate immediately without retry.
    Terminal,
    /// Cool the target down and park the request in the queue.
    RateLimited,
    /// Park the request in the queue until connectivity returns.
    Offline,
}

/// The engine's failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, connection refused, offline.
    Network,
    /// 5xx-equivalent or malformed remote payload.
    RemoteStore,
    /// Caller-supplied value rejected by the validator.
    Validation,
    /// Concurrent divergent writes across tiers.
    Conflict,
    /// Durable store write exceeded capacity.
    StorageQuota,
    /// Unclassified.
    Unknown,
}

impl FailureKind {
    /// Classifies a bare failure message, honoring a caller-supplied
    /// context hint before falling back to content inspection.
    ///
    /// Used for failures that arrive as plain strings from the remote
    /// client rather than as typed errors.
    #[must_use]
    pub fn from_message(message: &str, hint: Option<FailureKind>) -> Self {
        if let Some(kind) = hint {
            return kind;
        }

        let lower = message.to_ascii_lowercase();
        if ["timeout", "timed out", "connection", "network", "offline", "unreachable"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            FailureKind::Network
        } else if ["quota", "storage full", "capacity"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            FailureKind::StorageQuota
        } else if ["validation", "invalid value", "rejected"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            FailureKind::Validation
        } else if lower.contains("conflict") {
            FailureKind::Conflict
        } else if ["server error", "500", "502", "503", "malformed", "bad gateway"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            FailureKind::RemoteStore
        } else {
            FailureKind::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping() {
        assert_eq!(EngineError::Timeout.kind(), FailureKind::Network);
        assert_eq!(
            EngineError::RemoteStore("500".into()).kind(),
            FailureKind::RemoteStore
        );
        assert_eq!(
            EngineError::Validation {
                key: "a".into(),
                message: "bad".into()
            }
            .kind(),
            FailureKind::Validation
        );
        assert_eq!(
            EngineError::Storage(StorageError::QuotaExceeded {
                needed: 10,
                capacity: 5
            })
            .kind(),
            FailureKind::StorageQuota
        );
        assert_eq!(
            EngineError::Unknown("?".into()).kind(),
            FailureKind::Unknown
        );
    }

    #[test]
    fn dispositions() {
        assert_eq!(
            EngineError::network("refused").disposition(),
            Disposition::Retryable
        );
        assert_eq!(EngineError::Timeout.disposition(), Disposition::Retryable);
        assert_eq!(EngineError::Offline.disposition(), Disposition::Offline);
        assert_eq!(
            EngineError::RateLimited.disposition(),
            Disposition::RateLimited
        );
        assert_eq!(
            EngineError::Validation {
                key: "a".into(),
                message: "bad".into()
            }
            .disposition(),
            Disposition::Terminal
        );
    }

    #[test]
    fn message_classification() {
        assert_eq!(
            FailureKind::from_message("connection refused", None),
            FailureKind::Network
        );
        assert_eq!(
            FailureKind::from_message("storage quota exceeded", None),
            FailureKind::StorageQuota
        );
        assert_eq!(
            FailureKind::from_message("HTTP 503 service unavailable", None),
            FailureKind::RemoteStore
        );
        assert_eq!(
            FailureKind::from_message("something odd", None),
            FailureKind::Unknown
        );
    }

    #[test]
    fn hint_takes_precedence() {
        assert_eq!(
            FailureKind::from_message("connection refused", Some(FailureKind::Validation)),
            FailureKind::Validation
        );
    }
}
