//! Durable store trait definition.

use crate::error::StorageResult;
use serde_json::Value;

/// A durable local store holding a single named JSON slot.
///
/// The slot contains the settings document
/// `{ ...settingKey: value, "_lastModified": u64 }`. Stores are **opaque
/// document holders**: they do not interpret setting keys or values, and
/// they report capacity exhaustion as a distinguished error so callers
/// can degrade to remote-only persistence.
///
/// # Invariants
///
/// - `write` replaces the whole slot atomically: a reader never observes
///   a partially written document
/// - `read` returns exactly the last successfully written document
/// - Stores must be `Send + Sync` for shared access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For tests and ephemeral sessions
/// - [`super::FileStore`] - For persistence across restarts
pub trait DurableStore: Send + Sync {
    /// Reads the slot document.
    ///
    /// Returns `None` if nothing has been written yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot exists but cannot be read or parsed.
    fn read(&self) -> StorageResult<Option<Value>>;

    /// Replaces the slot with a new document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::QuotaExceeded`] if the serialized
    /// document does not fit the store's capacity, or an I/O error if the
    /// write fails.
    fn write(&self, document: &Value) -> StorageResult<()>;

    /// Removes the slot entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    fn clear(&self) -> StorageResult<()>;
}

impl<T: DurableStore + ?Sized> DurableStore for std::sync::Arc<T> {
    fn read(&self) -> StorageResult<Option<Value>> {
        (**self).read()
    }

    fn write(&self, document: &Value) -> StorageResult<()> {
        (**self).write(document)
    }

    fn clear(&self) -> StorageResult<()> {
        (**self).clear()
    }
}
