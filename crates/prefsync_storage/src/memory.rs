//! In-memory durable store for tests and ephemeral sessions.

use crate::error::{StorageError, StorageResult};
use crate::slot::DurableStore;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

/// An in-memory store.
///
/// Suitable for unit tests, integration tests and sessions that do not
/// need persistence. An optional byte capacity models the quota of a
/// browser-local storage area; writes whose serialized form exceeds it
/// fail with [`StorageError::QuotaExceeded`].
///
/// # Example
///
/// ```rust
/// use prefsync_storage::{DurableStore, InMemoryStore};
/// use serde_json::json;
///
/// let store = InMemoryStore::new();
/// store.write(&json!({"menu.width": "220px", "_lastModified": 5})).unwrap();
/// assert!(store.read().unwrap().is_some());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    slot: RwLock<Option<String>>,
    capacity: Option<usize>,
    fail_writes: AtomicU32,
}

impl InMemoryStore {
    /// Creates an unbounded in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with a byte capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slot: RwLock::new(None),
            capacity: Some(capacity),
            fail_writes: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` writes fail as quota-exceeded.
    ///
    /// Test hook for simulating a full storage area regardless of the
    /// configured capacity.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Returns the raw slot content, if any.
    #[must_use]
    pub fn raw(&self) -> Option<String> {
        self.slot.read().clone()
    }
}

impl DurableStore for InMemoryStore {
    fn read(&self) -> StorageResult<Option<Value>> {
        match self.slot.read().as_deref() {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| StorageError::Corrupted(e.to_string())),
        }
    }

    fn write(&self, document: &Value) -> StorageResult<()> {
        let serialized = document.to_string();

        if self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::QuotaExceeded {
                needed: serialized.len(),
                capacity: self.capacity.unwrap_or(0),
            });
        }

        if let Some(capacity) = self.capacity {
            if serialized.len() > capacity {
                return Err(StorageError::QuotaExceeded {
                    needed: serialized.len(),
                    capacity,
                });
            }
        }

        *self.slot.write() = Some(serialized);
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        *self.slot.write() = None;
        Ok(())
    }
}
