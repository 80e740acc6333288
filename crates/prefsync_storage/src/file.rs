//! File-backed durable store.

use crate::error::{StorageError, StorageResult};
use crate::slot::DurableStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// A file-backed store.
///
/// The slot document is kept in a single JSON file. Writes go to a
/// sibling temp file first and are renamed into place, so a crash mid
/// write never leaves a half-written slot behind.
///
/// An optional byte capacity models a quota-limited storage area, as with
/// [`super::InMemoryStore`].
///
/// # Example
///
/// ```no_run
/// use prefsync_storage::{DurableStore, FileStore};
/// use serde_json::json;
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("settings.json")).unwrap();
/// store.write(&json!({"menu.width": "220px", "_lastModified": 5})).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    capacity: Option<usize>,
    // Serializes write-rename sequences; reads go through the filesystem.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens a store at the given path.
    ///
    /// The file is not created until the first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the path's parent directory does not exist and
    /// cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            capacity: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Opens a store with a byte capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if parent directories cannot be created.
    pub fn open_with_capacity(path: &Path, capacity: usize) -> StorageResult<Self> {
        let mut store = Self::open(path)?;
        store.capacity = Some(capacity);
        Ok(store)
    }

    /// Returns the path of the slot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.set_extension("json.tmp");
        path
    }
}

impl DurableStore for FileStore {
    fn read(&self) -> StorageResult<Option<Value>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::Corrupted(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn write(&self, document: &Value) -> StorageResult<()> {
        let serialized = document.to_string();

        if let Some(capacity) = self.capacity {
            if serialized.len() > capacity {
                return Err(StorageError::QuotaExceeded {
                    needed: serialized.len(),
                    capacity,
                });
            }
        }

        let _guard = self.write_lock.lock();
        let temp = self.temp_path();
        fs::write(&temp, serialized.as_bytes())?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
