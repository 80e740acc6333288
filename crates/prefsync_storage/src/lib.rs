//! # prefsync storage
//!
//! Durable store adapters for prefsync.
//!
//! This crate provides:
//! - The [`DurableStore`] trait: a single named JSON slot with atomic
//!   replacement and a distinguished quota-exceeded error
//! - [`InMemoryStore`] for tests and ephemeral sessions
//! - [`FileStore`] for persistence across restarts

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod slot;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use slot::DurableStore;
