//! # prefsync core
//!
//! Data model, conflict resolution and caching for the prefsync
//! settings synchronization engine.
//!
//! This crate provides:
//! - Setting records (key validation, opaque JSON values, source tiers)
//! - Ordered snapshots and the durable slot document format
//! - Three-way timestamp-gated conflict resolution
//! - A bounded TTL cache with hit/miss/eviction stats
//! - An in-process change feed for UI collaborators
//!
//! ## Key Invariants
//!
//! - A setting's timestamp strictly increases with each accepted write
//! - Conflict resolution never loses a remote value to a strictly older
//!   local or cache value
//! - TTL expiry prunes the cache only, never durable or remote state

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod error;
mod events;
mod resolver;
mod setting;
mod snapshot;

pub use cache::{CacheStats, SettingsCache};
pub use error::{CoreError, CoreResult};
pub use events::{ChangeEvent, ChangeFeed};
pub use resolver::{ConflictEntry, ConflictResolver, Resolution};
pub use setting::{now_ms, validate_key, Setting, SettingSource, SettingValue};
pub use snapshot::{Snapshot, LAST_MODIFIED_KEY};
