//! Three-way conflict resolution across cache, local and remote snapshots.

use crate::setting::{Setting, SettingSource, SettingValue};
use crate::snapshot::Snapshot;

/// A record of one value being replaced during resolution.
///
/// Conflict entries are diagnostic only; they do not affect the merged
/// result.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    /// The key that conflicted.
    pub key: String,
    /// The value that was replaced.
    pub discarded: SettingValue,
    /// Tier the discarded value came from.
    pub discarded_source: SettingSource,
    /// Timestamp of the discarded value.
    pub discarded_timestamp: u64,
    /// The value that won.
    pub applied: SettingValue,
    /// Tier the winning value came from.
    pub applied_source: SettingSource,
    /// Timestamp of the winning value.
    pub applied_timestamp: u64,
}

/// The outcome of a three-way resolution.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// The authoritative merged snapshot.
    pub snapshot: Snapshot,
    /// Overlays that replaced a differing value.
    pub conflicts: Vec<ConflictEntry>,
}

/// Merges up to three candidate snapshots into one authoritative snapshot.
///
/// The policy is **remote-wins-by-recency**:
///
/// 1. start from the cache snapshot;
/// 2. overlay local-store keys whose timestamp exceeds the matching cache
///    key's timestamp, or whose key is absent from cache;
/// 3. overlay every remote key whose timestamp is greater than or equal to
///    the already-resolved value's timestamp.
///
/// The remote store is the cross-process authority, but a fresher local
/// write that has not been flushed yet must not be silently discarded —
/// hence the timestamp gate rather than unconditional remote precedence.
/// A remote value is never lost to a strictly older local or cache value.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolves the three candidate snapshots. Missing tiers are passed as
    /// `None` and skipped.
    #[must_use]
    pub fn resolve(
        &self,
        cache: Option<&Snapshot>,
        local: Option<&Snapshot>,
        remote: Option<&Snapshot>,
    ) -> Resolution {
        let mut resolution = Resolution::default();

        if let Some(cache) = cache {
            for (_, setting) in cache.iter() {
                resolution.snapshot.insert(setting.clone());
            }
        }

        if let Some(local) = local {
            for (key, setting) in local.iter() {
                let newer = match resolution.snapshot.get(key) {
                    Some(existing) => setting.timestamp > existing.timestamp,
                    None => true,
                };
                if newer {
                    Self::overlay(&mut resolution, setting.clone());
                }
            }
        }

        if let Some(remote) = remote {
            for (key, setting) in remote.iter() {
                let wins = match resolution.snapshot.get(key) {
                    Some(existing) => setting.timestamp >= existing.timestamp,
                    None => true,
                };
                if wins {
                    Self::overlay(&mut resolution, setting.clone());
                }
            }
        }

        resolution
    }

    fn overlay(resolution: &mut Resolution, incoming: Setting) {
        if let Some(existing) = resolution.snapshot.get(&incoming.key) {
            if existing.value != incoming.value {
                resolution.conflicts.push(ConflictEntry {
                    key: incoming.key.clone(),
                    discarded: existing.value.clone(),
                    discarded_source: existing.source,
                    discarded_timestamp: existing.timestamp,
                    applied: incoming.value.clone(),
                    applied_source: incoming.source,
                    applied_timestamp: incoming.timestamp,
                });
            }
        }
        resolution.snapshot.insert(incoming);
    }
}
