//! Bounded, TTL-evicting in-process settings cache.

use crate::setting::Setting;
use crate::snapshot::Snapshot;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Counters describing cache behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry).
    pub misses: u64,
    /// Entries dropped because the cache was full.
    pub evictions: u64,
    /// Entries dropped because their TTL expired.
    pub expired: u64,
    /// Current number of live entries.
    pub entries: usize,
}

#[derive(Debug, Clone)]
struct CachedEntry {
    setting: Setting,
    inserted_at: Instant,
}

#[derive(Debug)]
struct CacheState {
    entries: BTreeMap<String, CachedEntry>,
    last_refreshed: Option<Instant>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

/// The in-process settings cache.
///
/// The cache is the source of truth for the current session: writes land
/// here first (write-through), reads are served from here while fresh.
/// Entries older than the TTL are pruned from the cache only — never from
/// the durable or remote stores. Capacity is bounded; when full, the
/// oldest-inserted entry is evicted.
#[derive(Debug)]
pub struct SettingsCache {
    state: RwLock<CacheState>,
    ttl: Duration,
    max_entries: usize,
}

impl SettingsCache {
    /// Creates a cache with the given TTL and capacity.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: BTreeMap::new(),
                last_refreshed: None,
                hits: 0,
                misses: 0,
                evictions: 0,
                expired: 0,
            }),
            ttl,
            max_entries,
        }
    }

    /// Inserts or replaces a setting unconditionally.
    pub fn insert(&self, setting: Setting) {
        let mut state = self.state.write();
        Self::evict_if_full(&mut state, self.max_entries, &setting.key);
        state.entries.insert(
            setting.key.clone(),
            CachedEntry {
                setting,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Inserts a setting only if it is newer than the cached entry.
    ///
    /// Used for cross-process and remote updates, where an older message
    /// must not reorder a fresher in-process write. Returns true if the
    /// setting was applied.
    pub fn apply_if_newer(&self, setting: Setting) -> bool {
        let mut state = self.state.write();
        if let Some(existing) = state.entries.get(&setting.key) {
            if setting.timestamp <= existing.setting.timestamp {
                return false;
            }
        }
        Self::evict_if_full(&mut state, self.max_entries, &setting.key);
        state.entries.insert(
            setting.key.clone(),
            CachedEntry {
                setting,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Looks up a live setting, counting the hit or miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Setting> {
        let mut state = self.state.write();
        match state.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                let setting = entry.setting.clone();
                state.hits += 1;
                Some(setting)
            }
            Some(_) => {
                state.entries.remove(key);
                state.expired += 1;
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Inserts a locally-issued write, bumping its timestamp past any
    /// existing entry for the key. Returns the assigned timestamp.
    ///
    /// The compare and the insert happen under one write lock, so
    /// concurrent writers to the same key never receive equal
    /// timestamps.
    pub fn insert_successor(&self, mut setting: Setting) -> u64 {
        let mut state = self.state.write();
        if let Some(existing) = state.entries.get(&setting.key) {
            if setting.timestamp <= existing.setting.timestamp {
                setting.timestamp = existing.setting.timestamp + 1;
            }
        }
        let timestamp = setting.timestamp;
        Self::evict_if_full(&mut state, self.max_entries, &setting.key);
        state.entries.insert(
            setting.key.clone(),
            CachedEntry {
                setting,
                inserted_at: Instant::now(),
            },
        );
        timestamp
    }

    /// Builds a snapshot of all live entries.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        Snapshot::from_settings(
            state
                .entries
                .values()
                .filter(|e| e.inserted_at.elapsed() < self.ttl)
                .map(|e| e.setting.clone()),
        )
    }

    /// Replaces the entire cache content with a snapshot and marks the
    /// cache freshly refreshed.
    pub fn replace_with(&self, snapshot: &Snapshot) {
        let mut state = self.state.write();
        let now = Instant::now();
        state.entries = snapshot
            .iter()
            .map(|(key, setting)| {
                (
                    key.clone(),
                    CachedEntry {
                        setting: setting.clone(),
                        inserted_at: now,
                    },
                )
            })
            .collect();
        state.last_refreshed = Some(now);
    }

    /// Marks the cache as freshly refreshed without changing entries.
    pub fn mark_refreshed(&self) {
        self.state.write().last_refreshed = Some(Instant::now());
    }

    /// Returns true if the cache has been refreshed within the TTL.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.state
            .read()
            .last_refreshed
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Drops all expired entries. Returns the number pruned.
    pub fn prune_expired(&self) -> usize {
        let mut state = self.state.write();
        let ttl = self.ttl;
        let before = state.entries.len();
        state.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        let pruned = before - state.entries.len();
        state.expired += pruned as u64;
        pruned
    }

    /// Clears all entries and the freshness marker. Counters survive.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.last_refreshed = None;
    }

    /// Returns a stats snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expired: state.expired,
            entries: state.entries.len(),
        }
    }

    fn evict_if_full(state: &mut CacheState, max_entries: usize, incoming_key: &str) {
        if state.entries.len() < max_entries || state.entries.contains_key(incoming_key) {
            return;
        }
        // Evict the oldest-inserted entry.
        if let Some(oldest) = state
            .entries
            .iter()
            .min_by_key(|(_, e)| e.inserted_at)
            .map(|(k, _)| k.clone())
        {
            state.entries.remove(&oldest);
            state.evictions += 1;
        }
    }
}
