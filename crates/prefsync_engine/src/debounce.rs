//! Debounce buffer: coalesces bursts of field writes into one flush.

use parking_lot::Mutex;
use prefsync_core::SettingValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A write waiting in the debounce buffer.
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// The key to write.
    pub key: String,
    /// The value to write.
    pub value: SettingValue,
    /// When the write entered the buffer.
    pub enqueued_at: Instant,
}

/// The single pending-changes buffer behind the quiet-period timer.
///
/// Each accepted write overwrites any earlier pending value for the same
/// key and bumps the generation counter. The engine schedules one sleep
/// per write; when a sleep expires, only the task holding the latest
/// generation actually flushes — earlier timers observe a newer
/// generation and do nothing. Immediate flushes bump the generation so
/// every outstanding timer goes stale.
#[derive(Debug, Default)]
pub struct DebounceBuffer {
    pending: Mutex<BTreeMap<String, PendingChange>>,
    generation: AtomicU64,
}

impl DebounceBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a write, superseding any pending value for the key.
    ///
    /// Returns the new generation; the caller arms a timer bound to it.
    pub fn record(&self, key: impl Into<String>, value: SettingValue) -> u64 {
        let key = key.into();
        let mut pending = self.pending.lock();
        pending.insert(
            key.clone(),
            PendingChange {
                key,
                value,
                enqueued_at: Instant::now(),
            },
        );
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Bumps the generation without touching the buffer, invalidating
    /// every armed timer.
    pub fn invalidate_timers(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Atomically takes the buffer content if `generation` is still
    /// current, leaving an empty buffer behind.
    ///
    /// Returns `None` when a later write or an immediate flush superseded
    /// this timer.
    pub fn take_if_current(&self, generation: u64) -> Option<BTreeMap<String, SettingValue>> {
        let mut pending = self.pending.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        let taken = std::mem::take(&mut *pending);
        Some(
            taken
                .into_iter()
                .map(|(key, change)| (key, change.value))
                .collect(),
        )
    }

    /// Takes the buffer content unconditionally (immediate flush path),
    /// invalidating all armed timers.
    pub fn take_all(&self) -> BTreeMap<String, SettingValue> {
        let mut pending = self.pending.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let taken = std::mem::take(&mut *pending);
        taken
            .into_iter()
            .map(|(key, change)| (key, change.value))
            .collect()
    }

    /// Returns the number of distinct pending keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_writes_to_same_key() {
        let buffer = DebounceBuffer::new();
        buffer.record("color", SettingValue::from("#111111"));
        buffer.record("color", SettingValue::from("#222222"));
        buffer.record("color", SettingValue::from("#333333"));

        assert_eq!(buffer.len(), 1);
        let taken = buffer.take_all();
        assert_eq!(taken["color"].as_str(), Some("#333333"));
    }

    #[test]
    fn distinct_keys_accumulate() {
        let buffer = DebounceBuffer::new();
        buffer.record("a", SettingValue::from("1"));
        buffer.record("b", SettingValue::from("2"));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn take_if_current_with_live_generation() {
        let buffer = DebounceBuffer::new();
        let generation = buffer.record("a", SettingValue::from("1"));

        let taken = buffer.take_if_current(generation).unwrap();
        assert_eq!(taken.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn stale_generation_takes_nothing() {
        let buffer = DebounceBuffer::new();
        let first = buffer.record("a", SettingValue::from("1"));
        buffer.record("a", SettingValue::from("2"));

        assert!(buffer.take_if_current(first).is_none());
        // The newer write is still pending.
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn invalidate_timers_stales_all_generations() {
        let buffer = DebounceBuffer::new();
        let generation = buffer.record("a", SettingValue::from("1"));
        buffer.invalidate_timers();

        assert!(buffer.take_if_current(generation).is_none());
    }

    #[test]
    fn take_all_invalidates_armed_timers() {
        let buffer = DebounceBuffer::new();
        let generation = buffer.record("a", SettingValue::from("1"));

        let taken = buffer.take_all();
        assert_eq!(taken.len(), 1);
        assert!(buffer.take_if_current(generation).is_none());
    }
}
