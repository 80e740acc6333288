//! Offline/request queue: parks remote saves that cannot currently run.

use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use prefsync_core::SettingValue;
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// Priority of a queued request. Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Drained last; evicted first on overflow.
    Low,
    /// Default priority.
    Normal,
    /// Drained first.
    High,
}

/// A remote save parked because of offline, rate-limit or concurrency
/// budget conditions.
#[derive(Debug)]
pub struct QueuedSave {
    /// The key → value payload to save.
    pub settings: BTreeMap<String, SettingValue>,
    /// Drain priority.
    pub priority: Priority,
    /// When the request was parked.
    pub enqueued_at: Instant,
    /// Attempts already spent on this request.
    pub attempt: u32,
    notify: Option<oneshot::Sender<EngineResult<()>>>,
}

impl QueuedSave {
    /// Resolves the caller's continuation with the final outcome.
    pub fn complete(mut self, result: EngineResult<()>) {
        if let Some(tx) = self.notify.take() {
            // The caller may have dropped the receiver; that is fine.
            let _ = tx.send(result);
        }
    }
}

/// A bounded, priority-ordered FIFO of parked remote saves.
///
/// `enqueue` hands back a receiver that resolves when the request is
/// eventually executed or abandoned. Overflow evicts the oldest
/// low-priority entry first, then the oldest overall; the evicted
/// continuation is rejected with [`EngineError::QueueFull`].
#[derive(Debug)]
pub struct OfflineQueue {
    lanes: Mutex<Lanes>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Lanes {
    high: VecDeque<QueuedSave>,
    normal: VecDeque<QueuedSave>,
    low: VecDeque<QueuedSave>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedSave> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Removes the eviction victim: oldest low-priority entry if any,
    /// otherwise the oldest entry overall.
    fn evict(&mut self) -> Option<QueuedSave> {
        if let Some(victim) = self.low.pop_front() {
            return Some(victim);
        }

        let oldest_normal = self.normal.front().map(|e| e.enqueued_at);
        let oldest_high = self.high.front().map(|e| e.enqueued_at);
        match (oldest_normal, oldest_high) {
            (Some(n), Some(h)) if h < n => self.high.pop_front(),
            (Some(_), _) => self.normal.pop_front(),
            (None, Some(_)) => self.high.pop_front(),
            (None, None) => None,
        }
    }
}

impl OfflineQueue {
    /// Creates a queue with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity,
        }
    }

    /// Parks a save and returns the continuation receiver.
    ///
    /// If the queue is full, an older entry is evicted and its
    /// continuation rejected with [`EngineError::QueueFull`].
    pub fn enqueue(
        &self,
        settings: BTreeMap<String, SettingValue>,
        priority: Priority,
        attempt: u32,
    ) -> oneshot::Receiver<EngineResult<()>> {
        let (tx, rx) = oneshot::channel();
        let entry = QueuedSave {
            settings,
            priority,
            enqueued_at: Instant::now(),
            attempt,
            notify: Some(tx),
        };

        let evicted = {
            let mut lanes = self.lanes.lock();
            let evicted = if lanes.len() >= self.capacity {
                lanes.evict()
            } else {
                None
            };
            lanes.lane_mut(priority).push_back(entry);
            evicted
        };

        if let Some(victim) = evicted {
            debug!(priority = ?victim.priority, "queue full, evicting oldest entry");
            victim.complete(Err(EngineError::QueueFull));
        }

        rx
    }

    /// Pops up to `batch` entries in priority order (FIFO within a
    /// priority).
    pub fn drain(&self, batch: usize) -> Vec<QueuedSave> {
        let mut lanes = self.lanes.lock();
        let mut popped = Vec::new();
        while popped.len() < batch {
            let entry = lanes
                .high
                .pop_front()
                .or_else(|| lanes.normal.pop_front())
                .or_else(|| lanes.low.pop_front());
            match entry {
                Some(entry) => popped.push(entry),
                None => break,
            }
        }
        popped
    }

    /// Returns a drained entry to the head of its lane, preserving its
    /// position for the next drain.
    pub fn requeue_front(&self, entry: QueuedSave) {
        let mut lanes = self.lanes.lock();
        lanes.lane_mut(entry.priority).push_front(entry);
    }

    /// Returns the number of parked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Returns true if no entries are parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects every parked entry, used on shutdown.
    pub fn reject_all(&self, make_error: impl Fn() -> EngineError) {
        let entries: Vec<QueuedSave> = {
            let mut lanes = self.lanes.lock();
            let lanes = &mut *lanes;
            lanes
                .high
                .drain(..)
                .chain(lanes.normal.drain(..))
                .chain(lanes.low.drain(..))
                .collect()
        };
        for entry in entries {
            entry.complete(Err(make_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: &str) -> BTreeMap<String, SettingValue> {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), SettingValue::from("v"));
        map
    }

    fn first_key(entry: &QueuedSave) -> &str {
        entry.settings.keys().next().unwrap()
    }

    #[test]
    fn drains_in_priority_order() {
        let queue = OfflineQueue::new(10);
        queue.enqueue(payload("low"), Priority::Low, 1);
        queue.enqueue(payload("normal"), Priority::Normal, 1);
        queue.enqueue(payload("high"), Priority::High, 1);

        let drained = queue.drain(3);
        let keys: Vec<_> = drained.iter().map(first_key).collect();
        assert_eq!(keys, vec!["high", "normal", "low"]);
    }

    #[test]
    fn fifo_within_priority() {
        let queue = OfflineQueue::new(10);
        queue.enqueue(payload("first"), Priority::Normal, 1);
        queue.enqueue(payload("second"), Priority::Normal, 1);

        let drained = queue.drain(2);
        assert_eq!(first_key(&drained[0]), "first");
        assert_eq!(first_key(&drained[1]), "second");
    }

    #[test]
    fn drain_respects_batch_size() {
        let queue = OfflineQueue::new(10);
        for i in 0..5 {
            queue.enqueue(payload(&format!("k{i}")), Priority::Normal, 1);
        }

        assert_eq!(queue.drain(3).len(), 3);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn overflow_evicts_low_priority_first() {
        let queue = OfflineQueue::new(2);
        let mut low_rx = queue.enqueue(payload("low"), Priority::Low, 1);
        queue.enqueue(payload("high"), Priority::High, 1);
        queue.enqueue(payload("normal"), Priority::Normal, 1);

        // The low entry was evicted and rejected.
        assert!(matches!(
            low_rx.try_recv().unwrap(),
            Err(EngineError::QueueFull)
        ));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn overflow_without_low_evicts_oldest() {
        let queue = OfflineQueue::new(2);
        let mut oldest_rx = queue.enqueue(payload("oldest"), Priority::High, 1);
        queue.enqueue(payload("newer"), Priority::Normal, 1);
        queue.enqueue(payload("newest"), Priority::Normal, 1);

        assert!(matches!(
            oldest_rx.try_recv().unwrap(),
            Err(EngineError::QueueFull)
        ));

        let drained = queue.drain(2);
        let keys: Vec<_> = drained.iter().map(first_key).collect();
        assert_eq!(keys, vec!["newer", "newest"]);
    }

    #[test]
    fn requeue_front_preserves_position() {
        let queue = OfflineQueue::new(10);
        queue.enqueue(payload("first"), Priority::Normal, 1);
        queue.enqueue(payload("second"), Priority::Normal, 1);

        let mut drained = queue.drain(1);
        let entry = drained.remove(0);
        queue.requeue_front(entry);

        let drained = queue.drain(2);
        assert_eq!(first_key(&drained[0]), "first");
        assert_eq!(first_key(&drained[1]), "second");
    }

    #[tokio::test]
    async fn complete_resolves_continuation() {
        let queue = OfflineQueue::new(10);
        let rx = queue.enqueue(payload("k"), Priority::Normal, 1);

        let entry = queue.drain(1).remove(0);
        entry.complete(Ok(()));

        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn reject_all_clears_every_lane() {
        let queue = OfflineQueue::new(10);
        let rx1 = queue.enqueue(payload("a"), Priority::Normal, 1);
        let rx2 = queue.enqueue(payload("b"), Priority::High, 1);
        let rx3 = queue.enqueue(payload("c"), Priority::Low, 1);

        queue.reject_all(|| EngineError::Shutdown);

        assert!(queue.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(EngineError::Shutdown)));
        assert!(matches!(rx2.await.unwrap(), Err(EngineError::Shutdown)));
        assert!(matches!(rx3.await.unwrap(), Err(EngineError::Shutdown)));
    }
}
