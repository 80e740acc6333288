//! In-process change feed for observing committed setting writes.
//!
//! UI collaborators subscribe here; the engine itself never depends on a
//! subscriber being present.

use crate::setting::{SettingSource, SettingValue};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// A single change event from the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// One setting was written.
    SettingChanged {
        /// The key that changed.
        key: String,
        /// The new value.
        value: SettingValue,
        /// Tier the write originated from.
        source: SettingSource,
    },
    /// Many settings were written in one batch.
    SettingsBulkUpdate {
        /// The written key → value pairs.
        settings: BTreeMap<String, SettingValue>,
        /// Tier the writes originated from.
        source: SettingSource,
    },
}

/// Distributes change events to any number of subscribers.
///
/// Events are emitted only after the cache accepted the write, in commit
/// order. Disconnected subscribers are dropped on the next emit.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    /// Creates a new change feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the feed.
    ///
    /// Returns a receiver for all future change events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to all subscribers, dropping disconnected ones.
    pub fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn changed(key: &str, value: &str) -> ChangeEvent {
        ChangeEvent::SettingChanged {
            key: key.into(),
            value: SettingValue::from(value),
            source: SettingSource::Cache,
        }
    }

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        let event = changed("a", "1");
        feed.emit(event.clone());

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, event);
    }

    #[test]
    fn multiple_subscribers_each_receive() {
        let feed = ChangeFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        let event = changed("a", "1");
        feed.emit(event.clone());

        assert_eq!(rx1.recv().unwrap(), event);
        assert_eq!(rx2.recv().unwrap(), event);
    }

    #[test]
    fn disconnected_subscribers_are_dropped() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(changed("a", "1"));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn bulk_update_event() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        let mut settings = BTreeMap::new();
        settings.insert("a".to_string(), SettingValue::from("1"));
        settings.insert("b".to_string(), SettingValue::from("2"));
        feed.emit(ChangeEvent::SettingsBulkUpdate {
            settings: settings.clone(),
            source: SettingSource::Remote,
        });

        match rx.recv().unwrap() {
            ChangeEvent::SettingsBulkUpdate { settings: got, source } => {
                assert_eq!(got, settings);
                assert_eq!(source, SettingSource::Remote);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
