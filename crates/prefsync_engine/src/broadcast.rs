//! Cross-process broadcast channel.
//!
//! Committed writes are published on a shared named bus so every other
//! engine instance (one per tab/window) can refresh its cache without a
//! remote round trip. The bus is best-effort: when no transport is
//! available the engine degrades to polling the durable slot instead
//! (see the engine's store watcher).

use prefsync_core::SettingValue;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Identifies the engine instance a message originated from.
///
/// Receivers drop messages carrying their own origin, which prevents
/// broadcast loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginId(Uuid);

impl OriginId {
    /// Generates a fresh origin id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The change a broadcast message describes.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastPayload {
    /// One setting was written.
    SettingChanged {
        /// The key that changed.
        key: String,
        /// The new value.
        value: SettingValue,
    },
    /// Many settings were written in one batch.
    BulkUpdate {
        /// The written key → value pairs.
        settings: BTreeMap<String, SettingValue>,
    },
}

/// A message on the cross-process channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    /// What changed.
    pub payload: BroadcastPayload,
    /// Timestamp of the committed write, milliseconds since epoch.
    pub timestamp: u64,
    /// The instance that committed the write.
    pub origin: OriginId,
}

/// A transport carrying broadcast messages between engine instances.
pub trait BroadcastTransport: Send + Sync {
    /// Publishes a message to every other instance. Best effort: a
    /// transport with no listeners silently drops the message.
    fn publish(&self, message: BroadcastMessage);

    /// Subscribes to messages from all instances (including self;
    /// receivers filter by origin).
    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage>;
}

/// An in-process bus connecting engine instances within one process.
///
/// Clones share the same underlying channel, so cloning the bus into
/// each engine instance models tabs sharing one named channel.
#[derive(Debug, Clone)]
pub struct LoopbackBus {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl LoopbackBus {
    /// Creates a bus buffering up to `capacity` undelivered messages per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(128)
    }
}

impl BroadcastTransport for LoopbackBus {
    fn publish(&self, message: BroadcastMessage) {
        // An error only means no live subscribers.
        let _ = self.sender.send(message);
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(origin: OriginId, key: &str) -> BroadcastMessage {
        BroadcastMessage {
            payload: BroadcastPayload::SettingChanged {
                key: key.into(),
                value: SettingValue::from("v"),
            },
            timestamp: 1,
            origin,
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = LoopbackBus::default();
        let mut rx = bus.subscribe();

        let origin = OriginId::generate();
        bus.publish(message(origin, "a"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.origin, origin);
        assert!(matches!(
            received.payload,
            BroadcastPayload::SettingChanged { ref key, .. } if key == "a"
        ));
    }

    #[tokio::test]
    async fn clones_share_the_channel() {
        let bus = LoopbackBus::default();
        let other_tab = bus.clone();
        let mut rx = other_tab.subscribe();

        bus.publish(message(OriginId::generate(), "a"));
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn all_subscribers_receive() {
        let bus = LoopbackBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(message(OriginId::generate(), "a"));
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = LoopbackBus::default();
        bus.publish(message(OriginId::generate(), "a"));
    }

    #[test]
    fn origin_ids_are_unique() {
        assert_ne!(OriginId::generate(), OriginId::generate());
    }
}
