//! # prefsync engine
//!
//! The settings synchronization engine: write-through caching, debounced
//! remote flushes, bounded retry with backoff, an offline queue with
//! priorities, cross-process broadcast and failure recovery routing.
//!
//! The engine composes three tiers:
//! - an in-process cache ([`prefsync_core::SettingsCache`]), always
//!   updated first
//! - a durable local store ([`prefsync_storage::DurableStore`]), written
//!   through synchronously
//! - a remote store ([`RemoteStore`]), flushed after a quiet period or
//!   immediately on request
//!
//! ## Example
//!
//! ```rust,no_run
//! use prefsync_engine::{EngineConfig, MockRemoteStore, SettingsSyncEngine};
//! use prefsync_storage::InMemoryStore;
//!
//! # async fn demo() -> prefsync_engine::EngineResult<()> {
//! let engine = SettingsSyncEngine::new(
//!     EngineConfig::new(),
//!     MockRemoteStore::new(),
//!     InMemoryStore::new(),
//! );
//! engine.start();
//!
//! engine.save_setting("admin_bar_background", "#23282d", false).await?;
//! let snapshot = engine.load_settings(false).await;
//! assert!(snapshot.get("admin_bar_background").is_some());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod config;
mod debounce;
mod engine;
mod error;
mod queue;
mod recovery;
mod remote;
mod retry;

pub use broadcast::{
    BroadcastMessage, BroadcastPayload, BroadcastTransport, LoopbackBus, OriginId,
};
pub use config::{EngineConfig, QueueConfig, RetryPolicy};
pub use debounce::{DebounceBuffer, PendingChange};
pub use engine::{
    BatchSaveResult, EngineBuilder, EngineStats, KeyOutcome, PersistenceMode, SettingsSyncEngine,
};
pub use error::{Disposition, EngineError, EngineResult, FailureKind};
pub use queue::{OfflineQueue, Priority, QueuedSave};
pub use recovery::{
    FailureContext, RecoveryAction, RecoveryOutcome, RecoveryRouter, SettingValidator,
};
pub use remote::{MockRemoteStore, RemoteResponse, RemoteStore, ScriptedFailure};
pub use retry::RetryExecutor;
