//! Remote store client abstraction.
//!
//! The remote store exposes exactly two logical operations — load and
//! save — and carries no retry logic of its own; retry, queueing and
//! timeouts are the engine's concern.

use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use prefsync_core::{now_ms, SettingValue};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Response from a remote load or save.
#[derive(Debug, Clone, Default)]
pub struct RemoteResponse {
    /// Whether the operation succeeded on the server.
    pub success: bool,
    /// The settings map (load: full set; save: optional echo).
    pub data: Option<BTreeMap<String, SettingValue>>,
    /// Server-assigned timestamp in milliseconds, if provided.
    pub timestamp: Option<u64>,
    /// Server-side failure message, if any.
    pub error: Option<String>,
}

impl RemoteResponse {
    /// Creates a successful response carrying data and a timestamp.
    #[must_use]
    pub fn success(data: Option<BTreeMap<String, SettingValue>>, timestamp: Option<u64>) -> Self {
        Self {
            success: true,
            data,
            timestamp,
            error: None,
        }
    }

    /// Creates a failed response with a server message.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            timestamp: None,
            error: Some(error.into()),
        }
    }
}

/// A client for the authoritative remote store.
///
/// Transport detail (endpoint, auth) is an external collaborator
/// concern; the engine only needs success/failure and the payload.
/// Implementations must be cheap to call concurrently; the engine
/// bounds in-flight requests itself.
pub trait RemoteStore: Send + Sync {
    /// Loads the full settings map from the server.
    fn load_settings(&self) -> impl Future<Output = EngineResult<RemoteResponse>> + Send;

    /// Saves a settings map to the server.
    fn save_settings(
        &self,
        settings: &BTreeMap<String, SettingValue>,
    ) -> impl Future<Output = EngineResult<RemoteResponse>> + Send;
}

impl<T: RemoteStore> RemoteStore for std::sync::Arc<T> {
    fn load_settings(&self) -> impl Future<Output = EngineResult<RemoteResponse>> + Send {
        (**self).load_settings()
    }

    fn save_settings(
        &self,
        settings: &BTreeMap<String, SettingValue>,
    ) -> impl Future<Output = EngineResult<RemoteResponse>> + Send {
        (**self).save_settings(settings)
    }
}

/// A scripted failure for [`MockRemoteStore`].
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Transport-level network failure.
    Network,
    /// Never responds within any reasonable timeout.
    Hang,
    /// Server-side rate limiting.
    RateLimited,
    /// Connectivity is down.
    Offline,
    /// Server-side version conflict.
    Conflict,
    /// 5xx-equivalent server failure.
    Server(String),
}

impl ScriptedFailure {
    fn into_error(self) -> EngineError {
        match self {
            ScriptedFailure::Network => EngineError::network("connection refused"),
            ScriptedFailure::Hang => EngineError::Timeout,
            ScriptedFailure::RateLimited => EngineError::RateLimited,
            ScriptedFailure::Offline => EngineError::Offline,
            ScriptedFailure::Conflict => EngineError::Conflict("concurrent modification".into()),
            ScriptedFailure::Server(message) => EngineError::RemoteStore(message),
        }
    }
}

/// An in-memory remote store for tests.
///
/// Acts as the server: saves merge into its state, loads return it.
/// Failures can be scripted per call, and an artificial latency can be
/// configured to exercise the engine's timeout race.
#[derive(Debug, Default)]
pub struct MockRemoteStore {
    state: Mutex<BTreeMap<String, SettingValue>>,
    saved_payloads: Mutex<Vec<BTreeMap<String, SettingValue>>>,
    scripted_failures: Mutex<VecDeque<ScriptedFailure>>,
    latency: Mutex<Option<Duration>>,
    clock: AtomicU64,
    load_count: AtomicU64,
    save_count: AtomicU64,
}

impl MockRemoteStore {
    /// Creates an empty mock server.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(now_ms()),
            ..Self::default()
        }
    }

    /// Seeds the server state.
    pub fn seed(&self, settings: BTreeMap<String, SettingValue>) {
        *self.state.lock() = settings;
    }

    /// Scripts failures for upcoming calls, consumed in order.
    pub fn fail_next(&self, failures: Vec<ScriptedFailure>) {
        let mut scripted = self.scripted_failures.lock();
        scripted.extend(failures);
    }

    /// Adds artificial latency before every response.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Returns every payload passed to `save_settings`.
    #[must_use]
    pub fn saved_payloads(&self) -> Vec<BTreeMap<String, SettingValue>> {
        self.saved_payloads.lock().clone()
    }

    /// Returns the number of save calls.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Returns the number of load calls.
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Returns the current server state.
    #[must_use]
    pub fn state(&self) -> BTreeMap<String, SettingValue> {
        self.state.lock().clone()
    }

    async fn respond(&self) -> EngineResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = { self.scripted_failures.lock().pop_front() };
        match scripted {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    /// Advances the server clock past both its previous value and the
    /// wall clock, so assigned timestamps always move forward.
    fn next_timestamp(&self) -> u64 {
        let now = now_ms();
        let previous = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(prev.max(now) + 1)
            })
            .unwrap_or(now);
        previous.max(now) + 1
    }
}

impl RemoteStore for MockRemoteStore {
    async fn load_settings(&self) -> EngineResult<RemoteResponse> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        let data = self.state.lock().clone();
        let timestamp = self.clock.load(Ordering::SeqCst);
        Ok(RemoteResponse::success(Some(data), Some(timestamp)))
    }

    async fn save_settings(
        &self,
        settings: &BTreeMap<String, SettingValue>,
    ) -> EngineResult<RemoteResponse> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;

        self.saved_payloads.lock().push(settings.clone());
        {
            let mut state = self.state.lock();
            for (key, value) in settings {
                state.insert(key.clone(), value.clone());
            }
        }

        let timestamp = self.next_timestamp();
        Ok(RemoteResponse::success(None, Some(timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: &str, value: &str) -> BTreeMap<String, SettingValue> {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), SettingValue::from(value));
        map
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let remote = MockRemoteStore::new();

        let response = remote.save_settings(&payload("a", "1")).await.unwrap();
        assert!(response.success);
        assert!(response.timestamp.is_some());

        let response = remote.load_settings().await.unwrap();
        assert_eq!(response.data.unwrap()["a"].as_str(), Some("1"));
    }

    #[tokio::test]
    async fn scripted_failures_consumed_in_order() {
        let remote = MockRemoteStore::new();
        remote.fail_next(vec![ScriptedFailure::Network]);

        assert!(matches!(
            remote.load_settings().await,
            Err(EngineError::Network { .. })
        ));
        // Next call succeeds.
        assert!(remote.load_settings().await.is_ok());
        assert_eq!(remote.load_count(), 2);
    }

    #[tokio::test]
    async fn server_timestamps_increase() {
        let remote = MockRemoteStore::new();
        let first = remote.save_settings(&payload("a", "1")).await.unwrap();
        let second = remote.save_settings(&payload("a", "2")).await.unwrap();
        assert!(second.timestamp.unwrap() > first.timestamp.unwrap());
    }

    #[tokio::test]
    async fn payloads_are_recorded() {
        let remote = MockRemoteStore::new();
        remote.save_settings(&payload("a", "1")).await.unwrap();
        remote.save_settings(&payload("b", "2")).await.unwrap();

        let recorded = remote.saved_payloads();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1]["b"].as_str(), Some("2"));
    }
}
