//! The synchronization engine orchestrator.

use crate::broadcast::{BroadcastMessage, BroadcastPayload, BroadcastTransport, OriginId};
use crate::config::EngineConfig;
use crate::debounce::DebounceBuffer;
use crate::error::{Disposition, EngineError, EngineResult, FailureKind};
use crate::queue::{OfflineQueue, Priority};
use crate::recovery::{FailureContext, RecoveryAction, RecoveryRouter, SettingValidator};
use crate::remote::RemoteStore;
use crate::retry::RetryExecutor;
use parking_lot::{Mutex, RwLock};
use prefsync_core::{
    now_ms, validate_key, CacheStats, ChangeEvent, ChangeFeed, ConflictResolver, Setting,
    SettingSource, SettingValue, SettingsCache, Snapshot,
};
use prefsync_storage::DurableStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
// Rate-limit cooldowns use the tokio clock so they honor paused time in
// tests.
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where writes are durably persisted for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Durable local store and remote store.
    Full,
    /// Remote store only; the durable store is full.
    RemoteOnly,
}

/// Counters describing engine behavior.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Remote flushes that committed.
    pub flushes_completed: u64,
    /// Retry attempts beyond the first, across all flushes.
    pub retries: u64,
    /// Saves parked in the offline queue.
    pub saves_queued: u64,
    /// Conflicting overlays applied by the resolver.
    pub conflicts_resolved: u64,
    /// Loads served from a degraded (non-remote) source.
    pub degraded_loads: u64,
    /// Cross-process messages applied to the cache.
    pub broadcasts_applied: u64,
    /// Last terminal error, if any.
    pub last_error: Option<String>,
}

/// Outcome for one key of a batch save.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    /// The write was accepted as given.
    Saved,
    /// The write was accepted after recovery replaced the value.
    SavedWithFallback,
    /// The write was rejected.
    Rejected(String),
}

/// Result of [`SettingsSyncEngine::save_settings`].
#[derive(Debug)]
pub struct BatchSaveResult {
    /// True if every key was accepted.
    pub success: bool,
    /// Per-key outcomes.
    pub outcomes: BTreeMap<String, KeyOutcome>,
}

struct EngineInner<R, D> {
    config: EngineConfig,
    remote: R,
    store: D,
    cache: SettingsCache,
    buffer: DebounceBuffer,
    queue: OfflineQueue,
    feed: ChangeFeed,
    resolver: ConflictResolver,
    router: RecoveryRouter,
    validator: Option<Arc<dyn SettingValidator>>,
    bus: Option<Arc<dyn BroadcastTransport>>,
    origin: OriginId,
    online: AtomicBool,
    in_flight: AtomicU32,
    rate_limited_until: Mutex<Option<Instant>>,
    persistence_mode: RwLock<PersistenceMode>,
    stats: RwLock<EngineStats>,
    watch_cursor: AtomicU64,
    started: AtomicBool,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds a [`SettingsSyncEngine`] with its optional collaborators.
pub struct EngineBuilder<R, D> {
    config: EngineConfig,
    remote: R,
    store: D,
    validator: Option<Arc<dyn SettingValidator>>,
    bus: Option<Arc<dyn BroadcastTransport>>,
    defaults: BTreeMap<String, SettingValue>,
}

impl<R, D> EngineBuilder<R, D>
where
    R: RemoteStore + 'static,
    D: DurableStore + 'static,
{
    /// Starts a builder from the three required collaborators.
    pub fn new(config: EngineConfig, remote: R, store: D) -> Self {
        Self {
            config,
            remote,
            store,
            validator: None,
            bus: None,
            defaults: BTreeMap::new(),
        }
    }

    /// Attaches a value validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn SettingValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Attaches a cross-process broadcast transport. Without one, the
    /// engine falls back to polling the durable slot.
    #[must_use]
    pub fn with_broadcast(mut self, bus: Arc<dyn BroadcastTransport>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Registers per-key defaults for reset-to-default recovery.
    #[must_use]
    pub fn with_defaults(mut self, defaults: BTreeMap<String, SettingValue>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> SettingsSyncEngine<R, D> {
        let cache = SettingsCache::new(self.config.cache_ttl, self.config.cache_capacity);
        let queue = OfflineQueue::new(self.config.queue.capacity);
        SettingsSyncEngine {
            inner: Arc::new(EngineInner {
                cache,
                queue,
                buffer: DebounceBuffer::new(),
                feed: ChangeFeed::new(),
                resolver: ConflictResolver::new(),
                router: RecoveryRouter::with_defaults(self.defaults),
                validator: self.validator,
                bus: self.bus,
                origin: OriginId::generate(),
                online: AtomicBool::new(true),
                in_flight: AtomicU32::new(0),
                rate_limited_until: Mutex::new(None),
                persistence_mode: RwLock::new(PersistenceMode::Full),
                stats: RwLock::new(EngineStats::default()),
                watch_cursor: AtomicU64::new(0),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                config: self.config,
                remote: self.remote,
                store: self.store,
            }),
        }
    }
}

/// The settings synchronization engine.
///
/// Composes the cache, durable store, remote client, debounce buffer,
/// retry executor, offline queue and broadcast bus. One instance exists
/// per process; instances sharing a broadcast transport (or a durable
/// slot) converge via cross-process messages and conflict resolution.
///
/// Writes are write-through: the cache and durable store are updated
/// before `save_setting` returns, and the remote flush happens after a
/// quiet period (or immediately when requested). The public API never
/// panics; failures resolve to typed errors or degraded results.
pub struct SettingsSyncEngine<R, D> {
    inner: Arc<EngineInner<R, D>>,
}

impl<R, D> Clone for SettingsSyncEngine<R, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, D> SettingsSyncEngine<R, D>
where
    R: RemoteStore + 'static,
    D: DurableStore + 'static,
{
    /// Starts building an engine.
    pub fn builder(config: EngineConfig, remote: R, store: D) -> EngineBuilder<R, D> {
        EngineBuilder::new(config, remote, store)
    }

    /// Creates an engine with no optional collaborators.
    pub fn new(config: EngineConfig, remote: R, store: D) -> Self {
        EngineBuilder::new(config, remote, store).build()
    }

    /// Spawns the background tasks: the periodic queue drain tick, and
    /// either the broadcast listener or the durable-slot watcher.
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a
    /// no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let drain = tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.queue.drain_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                inner.cache.prune_expired();
                inner.drain_queue().await;
            }
        });
        self.inner.tasks.lock().push(drain);

        match &self.inner.bus {
            Some(bus) => {
                let mut rx = bus.subscribe();
                let inner = Arc::clone(&self.inner);
                let listener = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(message) => inner.handle_broadcast(message),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "broadcast listener lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                        if inner.shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                });
                self.inner.tasks.lock().push(listener);
            }
            None => {
                // No broadcast channel available: degrade to polling the
                // durable slot for mutations from other instances.
                let inner = Arc::clone(&self.inner);
                let watcher = tokio::spawn(async move {
                    let mut tick = tokio::time::interval(inner.config.watch_interval);
                    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tick.tick().await;
                        if inner.shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.poll_store_for_changes();
                    }
                });
                self.inner.tasks.lock().push(watcher);
            }
        }
    }

    /// Stops background tasks and rejects every parked request.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.queue.reject_all(|| EngineError::Shutdown);
    }

    /// Saves one setting.
    ///
    /// The cache and durable store are updated before this returns, so
    /// any in-process reader observes the write immediately. With
    /// `immediate`, the remote flush bypasses the debounce timer and the
    /// call resolves only after the flush completed, was parked for
    /// later, or terminally failed. Otherwise the flush is scheduled
    /// after the quiet period.
    ///
    /// Returns `true` when at least one tier accepted the write.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid key, a validation rejection with
    /// no registered default, or a terminal immediate-flush failure.
    pub async fn save_setting(
        &self,
        key: &str,
        value: impl Into<SettingValue>,
        immediate: bool,
    ) -> EngineResult<bool> {
        validate_key(key)?;
        let (value, _fallback) = self.inner.validated_value(key, value.into())?;

        let timestamp = self.inner.accept_write(key, value.clone());
        self.inner.persist_local()?;

        self.inner.feed.emit(ChangeEvent::SettingChanged {
            key: key.to_string(),
            value: value.clone(),
            source: SettingSource::Cache,
        });
        self.inner.publish(
            BroadcastPayload::SettingChanged {
                key: key.to_string(),
                value: value.clone(),
            },
            timestamp,
        );

        if immediate {
            let mut payload = self.inner.buffer.take_all();
            payload.insert(key.to_string(), value);
            self.inner
                .flush_payload(payload, Priority::High, true)
                .await?;
        } else {
            let generation = self.inner.buffer.record(key, value);
            self.arm_debounce(generation);
        }

        Ok(true)
    }

    /// Saves many settings with a partial-success policy: every key is
    /// persisted as far as possible even when others fail, and a durable
    /// store failure does not block the remote attempt (or vice versa).
    pub async fn save_settings(
        &self,
        settings: BTreeMap<String, SettingValue>,
    ) -> BatchSaveResult {
        let mut outcomes = BTreeMap::new();
        let mut accepted = BTreeMap::new();
        let mut last_timestamp = 0;

        for (key, value) in settings {
            if let Err(e) = validate_key(&key) {
                outcomes.insert(key, KeyOutcome::Rejected(e.to_string()));
                continue;
            }
            match self.inner.validated_value(&key, value) {
                Ok((value, fallback)) => {
                    last_timestamp = self.inner.accept_write(&key, value.clone());
                    accepted.insert(key.clone(), value);
                    let outcome = if fallback {
                        KeyOutcome::SavedWithFallback
                    } else {
                        KeyOutcome::Saved
                    };
                    outcomes.insert(key, outcome);
                }
                Err(e) => {
                    outcomes.insert(key, KeyOutcome::Rejected(e.to_string()));
                }
            }
        }

        if !accepted.is_empty() {
            // Local persistence failure must not block the remote attempt.
            if let Err(e) = self.inner.persist_local() {
                warn!(%e, "durable persistence failed during batch save");
            }

            self.inner.feed.emit(ChangeEvent::SettingsBulkUpdate {
                settings: accepted.clone(),
                source: SettingSource::Cache,
            });
            self.inner.publish(
                BroadcastPayload::BulkUpdate {
                    settings: accepted.clone(),
                },
                last_timestamp,
            );

            // wait=false: an offline batch must not block the caller.
            if let Err(e) = self
                .inner
                .flush_payload(accepted, Priority::Normal, false)
                .await
            {
                warn!(%e, "remote flush failed during batch save");
            }
        }

        let success = outcomes
            .values()
            .all(|o| !matches!(o, KeyOutcome::Rejected(_)));
        BatchSaveResult { success, outcomes }
    }

    /// Loads the full settings snapshot.
    ///
    /// Serves the cache when it is fresh and `force_refresh` is false;
    /// otherwise tries remote, then the durable store, then an empty
    /// snapshot. Never fails — degraded-source usage is reported through
    /// the log and [`EngineStats::degraded_loads`].
    pub async fn load_settings(&self, force_refresh: bool) -> Snapshot {
        self.inner.load_settings(force_refresh).await
    }

    /// Forces reconciliation of all three tiers and persists the merged
    /// snapshot to the durable and remote stores.
    ///
    /// Returns `true` when both tiers were persisted now; `false` when
    /// the remote persistence was parked for later.
    ///
    /// # Errors
    ///
    /// Returns a terminal error if the merged snapshot could not be
    /// persisted anywhere.
    pub async fn sync(&self) -> EngineResult<bool> {
        self.inner.sync().await
    }

    /// Subscribes to change events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.inner.feed.subscribe()
    }

    /// Returns cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Clears the in-process cache. Durable and remote tiers are
    /// untouched.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Returns engine statistics.
    pub fn stats(&self) -> EngineStats {
        self.inner.stats.read().clone()
    }

    /// Returns the session persistence mode.
    pub fn persistence_mode(&self) -> PersistenceMode {
        *self.inner.persistence_mode.read()
    }

    /// Returns the number of parked remote saves.
    pub fn queued_saves(&self) -> usize {
        self.inner.queue.len()
    }

    /// Marks the engine online or offline.
    ///
    /// Going online is the connectivity-restored trigger: it drains the
    /// offline queue immediately rather than waiting for the next tick.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if online {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.drain_queue().await;
            });
        }
    }

    /// Returns true if the engine considers itself online.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    fn arm_debounce(&self, generation: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.quiet_period).await;
            let Some(payload) = inner.buffer.take_if_current(generation) else {
                return;
            };
            if payload.is_empty() {
                return;
            }
            if let Err(e) = inner.flush_payload(payload, Priority::Normal, false).await {
                warn!(%e, "debounced flush failed");
            }
        });
    }
}

impl<R, D> EngineInner<R, D>
where
    R: RemoteStore + 'static,
    D: DurableStore + 'static,
{
    /// Runs the optional validator, applying reset-to-default recovery
    /// on rejection. Returns the value to persist and whether it is a
    /// fallback.
    fn validated_value(
        &self,
        key: &str,
        value: SettingValue,
    ) -> EngineResult<(SettingValue, bool)> {
        let Some(validator) = &self.validator else {
            return Ok((value, false));
        };
        match validator.validate(key, &value) {
            Ok(()) => Ok((value, false)),
            Err(message) => {
                let failure = EngineError::Validation {
                    key: key.to_string(),
                    message,
                };
                let outcome = self
                    .router
                    .route_error(&failure, &FailureContext::for_key(key));
                match outcome.action {
                    RecoveryAction::ResetToDefault { value, .. } => Ok((value, true)),
                    _ => Err(failure),
                }
            }
        }
    }

    /// Applies a locally-issued write to the cache with a strictly
    /// increasing timestamp. Returns the assigned timestamp.
    fn accept_write(&self, key: &str, value: SettingValue) -> u64 {
        self.cache
            .insert_successor(Setting::new(key, value, now_ms(), SettingSource::Cache))
    }

    /// Writes the cache snapshot through to the durable slot, merged
    /// over the slot's existing content. Keys that live only in the
    /// slot (never loaded this session, or pruned from the cache) must
    /// survive the write.
    ///
    /// Quota exhaustion switches the session to remote-only persistence
    /// and is not an error: the cache already accepted the write.
    fn persist_local(&self) -> EngineResult<()> {
        if *self.persistence_mode.read() == PersistenceMode::RemoteOnly {
            return Ok(());
        }

        let mut merged = match self.store.read() {
            Ok(Some(existing)) => {
                Snapshot::from_document(&existing, SettingSource::Local).unwrap_or_default()
            }
            _ => Snapshot::new(),
        };
        for (_, setting) in self.cache.snapshot().iter() {
            merged.insert(setting.clone());
        }

        match self.store.write(&merged.to_document()) {
            Ok(()) => {
                // The slot watcher must not re-apply this instance's own
                // writes as cross-process changes.
                self.watch_cursor
                    .fetch_max(merged.last_modified(), Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                let failure = EngineError::Storage(e);
                let outcome = self
                    .router
                    .route_error(&failure, &FailureContext::default());
                if outcome.action == RecoveryAction::SwitchToRemoteOnly {
                    *self.persistence_mode.write() = PersistenceMode::RemoteOnly;
                    return Ok(());
                }
                self.record_error(&failure);
                Err(failure)
            }
        }
    }

    fn publish(&self, payload: BroadcastPayload, timestamp: u64) {
        if let Some(bus) = &self.bus {
            bus.publish(BroadcastMessage {
                payload,
                timestamp,
                origin: self.origin,
            });
        }
    }

    /// Applies a message from another instance without re-broadcasting
    /// and without issuing a remote save.
    fn handle_broadcast(&self, message: BroadcastMessage) {
        if message.origin == self.origin {
            return;
        }

        match message.payload {
            BroadcastPayload::SettingChanged { key, value } => {
                let setting = Setting::new(
                    key.clone(),
                    value.clone(),
                    message.timestamp,
                    SettingSource::CrossProcess,
                );
                if self.cache.apply_if_newer(setting) {
                    self.stats.write().broadcasts_applied += 1;
                    self.feed.emit(ChangeEvent::SettingChanged {
                        key,
                        value,
                        source: SettingSource::CrossProcess,
                    });
                }
            }
            BroadcastPayload::BulkUpdate { settings } => {
                let mut applied = BTreeMap::new();
                for (key, value) in settings {
                    let setting = Setting::new(
                        key.clone(),
                        value.clone(),
                        message.timestamp,
                        SettingSource::CrossProcess,
                    );
                    if self.cache.apply_if_newer(setting) {
                        applied.insert(key, value);
                    }
                }
                if !applied.is_empty() {
                    self.stats.write().broadcasts_applied += 1;
                    self.feed.emit(ChangeEvent::SettingsBulkUpdate {
                        settings: applied,
                        source: SettingSource::CrossProcess,
                    });
                }
            }
        }
    }

    /// Fallback cross-process detection: applies durable-slot mutations
    /// made by other instances.
    fn poll_store_for_changes(&self) {
        let Ok(Some(document)) = self.store.read() else {
            return;
        };
        let Ok(snapshot) = Snapshot::from_document(&document, SettingSource::CrossProcess) else {
            return;
        };

        let seen = self.watch_cursor.load(Ordering::SeqCst);
        if snapshot.last_modified() <= seen {
            return;
        }
        self.watch_cursor
            .fetch_max(snapshot.last_modified(), Ordering::SeqCst);

        let mut applied = BTreeMap::new();
        for (key, setting) in snapshot.iter() {
            if self.cache.apply_if_newer(setting.clone()) {
                applied.insert(key.clone(), setting.value.clone());
            }
        }
        if !applied.is_empty() {
            self.stats.write().broadcasts_applied += 1;
            self.feed.emit(ChangeEvent::SettingsBulkUpdate {
                settings: applied,
                source: SettingSource::CrossProcess,
            });
        }
    }

    fn is_rate_limited(&self) -> bool {
        self.rate_limited_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }

    fn block_rate_limited(&self) {
        *self.rate_limited_until.lock() = Some(Instant::now() + self.config.rate_limit_cooldown);
    }

    fn try_acquire_slot(&self) -> bool {
        let budget = self.config.max_in_flight;
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < budget {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_error(&self, error: &EngineError) {
        self.stats.write().last_error = Some(error.to_string());
    }

    /// Sends a flush through the retry executor, or parks it when it
    /// cannot be attempted (offline, rate-limited, over budget).
    ///
    /// With `wait`, the call resolves only once the save committed or
    /// terminally failed, even if it had to sit in the queue first.
    async fn flush_payload(
        self: &Arc<Self>,
        payload: BTreeMap<String, SettingValue>,
        priority: Priority,
        wait: bool,
    ) -> EngineResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }

        if !self.online.load(Ordering::SeqCst) || self.is_rate_limited() {
            return self.park(payload, priority, 1, wait).await;
        }
        if !self.try_acquire_slot() {
            return self.park(payload, priority, 1, wait).await;
        }

        let result = self.save_to_remote_with_retry(&payload).await;
        self.release_slot();

        match result {
            Ok(server_timestamp) => {
                self.commit_remote(&payload, server_timestamp);
                Ok(())
            }
            Err(e) => match e.disposition() {
                Disposition::Offline => {
                    self.online.store(false, Ordering::SeqCst);
                    self.park(payload, priority, 1, wait).await
                }
                Disposition::RateLimited => {
                    self.block_rate_limited();
                    self.park(payload, priority, 1, wait).await
                }
                Disposition::Retryable => {
                    // Attempts exhausted; the queue keeps the data safe.
                    debug!(%e, "retries exhausted, parking flush");
                    self.park(payload, priority, 1, wait).await
                }
                Disposition::Terminal => {
                    if e.kind() == FailureKind::Conflict {
                        return self.recover_conflicted_flush(payload, priority, wait, e).await;
                    }
                    self.record_error(&e);
                    Err(e)
                }
            },
        }
    }

    /// Handles a server-reported conflict: reconcile the cache against
    /// the remote state and retry the payload once. A second conflict
    /// clears the cache so the caller reloads from authoritative state.
    async fn recover_conflicted_flush(
        self: &Arc<Self>,
        payload: BTreeMap<String, SettingValue>,
        priority: Priority,
        wait: bool,
        failure: EngineError,
    ) -> EngineResult<()> {
        let outcome = self
            .router
            .route_error(&failure, &FailureContext::default());
        if outcome.action != RecoveryAction::ResolveSnapshots {
            self.record_error(&failure);
            return Err(failure);
        }

        if let Ok(Ok(response)) =
            tokio::time::timeout(self.config.request_timeout, self.remote.load_settings()).await
        {
            if response.success {
                let timestamp = response.timestamp.unwrap_or_else(now_ms);
                let remote = Snapshot::from_value_map(
                    &response.data.unwrap_or_default(),
                    timestamp,
                    SettingSource::Remote,
                );
                let resolution =
                    self.resolver
                        .resolve(Some(&self.cache.snapshot()), None, Some(&remote));
                self.stats.write().conflicts_resolved += resolution.conflicts.len() as u64;
                self.cache.replace_with(&resolution.snapshot);
            }
        }

        match self.save_to_remote_with_retry(&payload).await {
            Ok(server_timestamp) => {
                self.commit_remote(&payload, server_timestamp);
                Ok(())
            }
            Err(second) => {
                if second.kind() == FailureKind::Conflict {
                    let outcome = self
                        .router
                        .route_error(&second, &FailureContext::default().after_resolution());
                    if outcome.action == RecoveryAction::ClearCacheAndReload {
                        self.cache.clear();
                    }
                    self.record_error(&second);
                    return Err(second);
                }
                match second.disposition() {
                    Disposition::Offline => {
                        self.online.store(false, Ordering::SeqCst);
                        self.park(payload, priority, 2, wait).await
                    }
                    Disposition::RateLimited => {
                        self.block_rate_limited();
                        self.park(payload, priority, 2, wait).await
                    }
                    Disposition::Retryable => self.park(payload, priority, 2, wait).await,
                    Disposition::Terminal => {
                        self.record_error(&second);
                        Err(second)
                    }
                }
            }
        }
    }

    async fn park(
        &self,
        payload: BTreeMap<String, SettingValue>,
        priority: Priority,
        attempt: u32,
        wait: bool,
    ) -> EngineResult<()> {
        let rx = self.queue.enqueue(payload, priority, attempt);
        self.stats.write().saves_queued += 1;
        if wait {
            rx.await.map_err(|_| EngineError::Shutdown)?
        } else {
            Ok(())
        }
    }

    /// One remote save: payload merged over the last known snapshot,
    /// raced against the request timeout, retried per policy. Returns
    /// the server-assigned timestamp.
    async fn save_to_remote_with_retry(&self, payload: &BTreeMap<String, SettingValue>) -> EngineResult<u64> {
        let mut full = self.cache.snapshot().to_value_map();
        for (key, value) in payload {
            full.insert(key.clone(), value.clone());
        }

        let timeout = self.config.request_timeout;
        let executor = RetryExecutor::new(self.config.retry.clone());
        let response = executor
            .execute(
                |attempt| {
                    if attempt > 1 {
                        self.stats.write().retries += 1;
                    }
                    let full = full.clone();
                    async move {
                        match tokio::time::timeout(timeout, self.remote.save_settings(&full)).await
                        {
                            Ok(Ok(response)) if response.success => Ok(response),
                            Ok(Ok(response)) => {
                                let message = response
                                    .error
                                    .unwrap_or_else(|| "save rejected by server".into());
                                Err(
                                    if FailureKind::from_message(&message, None)
                                        == FailureKind::Conflict
                                    {
                                        EngineError::Conflict(message)
                                    } else {
                                        EngineError::RemoteStore(message)
                                    },
                                )
                            }
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(EngineError::Timeout),
                        }
                    }
                },
                |e| e.disposition(),
            )
            .await?;

        Ok(response.timestamp.unwrap_or_else(now_ms))
    }

    /// Re-synchronizes cache and durable store with the server-assigned
    /// timestamp after a successful flush.
    fn commit_remote(&self, payload: &BTreeMap<String, SettingValue>, server_timestamp: u64) {
        for (key, value) in payload {
            self.cache.apply_if_newer(Setting::new(
                key.clone(),
                value.clone(),
                server_timestamp,
                SettingSource::Remote,
            ));
        }
        self.cache.mark_refreshed();
        if let Err(e) = self.persist_local() {
            warn!(%e, "durable re-sync after remote commit failed");
        }
        self.stats.write().flushes_completed += 1;
    }

    /// Drains a bounded batch from the offline queue. Entries whose
    /// blocking condition has not lifted return to the queue head.
    async fn drain_queue(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        for _ in 0..self.config.queue.drain_batch {
            if !self.online.load(Ordering::SeqCst) || self.is_rate_limited() {
                return;
            }
            let Some(mut entry) = self.queue.drain(1).pop() else {
                return;
            };
            if !self.try_acquire_slot() {
                self.queue.requeue_front(entry);
                return;
            }

            let result = self.save_to_remote_with_retry(&entry.settings).await;
            self.release_slot();

            match result {
                Ok(server_timestamp) => {
                    self.commit_remote(&entry.settings, server_timestamp);
                    entry.complete(Ok(()));
                }
                Err(e) => match e.disposition() {
                    Disposition::Offline => {
                        self.online.store(false, Ordering::SeqCst);
                        self.queue.requeue_front(entry);
                        return;
                    }
                    Disposition::RateLimited => {
                        self.block_rate_limited();
                        self.queue.requeue_front(entry);
                        return;
                    }
                    Disposition::Retryable => {
                        entry.attempt += 1;
                        self.queue.requeue_front(entry);
                        return;
                    }
                    Disposition::Terminal => {
                        self.record_error(&e);
                        entry.complete(Err(e));
                    }
                },
            }
        }
    }

    async fn load_settings(&self, force_refresh: bool) -> Snapshot {
        if !force_refresh && self.cache.is_fresh() {
            return self.cache.snapshot();
        }

        // Remote first.
        if self.online.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.config.request_timeout, self.remote.load_settings())
                .await
            {
                Ok(Ok(response)) if response.success => {
                    let timestamp = response.timestamp.unwrap_or_else(now_ms);
                    let remote = Snapshot::from_value_map(
                        &response.data.unwrap_or_default(),
                        timestamp,
                        SettingSource::Remote,
                    );
                    let resolution = self.resolver.resolve(
                        Some(&self.cache.snapshot()),
                        None,
                        Some(&remote),
                    );
                    self.stats.write().conflicts_resolved += resolution.conflicts.len() as u64;
                    self.cache.replace_with(&resolution.snapshot);
                    return resolution.snapshot;
                }
                Ok(Ok(response)) => {
                    warn!(error = ?response.error, "remote load rejected, falling back to durable store");
                }
                Ok(Err(e)) => {
                    warn!(%e, "remote load failed, falling back to durable store");
                }
                Err(_) => {
                    warn!("remote load timed out, falling back to durable store");
                }
            }
        }
        self.stats.write().degraded_loads += 1;

        // Durable store next.
        match self.store.read() {
            Ok(Some(document)) => {
                if let Ok(local) = Snapshot::from_document(&document, SettingSource::Local) {
                    // Merge rather than replace: the cache may hold writes
                    // fresher than the slot.
                    for (_, setting) in local.iter() {
                        self.cache.apply_if_newer(setting.clone());
                    }
                    return self.cache.snapshot();
                }
                warn!("durable slot is malformed, serving empty snapshot");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%e, "durable store read failed, serving empty snapshot");
            }
        }

        // Last resort: whatever the cache still holds (possibly empty).
        self.cache.snapshot()
    }

    async fn sync(self: &Arc<Self>) -> EngineResult<bool> {
        let cache_snapshot = self.cache.snapshot();

        let local_snapshot = match self.store.read() {
            Ok(Some(document)) => Snapshot::from_document(&document, SettingSource::Local).ok(),
            _ => None,
        };

        let remote_snapshot = if self.online.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.config.request_timeout, self.remote.load_settings())
                .await
            {
                Ok(Ok(response)) if response.success => {
                    let timestamp = response.timestamp.unwrap_or_else(now_ms);
                    Some(Snapshot::from_value_map(
                        &response.data.unwrap_or_default(),
                        timestamp,
                        SettingSource::Remote,
                    ))
                }
                _ => None,
            }
        } else {
            None
        };

        let resolution = self.resolver.resolve(
            Some(&cache_snapshot),
            local_snapshot.as_ref(),
            remote_snapshot.as_ref(),
        );
        self.stats.write().conflicts_resolved += resolution.conflicts.len() as u64;
        self.cache.replace_with(&resolution.snapshot);

        self.persist_local()?;

        let payload = resolution.snapshot.to_value_map();
        match self.flush_payload(payload, Priority::Low, false).await {
            Ok(()) if self.queue.is_empty() => Ok(true),
            Ok(()) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
