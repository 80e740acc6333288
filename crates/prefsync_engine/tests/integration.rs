//! Multi-instance integration tests: broadcast convergence, the durable
//! slot watcher fallback, and persistence across restarts.

use prefsync_core::{ChangeEvent, SettingSource};
use prefsync_engine::{
    EngineConfig, LoopbackBus, MockRemoteStore, RemoteStore, RetryPolicy, ScriptedFailure,
    SettingsSyncEngine,
};
use prefsync_storage::{DurableStore, FileStore, InMemoryStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Surfaces engine tracing in failed-test output.
fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config() -> EngineConfig {
    init_logging();
    EngineConfig::new().with_retry(RetryPolicy::new(3).with_base_delay(Duration::from_millis(10)))
}

type TabEngine = SettingsSyncEngine<Arc<MockRemoteStore>, Arc<InMemoryStore>>;

/// Two engines sharing one remote store and one broadcast bus, each with
/// its own cache and durable slot. Models two tabs of the same app.
fn two_tabs() -> (TabEngine, TabEngine, Arc<MockRemoteStore>) {
    let remote = Arc::new(MockRemoteStore::new());
    let bus = Arc::new(LoopbackBus::default());

    let tab_a = SettingsSyncEngine::builder(
        config(),
        Arc::clone(&remote),
        Arc::new(InMemoryStore::new()),
    )
    .with_broadcast(bus.clone())
    .build();
    let tab_b = SettingsSyncEngine::builder(
        config(),
        Arc::clone(&remote),
        Arc::new(InMemoryStore::new()),
    )
    .with_broadcast(bus)
    .build();

    tab_a.start();
    tab_b.start();
    (tab_a, tab_b, remote)
}

#[tokio::test(start_paused = true)]
async fn broadcast_propagates_without_echo_or_resave() {
    let (tab_a, tab_b, remote) = two_tabs();
    let events_b = tab_b.subscribe();

    tab_a
        .save_setting("admin_bar_background", "#23282d", true)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Tab B applied the message and surfaced it as a cross-process event.
    assert_eq!(tab_b.stats().broadcasts_applied, 1);
    match events_b.try_recv().unwrap() {
        ChangeEvent::SettingChanged { key, value, source } => {
            assert_eq!(key, "admin_bar_background");
            assert_eq!(value.as_str(), Some("#23282d"));
            assert_eq!(source, SettingSource::CrossProcess);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The originator ignored its own message, and the receiver did not
    // issue a second remote save.
    assert_eq!(tab_a.stats().broadcasts_applied, 0);
    assert_eq!(remote.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn debounced_burst_converges_both_tabs_with_one_save() {
    let (tab_a, tab_b, remote) = two_tabs();
    let events_b = tab_b.subscribe();

    for color in ["#111111", "#222222", "#333333"] {
        tab_a.save_setting("color", color, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(700)).await;

    // One coalesced flush carrying only the final value.
    assert_eq!(remote.save_count(), 1);
    assert_eq!(remote.state()["color"].as_str(), Some("#333333"));

    // Tab B saw every intermediate value in order, all cross-process.
    let mut seen = Vec::new();
    while let Ok(event) = events_b.try_recv() {
        match event {
            ChangeEvent::SettingChanged { value, source, .. } => {
                assert_eq!(source, SettingSource::CrossProcess);
                seen.push(value.as_str().unwrap_or_default().to_string());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(seen, vec!["#111111", "#222222", "#333333"]);
}

#[tokio::test(start_paused = true)]
async fn batch_save_broadcasts_one_bulk_message() {
    let (tab_a, tab_b, _remote) = two_tabs();
    let events_b = tab_b.subscribe();

    let mut settings = BTreeMap::new();
    settings.insert("menu_background".to_string(), "#1d2327".into());
    settings.insert("menu_text".to_string(), "#f0f0f1".into());
    let result = tab_a.save_settings(settings).await;
    assert!(result.success);

    tokio::time::sleep(Duration::from_millis(50)).await;
    match events_b.try_recv().unwrap() {
        ChangeEvent::SettingsBulkUpdate { settings, source } => {
            assert_eq!(settings.len(), 2);
            assert_eq!(source, SettingSource::CrossProcess);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(events_b.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn slot_watcher_covers_instances_without_a_bus() {
    // No broadcast transport: both instances share one durable slot and
    // rely on the polling watcher.
    let remote = Arc::new(MockRemoteStore::new());
    let store = Arc::new(InMemoryStore::new());

    let writer = SettingsSyncEngine::new(config(), Arc::clone(&remote), Arc::clone(&store));
    let watcher = SettingsSyncEngine::new(config(), Arc::clone(&remote), Arc::clone(&store));
    writer.start();
    watcher.start();

    let events = watcher.subscribe();
    writer
        .save_setting("admin_bar_background", "#23282d", true)
        .await
        .unwrap();

    // Past the watch interval the other instance picks the write up.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(watcher.stats().broadcasts_applied, 1);
    match events.try_recv().unwrap() {
        ChangeEvent::SettingsBulkUpdate { settings, source } => {
            assert_eq!(
                settings["admin_bar_background"].as_str(),
                Some("#23282d")
            );
            assert_eq!(source, SettingSource::CrossProcess);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The writer does not re-apply its own slot content.
    assert_eq!(writer.stats().broadcasts_applied, 0);
}

#[tokio::test(start_paused = true)]
async fn offline_tab_catches_up_and_peers_converge() {
    let (tab_a, tab_b, remote) = two_tabs();

    tab_a.set_online(false);
    let mut saves = Vec::new();
    for i in 0..3 {
        let tab = tab_a.clone();
        saves.push(tokio::spawn(async move {
            tab.save_setting(&format!("key{i}"), format!("value{i}"), true)
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tab_a.queued_saves(), 3);
    assert_eq!(remote.save_count(), 0);

    // Peers already converged through the broadcast channel while the
    // writer was offline.
    assert_eq!(tab_b.stats().broadcasts_applied, 3);

    tab_a.set_online(true);
    for save in saves {
        assert!(save.await.unwrap().is_ok());
    }
    assert_eq!(tab_a.queued_saves(), 0);
    for i in 0..3 {
        assert_eq!(
            remote.state()[&format!("key{i}")].as_str(),
            Some(format!("value{i}").as_str())
        );
    }
}

#[tokio::test]
async fn durable_slot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");

    {
        let engine = SettingsSyncEngine::new(
            config(),
            MockRemoteStore::new(),
            FileStore::open(&path).unwrap(),
        );
        engine
            .save_setting("admin_bar_background", "#23282d", true)
            .await
            .unwrap();
        engine.shutdown();
    }

    // A new session whose remote is unreachable still sees the setting
    // through the durable tier.
    let remote = MockRemoteStore::new();
    remote.fail_next(vec![
        ScriptedFailure::Network,
        ScriptedFailure::Network,
        ScriptedFailure::Network,
    ]);
    let engine = SettingsSyncEngine::new(config(), remote, FileStore::open(&path).unwrap());

    let snapshot = engine.load_settings(true).await;
    assert_eq!(
        snapshot.get("admin_bar_background").unwrap().value.as_str(),
        Some("#23282d")
    );
    assert_eq!(engine.stats().degraded_loads, 1);
}

#[tokio::test]
async fn restart_prefers_fresher_remote_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");

    // First session writes through all tiers.
    {
        let engine = SettingsSyncEngine::new(
            config(),
            MockRemoteStore::new(),
            FileStore::open(&path).unwrap(),
        );
        engine
            .save_setting("admin_bar_background", "#111111", true)
            .await
            .unwrap();
        engine.shutdown();
    }

    // Meanwhile another client moved the remote value forward.
    let remote = Arc::new(MockRemoteStore::new());
    let mut newer = BTreeMap::new();
    newer.insert("admin_bar_background".to_string(), "#23282d".into());
    remote.save_settings(&newer).await.unwrap();

    let engine = SettingsSyncEngine::new(
        config(),
        Arc::clone(&remote),
        FileStore::open(&path).unwrap(),
    );
    let result = engine.sync().await.unwrap();
    assert!(result);

    let snapshot = engine.load_settings(false).await;
    assert_eq!(
        snapshot.get("admin_bar_background").unwrap().value.as_str(),
        Some("#23282d")
    );

    // The reconciled value was persisted back to the slot.
    let store = FileStore::open(&path).unwrap();
    let doc = store.read().unwrap().unwrap();
    assert_eq!(doc["admin_bar_background"], "#23282d");
}
