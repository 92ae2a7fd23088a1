//! End-to-end scenarios for the sync engine
//!
//! Each test drives a real store (temp SQLite file) through a scripted
//! server, covering:
//! - Successful batch confirmation
//! - Conflict resolution with the server copy and the audit trail
//! - Retry backoff, dead-lettering and operator recovery
//! - Priority ordering and batch capping
//! - The single in-flight cycle guard
//! - Reconnect and retry-timer driven drains

use async_trait::async_trait;
use crypto::{NoOpEncryptor, PayloadEncryptor};
use relief_sync::{
    ChangeAction, ChangeRecord, ConnectivityMonitor, EntityKind, EntitySyncStatus, ItemOutcome,
    LocalStore, LocalStoreConfig, OutcomeStatus, ReconcileClient, SyncConfig, SyncEngine,
    SyncError, SyncEvent, SyncResult,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// What the scripted server does with the next batch it receives.
/// When the script runs out it answers success.
enum Script {
    AllSuccess,
    AllConflict(serde_json::Value),
    AllRejected(String),
    NetworkError(String),
    /// Returns an empty outcome list regardless of batch size
    MismatchedLength,
}

struct ScriptedClient {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<ChangeRecord>>>,
}

impl ScriptedClient {
    fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn success_outcome(change: &ChangeRecord) -> ItemOutcome {
    ItemOutcome {
        offline_id: change.offline_id,
        server_id: Some(format!("srv-{}", change.entity_uuid)),
        status: OutcomeStatus::Success,
        message: None,
        conflict_data: None,
    }
}

#[async_trait]
impl ReconcileClient for ScriptedClient {
    async fn submit_batch(&self, changes: &[ChangeRecord]) -> SyncResult<Vec<ItemOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().await.push(changes.to_vec());

        let step = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Script::AllSuccess);

        match step {
            Script::AllSuccess => Ok(changes.iter().map(success_outcome).collect()),
            Script::AllConflict(data) => Ok(changes
                .iter()
                .map(|c| ItemOutcome {
                    offline_id: c.offline_id,
                    server_id: Some(format!("srv-{}", c.entity_uuid)),
                    status: OutcomeStatus::Conflict,
                    message: Some("Version conflict".to_string()),
                    conflict_data: Some(data.clone()),
                })
                .collect()),
            Script::AllRejected(message) => Ok(changes
                .iter()
                .map(|c| ItemOutcome {
                    offline_id: c.offline_id,
                    server_id: None,
                    status: OutcomeStatus::Failed,
                    message: Some(message.clone()),
                    conflict_data: None,
                })
                .collect()),
            Script::NetworkError(message) => Err(SyncError::Transmission(message)),
            Script::MismatchedLength => Ok(Vec::new()),
        }
    }
}

/// Holds the submit_batch call open until the test releases it
struct BlockingClient {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl ReconcileClient for BlockingClient {
    async fn submit_batch(&self, changes: &[ChangeRecord]) -> SyncResult<Vec<ItemOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(changes.iter().map(success_outcome).collect())
    }
}

struct Harness {
    engine: Arc<SyncEngine>,
    store: Arc<LocalStore>,
    connectivity: Arc<ConnectivityMonitor>,
    client: Arc<ScriptedClient>,
    _dir: TempDir,
}

async fn new_store(dir: &TempDir, encryptor: Arc<dyn crypto::Encryptor>) -> Arc<LocalStore> {
    let config = LocalStoreConfig {
        db_path: dir.path().join("relief.db").to_string_lossy().into_owned(),
        ..Default::default()
    };
    Arc::new(LocalStore::new(config, encryptor).await.unwrap())
}

async fn scripted_harness(script: Vec<Script>, config: SyncConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir, Arc::new(NoOpEncryptor)).await;
    let client = Arc::new(ScriptedClient::new(script));
    let connectivity = Arc::new(ConnectivityMonitor::new());
    let engine = Arc::new(
        SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&client) as Arc<dyn ReconcileClient>,
            Arc::clone(&connectivity),
            config,
        )
        .await
        .unwrap(),
    );

    Harness {
        engine,
        store,
        connectivity,
        client,
        _dir: dir,
    }
}

/// Millisecond-scale backoff so retry tests finish quickly. The sweep
/// interval is pushed out of the way.
fn fast_config(max_retries: u32, delays_ms: &[u64]) -> SyncConfig {
    SyncConfig {
        max_retries,
        retry_delays: delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect(),
        sync_check_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn stage(store: &LocalStore, data: serde_json::Value, priority: i32) -> (Uuid, Uuid) {
    let entity_uuid = Uuid::new_v4();
    let change_id = store
        .stage_change(
            EntityKind::Assessment,
            entity_uuid,
            ChangeAction::Create,
            data,
            priority,
        )
        .await
        .unwrap();
    (change_id, entity_uuid)
}

#[tokio::test]
async fn test_successful_batch_confirms_entities() {
    let h = scripted_harness(vec![Script::AllSuccess], SyncConfig::default()).await;
    let (_, entity_uuid) = stage(&h.store, json!({"severity": "high"}), 0).await;
    h.connectivity.set_online(true);

    let report = h.engine.trigger_sync().await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);

    let entity = h
        .store
        .get_entity(EntityKind::Assessment, entity_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.sync_status, EntitySyncStatus::Synced);
    assert_eq!(
        entity.server_id,
        Some(format!("srv-{}", entity_uuid)),
        "server id from the outcome should be stored"
    );
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
    assert_eq!(h.client.calls(), 1);
}

#[tokio::test]
async fn test_full_cycle_with_encrypted_store() {
    let dir = tempfile::tempdir().unwrap();
    let encryptor = Arc::new(PayloadEncryptor::new(PayloadEncryptor::generate_key()).unwrap());
    let store = new_store(&dir, encryptor).await;
    let client = Arc::new(ScriptedClient::new(vec![Script::AllSuccess]));
    let connectivity = Arc::new(ConnectivityMonitor::new());
    let engine = SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&client) as Arc<dyn ReconcileClient>,
        Arc::clone(&connectivity),
        SyncConfig::default(),
    )
    .await
    .unwrap();

    let data = json!({"notes": "water main ruptured", "teams": 2});
    let (_, entity_uuid) = stage(&store, data.clone(), 0).await;
    connectivity.set_online(true);

    let report = engine.trigger_sync().await.unwrap();
    assert_eq!(report.synced, 1);

    // The server saw plaintext even though the store holds ciphertext
    let batches = client.batches.lock().await;
    assert_eq!(batches[0][0].data, data);

    let entity = store
        .get_entity(EntityKind::Assessment, entity_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.sync_status, EntitySyncStatus::Synced);
    assert_eq!(entity.data, data);
}

#[tokio::test]
async fn test_conflict_takes_server_copy_and_audits_it() {
    let server_copy = json!({"foo": "server-value"});
    let h = scripted_harness(
        vec![Script::AllConflict(server_copy.clone())],
        SyncConfig::default(),
    )
    .await;
    let (change_id, entity_uuid) = stage(&h.store, json!({"foo": "local-value"}), 0).await;
    h.connectivity.set_online(true);

    let report = h.engine.trigger_sync().await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 0);

    // Server copy won and the change left the queue
    let entity = h
        .store
        .get_entity(EntityKind::Assessment, entity_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.data, server_copy);
    assert_eq!(entity.sync_status, EntitySyncStatus::Synced);
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);

    // The discarded local edit is preserved in the audit chain
    let history = h.engine.conflict_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change_id, change_id);
    assert_eq!(history[0].entity_uuid, entity_uuid);
    assert_eq!(history[0].local_data, json!({"foo": "local-value"}));
    assert_eq!(history[0].server_data, server_copy);
    assert!(h.engine.verify_conflict_log().await.unwrap());
}

#[tokio::test]
async fn test_repeated_network_errors_dead_letter_the_change() {
    let h = scripted_harness(
        vec![
            Script::NetworkError("connection refused".to_string()),
            Script::NetworkError("connection refused".to_string()),
            Script::NetworkError("connection refused".to_string()),
        ],
        fast_config(3, &[10, 10, 10]),
    )
    .await;
    let (_, entity_uuid) = stage(&h.store, json!({"teams": 3}), 0).await;
    h.connectivity.set_online(true);

    for expected_attempts in 1..=2 {
        let report = h.engine.trigger_sync().await.unwrap();
        assert_eq!(report.failed, 1);
        let snapshot = h.store.queue_snapshot().await.unwrap();
        assert_eq!(snapshot[0].attempts, expected_attempts);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Third failure exhausts the budget
    let report = h.engine.trigger_sync().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
    assert_eq!(h.store.failed_count().await.unwrap(), 1);

    let entity = h
        .store
        .get_entity(EntityKind::Assessment, entity_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.sync_status, EntitySyncStatus::Failed);

    let failed = h.store.failed_items().await.unwrap();
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(failed[0].last_error.as_deref(), Some("Transmission error: connection refused"));

    // Operator retry: back into the queue, drained with the now-healthy
    // server (the script is exhausted, so the next call succeeds)
    let restored = h.engine.retry_failed_items().await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(h.store.failed_count().await.unwrap(), 0);
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);

    let entity = h
        .store
        .get_entity(EntityKind::Assessment, entity_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.sync_status, EntitySyncStatus::Synced);
    assert_eq!(h.client.calls(), 4);
}

#[tokio::test]
async fn test_priority_orders_submission() {
    let h = scripted_harness(Vec::new(), SyncConfig::default()).await;
    let mut staged = Vec::new();
    for priority in [1, 5, 3] {
        staged.push(stage(&h.store, json!({"p": priority}), priority).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.connectivity.set_online(true);

    h.engine.trigger_sync().await.unwrap();

    let batches = h.client.batches.lock().await;
    let submitted: Vec<Uuid> = batches[0].iter().map(|c| c.offline_id).collect();
    let expected = vec![staged[1].0, staged[2].0, staged[0].0];
    assert_eq!(submitted, expected, "priority 5, then 3, then 1");
}

#[tokio::test]
async fn test_at_most_one_cycle_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir, Arc::new(NoOpEncryptor)).await;
    let client = Arc::new(BlockingClient {
        entered: Notify::new(),
        release: Notify::new(),
        calls: AtomicUsize::new(0),
    });
    let connectivity = Arc::new(ConnectivityMonitor::new());
    let engine = Arc::new(
        SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&client) as Arc<dyn ReconcileClient>,
            Arc::clone(&connectivity),
            SyncConfig::default(),
        )
        .await
        .unwrap(),
    );

    stage(&store, json!({"x": 1}), 0).await;
    connectivity.set_online(true);

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.trigger_sync().await })
    };
    client.entered.notified().await;

    // Second trigger while the first is parked inside submit_batch
    match engine.trigger_sync().await {
        Err(SyncError::SyncInProgress) => {}
        other => panic!("expected SyncInProgress, got {:?}", other.map(|r| r.submitted)),
    }
    assert!(engine.queue_status().await.unwrap().sync_in_flight);

    client.release.notify_one();
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert!(!engine.queue_status().await.unwrap().sync_in_flight);
}

#[tokio::test]
async fn test_reconnect_drains_queue() {
    let h = scripted_harness(Vec::new(), fast_config(3, &[10, 10, 10])).await;
    let (_, entity_uuid) = stage(&h.store, json!({"road": "blocked"}), 0).await;

    Arc::clone(&h.engine).start().await;
    // Let the driver subscribe before flipping connectivity
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.client.calls(), 0, "offline start must not submit");

    h.connectivity.set_online(true);

    let mut drained = false;
    for _ in 0..100 {
        if h.store.queue_depth().await.unwrap() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained, "queue should drain right after reconnect");
    assert_eq!(h.client.calls(), 1);

    let entity = h
        .store
        .get_entity(EntityKind::Assessment, entity_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.sync_status, EntitySyncStatus::Synced);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_retry_timer_resends_on_its_own() {
    let h = scripted_harness(
        vec![Script::NetworkError("gateway timeout".to_string())],
        fast_config(3, &[30, 30, 30]),
    )
    .await;
    let (_, entity_uuid) = stage(&h.store, json!({"supplies": "low"}), 0).await;

    Arc::clone(&h.engine).start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.connectivity.set_online(true);

    // First submission fails and arms a 30ms timer; the driver then
    // retries without any external trigger
    let mut synced = false;
    for _ in 0..100 {
        if h.store.queue_depth().await.unwrap() == 0 {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(synced, "retry timer should resend the change");
    assert_eq!(h.client.calls(), 2);

    let entity = h
        .store
        .get_entity(EntityKind::Assessment, entity_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.sync_status, EntitySyncStatus::Synced);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_backoff_delays_follow_the_schedule() {
    let h = scripted_harness(
        vec![
            Script::NetworkError("down".to_string()),
            Script::NetworkError("down".to_string()),
            Script::NetworkError("down".to_string()),
        ],
        fast_config(4, &[50, 80, 120]),
    )
    .await;
    stage(&h.store, json!({}), 0).await;
    h.connectivity.set_online(true);

    let mut deltas = Vec::new();
    for wait_ms in [60, 90, 130] {
        h.engine.trigger_sync().await.unwrap();
        let snapshot = h.store.queue_snapshot().await.unwrap();
        let item = &snapshot[0];
        let delta = item.next_retry.unwrap() - item.last_attempt.unwrap();
        deltas.push(delta);
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
    }

    assert_eq!(deltas[0], chrono::Duration::milliseconds(50));
    assert_eq!(deltas[1], chrono::Duration::milliseconds(80));
    assert_eq!(deltas[2], chrono::Duration::milliseconds(120));
    assert!(deltas[0] < deltas[1] && deltas[1] < deltas[2]);
}

#[tokio::test]
async fn test_clear_failed_discards_permanently() {
    let h = scripted_harness(
        vec![Script::NetworkError("no route".to_string())],
        fast_config(1, &[10]),
    )
    .await;
    stage(&h.store, json!({"a": 1}), 0).await;
    stage(&h.store, json!({"b": 2}), 0).await;
    h.connectivity.set_online(true);

    // One attempt allowed: both items dead-letter in a single cycle
    let report = h.engine.trigger_sync().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
    assert_eq!(h.store.failed_count().await.unwrap(), 2);

    let cleared = h.engine.clear_failed_items().await.unwrap();
    assert_eq!(cleared, 2);
    assert_eq!(h.store.failed_count().await.unwrap(), 0);
    assert_eq!(h.engine.queue_status().await.unwrap().failed, 0);
}

#[tokio::test]
async fn test_miscounted_outcomes_fail_the_whole_batch() {
    let h = scripted_harness(vec![Script::MismatchedLength], SyncConfig::default()).await;
    stage(&h.store, json!({}), 0).await;
    h.connectivity.set_online(true);

    let report = h.engine.trigger_sync().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.synced, 0);

    let snapshot = h.store.queue_snapshot().await.unwrap();
    assert_eq!(snapshot[0].attempts, 1);
    assert_eq!(snapshot[0].last_error.as_deref(), Some("Outcome count mismatch"));
}

#[tokio::test]
async fn test_rejection_keeps_server_message() {
    let h = scripted_harness(
        vec![Script::AllRejected("Validation failed: missing field".to_string())],
        SyncConfig::default(),
    )
    .await;
    stage(&h.store, json!({}), 0).await;
    h.connectivity.set_online(true);

    h.engine.trigger_sync().await.unwrap();

    let snapshot = h.store.queue_snapshot().await.unwrap();
    let item = &snapshot[0];
    assert_eq!(item.attempts, 1);
    assert_eq!(item.last_error.as_deref(), Some("Validation failed: missing field"));
    assert!(item.next_retry.unwrap() > item.last_attempt.unwrap());
}

#[tokio::test]
async fn test_batches_respect_the_configured_cap() {
    let config = SyncConfig {
        max_batch_size: 10,
        ..Default::default()
    };
    let h = scripted_harness(Vec::new(), config).await;
    for i in 0..13 {
        stage(&h.store, json!({"n": i}), 0).await;
    }
    h.connectivity.set_online(true);

    let first = h.engine.trigger_sync().await.unwrap();
    assert_eq!(first.submitted, 10);
    let second = h.engine.trigger_sync().await.unwrap();
    assert_eq!(second.submitted, 3);

    let batches = h.client.batches.lock().await;
    assert_eq!(batches[0].len(), 10);
    assert_eq!(batches[1].len(), 3);
}

#[tokio::test]
async fn test_explicit_limit_caps_below_config() {
    let h = scripted_harness(Vec::new(), SyncConfig::default()).await;
    for i in 0..3 {
        stage(&h.store, json!({"n": i}), 0).await;
    }
    h.connectivity.set_online(true);

    let report = h.engine.sync_batch(Some(1)).await.unwrap();
    assert_eq!(report.submitted, 1);
    assert_eq!(h.store.queue_depth().await.unwrap(), 2);
}

#[tokio::test]
async fn test_events_narrate_a_conflict_cycle() {
    let h = scripted_harness(
        vec![Script::AllConflict(json!({"foo": "server-value"}))],
        SyncConfig::default(),
    )
    .await;
    let mut events = h.engine.events().subscribe();
    let (change_id, _) = stage(&h.store, json!({"foo": "local"}), 0).await;
    h.connectivity.set_online(true);

    h.engine.trigger_sync().await.unwrap();

    match events.try_recv().unwrap() {
        SyncEvent::SyncStarted { batch_size } => assert_eq!(batch_size, 1),
        other => panic!("expected SyncStarted, got {:?}", other),
    }
    match events.try_recv().unwrap() {
        SyncEvent::ConflictResolved { change_id: id, .. } => assert_eq!(id, change_id),
        other => panic!("expected ConflictResolved, got {:?}", other),
    }
    match events.try_recv().unwrap() {
        SyncEvent::SyncCompleted { conflicts, synced, failed } => {
            assert_eq!(conflicts, 1);
            assert_eq!(synced, 0);
            assert_eq!(failed, 0);
        }
        other => panic!("expected SyncCompleted, got {:?}", other),
    }
}
