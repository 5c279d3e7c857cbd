//! Integration tests for the session lifecycle.
//!
//! These drive the manager's per-vault tasks end to end: connect, batch
//! acceptance in both directions, retry after store failure, and disconnect.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use drift_engine::{ChangeRecord, DayKey, Entity, Source, Table, VaultId};
use drift_session::{
    AlwaysUnlocked, Config, LocalStore, MemoryStore, SessionCommand, SessionError, SessionEvent,
    SessionManager, UnlockGate,
};
use tokio::sync::mpsc;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn vault() -> VaultId {
    "vault-1".to_string()
}

fn daily(id: &str, created: i64, content: &str) -> Entity {
    Entity::new(id, ts(created))
        .with_day(DayKey::from_ymd_opt(2024, 3, 10).unwrap())
        .with_content(content)
}

fn wire_insert(table: &str, entity: &Entity, source: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": 1,
        "table": table,
        "key": entity.id,
        "obj": entity,
        "source": source,
    })
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager_with(
    store: Arc<MemoryStore>,
) -> (Arc<SessionManager>, mpsc::UnboundedReceiver<SessionEvent>) {
    init_tracing();
    let config = Config {
        retry_base_ms: 10,
        retry_max_ms: 50,
        retry_max_attempts: 5,
    };
    SessionManager::new(store, Arc::new(AlwaysUnlocked), config)
}

#[tokio::test]
async fn locked_vault_cannot_connect() {
    struct Locked;
    impl UnlockGate for Locked {
        fn is_unlockable(&self, _vault: &VaultId) -> bool {
            false
        }
    }

    let (manager, _events) = SessionManager::new(
        Arc::new(MemoryStore::new()),
        Arc::new(Locked),
        Config::default(),
    );
    let (outbound, _rx) = mpsc::unbounded_channel();

    let err = manager.connect(vault(), outbound, None).unwrap_err();
    assert!(matches!(err, SessionError::VaultLocked(_)));
}

#[tokio::test]
async fn full_lifecycle_with_remote_batch() {
    let store = Arc::new(MemoryStore::new());
    store.seed(&vault(), Table::Documents, vec![daily("doc-2", 2_000, "content-2")]);
    let (manager, mut events) = manager_with(store.clone());
    let (outbound, mut channel) = mpsc::unbounded_channel::<ChangeRecord>();

    manager.connect(vault(), outbound, Some("req-1".into())).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { request_id: Some(id), .. } if id == "req-1"
    ));

    // A second device created its own doc for the same day.
    let batch = vec![wire_insert("documents", &daily("doc-1", 1_000, "content-1"), "sync")];
    manager
        .dispatch(
            &vault(),
            SessionCommand::AcceptRemoteChanges {
                changes: batch,
                request_id: Some("req-2".into()),
            },
        )
        .unwrap();

    match next_event(&mut events).await {
        SessionEvent::ChangesAccepted {
            applied,
            published,
            request_id,
            ..
        } => {
            assert_eq!(applied, 2); // canonical save + tombstone delete
            assert_eq!(published, 2);
            assert_eq!(request_id.as_deref(), Some("req-2"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The store converged on the canonical doc.
    let docs = store.list(&vault(), Table::Documents).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, "doc-1");
    assert_eq!(docs[0].content, "content-1content-2");

    // The channel carries the same resolution for everyone else.
    let canonical = channel.recv().await.unwrap();
    assert!(canonical.is_insert());
    assert_eq!(canonical.source, Source::Broadcast);
    let tombstone = channel.recv().await.unwrap();
    assert!(tombstone.is_delete());
    assert_eq!(tombstone.key, "doc-2");

    manager.disconnect(&vault(), None).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected { .. }
    ));
    assert!(!manager.is_connected(&vault()));
}

#[tokio::test]
async fn local_batch_publishes_on_the_channel() {
    let store = Arc::new(MemoryStore::new());
    let (manager, mut events) = manager_with(store);
    let (outbound, mut channel) = mpsc::unbounded_channel::<ChangeRecord>();

    manager.connect(vault(), outbound, None).unwrap();
    next_event(&mut events).await;

    let task = Entity::new("task-1", ts(1_000)).with_content("local edit");
    manager
        .dispatch(
            &vault(),
            SessionCommand::AcceptLocalChanges {
                changes: vec![wire_insert("tasks", &task, "device-1")],
                request_id: None,
            },
        )
        .unwrap();

    match next_event(&mut events).await {
        SessionEvent::ChangesAccepted { published, .. } => assert_eq!(published, 1),
        other => panic!("unexpected event: {other:?}"),
    }
    let record = channel.recv().await.unwrap();
    assert_eq!(record.source, Source::Client("device-1".into()));
    assert_eq!(record.key, "task-1");
}

#[tokio::test]
async fn failed_table_recovers_on_retry_tick() {
    let store = Arc::new(MemoryStore::new());
    store.poison_table(Table::Tasks, "disk full");
    let (manager, mut events) = manager_with(store.clone());
    let (outbound, _channel) = mpsc::unbounded_channel::<ChangeRecord>();

    manager.connect(vault(), outbound, None).unwrap();
    next_event(&mut events).await;

    let task = Entity::new("task-1", ts(1_000));
    manager
        .dispatch(
            &vault(),
            SessionCommand::AcceptRemoteChanges {
                changes: vec![wire_insert("tasks", &task, "sync")],
                request_id: None,
            },
        )
        .unwrap();
    next_event(&mut events).await;
    assert!(store.list(&vault(), Table::Tasks).unwrap().is_empty());

    // Once the store recovers, the backoff tick lands the queued batch.
    store.heal_table(Table::Tasks);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.list(&vault(), Table::Tasks).unwrap().len(), 1);
}

#[tokio::test]
async fn batches_for_one_vault_apply_in_order() {
    let store = Arc::new(MemoryStore::new());
    let (manager, mut events) = manager_with(store.clone());
    let (outbound, _channel) = mpsc::unbounded_channel::<ChangeRecord>();

    manager.connect(vault(), outbound, None).unwrap();
    next_event(&mut events).await;

    // Two sequential updates to the same key; the later batch must win.
    for (round, content) in [(1_000, "first"), (2_000, "second")] {
        let task = Entity::new("task-1", ts(100))
            .with_updated_at(ts(round))
            .with_content(content);
        manager
            .dispatch(
                &vault(),
                SessionCommand::AcceptRemoteChanges {
                    changes: vec![wire_insert("tasks", &task, "sync")],
                    request_id: None,
                },
            )
            .unwrap();
    }
    next_event(&mut events).await;
    next_event(&mut events).await;

    let stored = store
        .retrieve(&vault(), Table::Tasks, &"task-1".to_string())
        .unwrap()
        .unwrap();
    assert_eq!(stored.content, "second");
}

#[tokio::test]
async fn vaults_run_independently() {
    let store = Arc::new(MemoryStore::new());
    let (manager, mut events) = manager_with(store.clone());
    let (out_a, _ch_a) = mpsc::unbounded_channel::<ChangeRecord>();
    let (out_b, _ch_b) = mpsc::unbounded_channel::<ChangeRecord>();

    manager.connect("vault-a".to_string(), out_a, None).unwrap();
    manager.connect("vault-b".to_string(), out_b, None).unwrap();
    next_event(&mut events).await;
    next_event(&mut events).await;
    assert_eq!(manager.session_count(), 2);

    let task = Entity::new("task-1", ts(1_000));
    for vault in ["vault-a", "vault-b"] {
        manager
            .dispatch(
                &vault.to_string(),
                SessionCommand::AcceptRemoteChanges {
                    changes: vec![wire_insert("tasks", &task, "sync")],
                    request_id: None,
                },
            )
            .unwrap();
    }
    next_event(&mut events).await;
    next_event(&mut events).await;

    for vault in ["vault-a", "vault-b"] {
        assert_eq!(
            store.list(&vault.to_string(), Table::Tasks).unwrap().len(),
            1
        );
    }

    manager.shutdown().await;
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn malformed_records_surface_in_counts_not_errors() {
    let store = Arc::new(MemoryStore::new());
    let (manager, mut events) = manager_with(store.clone());
    let (outbound, _channel) = mpsc::unbounded_channel::<ChangeRecord>();

    manager.connect(vault(), outbound, None).unwrap();
    next_event(&mut events).await;

    let task = Entity::new("task-1", ts(1_000));
    let batch = vec![
        // Update without mods violates the wire shape.
        serde_json::json!({"kind": 2, "table": "tasks", "key": "broken", "source": "sync"}),
        wire_insert("tasks", &task, "sync"),
    ];
    manager
        .dispatch(
            &vault(),
            SessionCommand::AcceptRemoteChanges {
                changes: batch,
                request_id: None,
            },
        )
        .unwrap();

    match next_event(&mut events).await {
        SessionEvent::ChangesAccepted { applied, .. } => assert_eq!(applied, 1),
        other => panic!("unexpected event: {other:?}"),
    }
}
