//! Workspace manager integration tests
//!
//! Drives the manager through its event entry points with a recording
//! producer and in-memory storage, without a NATS server.

mod common;

use std::time::Duration;

use common::*;
use rating_service::manager::ManagerConfig;
use rating_service::model::{now_ms, ChangeKind, ChangeRecord, ModelVersion, DERIVED_SPACE};
use rating_service::nats::{NoopControl, RatingEvent, WorkspaceEvent};
use rating_service::RatingError;

const ISSUE: &str = "tracker:class:Issue";

fn issue(id: &str, author: &str, at: i64) -> ChangeRecord {
    ChangeRecord::new(ChangeKind::Create, id, ISSUE, author, at)
}

/// Feed the produced events back, like the rating consumer would
async fn deliver(t: &TestManager) {
    let events = t.producer.sent();
    t.producer.clear();
    for (workspace, event) in events {
        t.manager
            .process_rating_event(&workspace, event, &NoopControl)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_raw_records_become_calculate_events() {
    let t = test_manager(manager_config());

    let record = issue("t-1", "id:alice", T0);
    assert!(t.manager.process_tx("ws-1", record.clone()).await.unwrap());
    assert_eq!(
        t.producer.sent(),
        vec![("ws-1".to_string(), RatingEvent::calculate(record))]
    );

    deliver(&t).await;
    let storage = t.storage.workspace("ws-1");
    assert_eq!(
        stored(&storage, "acc-alice").await.unwrap().total_activity().creates,
        1
    );
    assert!(t.manager.calculator("ws-1").is_some());
}

#[tokio::test]
async fn test_ignored_and_derived_records_dropped() {
    let t = test_manager(manager_config());

    let notification = ChangeRecord::new(
        ChangeKind::Create,
        "n-1",
        "notification:class:InboxNotification",
        "id:alice",
        T0,
    );
    let derived = issue("t-1", "id:alice", T0).with_space(DERIVED_SPACE);
    let tx = ChangeRecord::new(ChangeKind::Create, "tx-1", "core:class:TxCreateDoc", "id:alice", T0);

    assert!(!t.manager.process_tx("ws-1", notification).await.unwrap());
    assert!(!t.manager.process_tx("ws-1", derived).await.unwrap());
    assert!(!t.manager.process_tx("ws-1", tx).await.unwrap());
    assert!(t.producer.sent().is_empty());

    // Unknown classes are not ignored at ingestion, the calculator filters them
    let unknown = ChangeRecord::new(ChangeKind::Create, "x-1", "plugin:class:New", "id:alice", T0);
    assert!(t.manager.process_tx("ws-1", unknown).await.unwrap());
}

#[tokio::test]
async fn test_restoring_discards_until_restored() {
    let t = test_manager(manager_config());

    // A running calculator is force-closed by the restore
    t.manager.process_tx("ws-1", issue("t-0", "id:bob", T0)).await.unwrap();
    deliver(&t).await;
    let storage = t.storage.workspace("ws-1");
    let before = stored_all(&storage).await;

    t.manager
        .process_workspace_event("ws-1", WorkspaceEvent::Restoring)
        .await
        .unwrap();
    assert!(t.manager.is_restoring("ws-1"));
    assert!(t.manager.calculator("ws-1").is_none());
    assert!(storage.is_closed());

    for (i, author) in ["id:alice", "id:bob", "id:carol"].iter().enumerate() {
        let record = issue(&format!("t-{}", i + 1), author, T0 + 10_000 * (i as i64 + 1));
        assert!(!t.manager.process_tx("ws-1", record.clone()).await.unwrap());
        // Events already in flight are discarded too
        t.manager
            .process_rating_event("ws-1", RatingEvent::calculate(record), &NoopControl)
            .await
            .unwrap();
    }
    assert!(t.producer.sent().is_empty());
    assert!(t.manager.calculator("ws-1").is_none());
    assert_eq!(stored_all(&storage).await, before);

    // Lifecycle reindex requests wait for the restore as well
    t.manager
        .process_workspace_event("ws-1", WorkspaceEvent::FullReindex)
        .await
        .unwrap();
    assert!(t.producer.sent().is_empty());

    t.manager
        .process_workspace_event("ws-1", WorkspaceEvent::Restored)
        .await
        .unwrap();
    assert!(!t.manager.is_restoring("ws-1"));
    assert_eq!(
        t.producer.sent(),
        vec![("ws-1".to_string(), RatingEvent::Reindex)]
    );
}

#[tokio::test]
async fn test_created_workspace_reindexes() {
    let t = test_manager(manager_config());

    t.manager
        .process_workspace_event("ws-2", WorkspaceEvent::Created)
        .await
        .unwrap();
    assert_eq!(t.producer.sent(), vec![("ws-2".to_string(), RatingEvent::Reindex)]);

    deliver(&t).await;
    let handle = t.manager.calculator("ws-2").unwrap();
    assert_eq!(t.storage.workspace("ws-2").rows("migration").await.len(), 1);

    // Creation migrated already; the next explicit reindex replays again
    assert!(handle.reindex(&NoopControl).await.unwrap());
}

#[tokio::test]
async fn test_version_gate_marks_workspace_unavailable() {
    let t = test_manager(manager_config());
    t.directory.set_version(ModelVersion::new(0, 6, 0));

    let control = CountingControl::default();
    let result = t
        .manager
        .process_rating_event("ws-1", RatingEvent::calculate(issue("t-1", "id:alice", T0)), &control)
        .await;
    assert!(matches!(result, Err(RatingError::VersionMismatch { .. })));
    assert_eq!(t.directory.lookups(), 2);
    // The message was kept alive while waiting between the two lookups
    assert_eq!(control.beats(), 1);
    assert!(t.manager.is_unavailable("ws-1"));
    assert!(t.manager.calculator("ws-1").is_none());

    // Further events are dropped without asking again
    t.manager
        .process_rating_event("ws-1", RatingEvent::calculate(issue("t-2", "id:alice", T0)), &NoopControl)
        .await
        .unwrap();
    assert_eq!(t.directory.lookups(), 2);

    // An upgrade brings the workspace back
    t.directory.set_version(t.manager.supported_version());
    t.manager
        .process_workspace_event("ws-1", WorkspaceEvent::Upgraded)
        .await
        .unwrap();
    assert!(!t.manager.is_unavailable("ws-1"));

    t.manager
        .process_rating_event("ws-1", RatingEvent::calculate(issue("t-3", "id:alice", T0)), &NoopControl)
        .await
        .unwrap();
    let storage = t.storage.workspace("ws-1");
    assert_eq!(
        stored(&storage, "acc-alice").await.unwrap().total_activity().creates,
        1
    );
}

#[tokio::test]
async fn test_upgraded_closes_calculator() {
    let t = test_manager(manager_config());
    t.manager
        .process_rating_event("ws-1", RatingEvent::calculate(issue("t-1", "id:alice", T0)), &NoopControl)
        .await
        .unwrap();
    let handle = t.manager.calculator("ws-1").unwrap();

    t.manager
        .process_workspace_event("ws-1", WorkspaceEvent::Upgraded)
        .await
        .unwrap();
    assert!(handle.is_released());
    assert!(t.manager.calculator("ws-1").is_none());

    // The next event starts a fresh calculator
    t.manager
        .process_rating_event("ws-1", RatingEvent::calculate(issue("t-2", "id:alice", T0 + 5_000)), &NoopControl)
        .await
        .unwrap();
    assert!(t.manager.calculator("ws-1").is_some());
    let storage = t.storage.workspace("ws-1");
    assert_eq!(
        stored(&storage, "acc-alice").await.unwrap().total_activity().creates,
        2
    );
}

#[tokio::test]
async fn test_idle_calculators_evicted() {
    let t = test_manager(ManagerConfig {
        close_timeout: Duration::from_secs(60),
        ..manager_config()
    });

    for ws in ["ws-1", "ws-2"] {
        t.manager
            .process_rating_event(ws, RatingEvent::calculate(issue("t-1", "id:alice", T0)), &NoopControl)
            .await
            .unwrap();
    }
    assert_eq!(t.manager.active_workspaces().len(), 2);

    // Nothing is idle yet
    assert_eq!(t.manager.evict_idle(now_ms()).await, 0);

    let later = now_ms() + 61_000;
    assert_eq!(t.manager.evict_idle(later).await, 2);
    assert!(t.manager.active_workspaces().is_empty());
    assert!(t.storage.workspace("ws-1").is_closed());
    assert!(t.storage.workspace("ws-2").is_closed());
}

#[tokio::test]
async fn test_workspaces_are_isolated() {
    let t = test_manager(manager_config());

    t.manager
        .process_rating_event("ws-1", RatingEvent::calculate(issue("t-1", "id:alice", T0)), &NoopControl)
        .await
        .unwrap();
    t.manager
        .process_rating_event("ws-2", RatingEvent::calculate(issue("t-1", "id:bob", T0)), &NoopControl)
        .await
        .unwrap();

    let first = t.storage.workspace("ws-1");
    let second = t.storage.workspace("ws-2");
    assert!(stored(&first, "acc-alice").await.is_some());
    assert!(stored(&first, "acc-bob").await.is_none());
    assert!(stored(&second, "acc-bob").await.is_some());
    assert!(stored(&second, "acc-alice").await.is_none());
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let t = test_manager(manager_config());
    t.manager
        .process_rating_event("ws-1", RatingEvent::calculate(issue("t-1", "id:alice", T0)), &NoopControl)
        .await
        .unwrap();
    let handle = t.manager.calculator("ws-1").unwrap();

    t.manager.shutdown(false).await.unwrap();
    assert!(handle.is_released());
    assert!(t.manager.active_workspaces().is_empty());

    let refused = t
        .manager
        .process_rating_event("ws-1", RatingEvent::Reindex, &NoopControl)
        .await;
    assert!(matches!(refused, Err(RatingError::Closing(_))));
}
