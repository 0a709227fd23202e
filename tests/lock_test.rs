//! Task claiming and lease reconciliation tests
//!
//! Exercises the lock manager against the in-memory stores:
//! 1. No task is ever claimed twice under concurrent claimers
//! 2. Finishing a task releases its lease and fans out events
//! 3. The sweep repairs leases left behind by crashed claimers

mod common;

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use scrapefleet::coordination::{lease_key, CoordinationStore, QUEUE_UPDATES_CHANNEL};
use scrapefleet::events::{DomainEvent, EventAction};
use scrapefleet::lock::LockError;
use scrapefleet::models::TaskStatus;
use scrapefleet::storage::{StateStore, TaskOutcome};

use common::{harness, pending_task};

// ============================================================================
// Exclusive Claiming
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_double_assign() {
    let h = harness();
    for i in 0..5 {
        pending_task(&h.store, &format!("creator{i}")).await;
    }

    let mut handles = Vec::new();
    for _ in 0..20 {
        let lock = h.state.lock.clone();
        handles.push(tokio::spawn(async move {
            lock.claim_next(Some(Uuid::new_v4())).await
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap().unwrap() {
            claimed.push(task.id);
        }
    }

    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), unique.len(), "a task was claimed twice");
    assert!(claimed.len() <= 5);

    // Anything not claimed in the burst is still claimable afterwards
    while let Some(task) = h.state.lock.claim_next(None).await.unwrap() {
        assert!(!claimed.contains(&task.id));
        claimed.push(task.id);
    }
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
async fn test_claim_order_is_oldest_first() {
    let h = harness();
    let first = pending_task(&h.store, "first").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = pending_task(&h.store, "second").await;

    let claimed = h.state.lock.claim_next(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, TaskStatus::Processing);
    assert!(claimed.started_at.is_some());

    let next = h.state.lock.claim_next(None).await.unwrap().unwrap();
    assert_eq!(next.id, second.id);

    assert!(h.state.lock.claim_next(None).await.unwrap().is_none());
}

// ============================================================================
// Finishing
// ============================================================================

#[tokio::test]
async fn test_complete_releases_lease_and_publishes() {
    let h = harness();
    let worker = Uuid::new_v4();
    let task = pending_task(&h.store, "someone").await;

    let claimed = h.state.lock.claim_next(Some(worker)).await.unwrap().unwrap();
    assert_eq!(claimed.worker_id, Some(worker));
    assert!(h.coordination.get(&lease_key(task.id)).await.unwrap().is_some());

    let done = h
        .state
        .lock
        .complete_task(task.id, Some(worker), 7)
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.videos_processed, 7);
    assert!(done.completed_at.is_some());
    assert!(h.coordination.get(&lease_key(task.id)).await.unwrap().is_none());

    let actions: Vec<EventAction> = h
        .coordination
        .published_on(QUEUE_UPDATES_CHANNEL)
        .await
        .iter()
        .map(|m| serde_json::from_str::<DomainEvent>(&m.payload).unwrap().action)
        .collect();
    assert_eq!(actions, vec![EventAction::Claim, EventAction::Complete]);
}

#[tokio::test]
async fn test_terminal_tasks_cannot_finish_again() {
    let h = harness();
    let task = pending_task(&h.store, "someone").await;
    h.state.lock.claim_next(None).await.unwrap();
    h.state
        .lock
        .fail_task(task.id, None, "scraper crashed")
        .await
        .unwrap();

    let err = h.state.lock.complete_task(task.id, None, 1).await.unwrap_err();
    assert!(matches!(
        err,
        LockError::InvalidState {
            status: TaskStatus::Failed,
            ..
        }
    ));

    let stored = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.error.as_deref(), Some("scraper crashed"));
}

// ============================================================================
// Sweep
// ============================================================================

#[tokio::test]
async fn test_sweep_repairs_lease_of_finished_task() {
    let h = harness();
    let task = pending_task(&h.store, "someone").await;
    h.state.lock.claim_next(None).await.unwrap();

    // Row finished without going through the lock manager (crash before release)
    h.store
        .finish_task(task.id, &TaskOutcome::Completed { videos: 0 }, None, Utc::now())
        .await
        .unwrap();
    assert!(h.coordination.get(&lease_key(task.id)).await.unwrap().is_some());

    let report = h.state.lock.run_sweep().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.stale_failed, 0);
    assert!(h.coordination.get(&lease_key(task.id)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stray_lease_on_pending_task_blocks_until_swept() {
    let h = harness();
    let task = pending_task(&h.store, "someone").await;

    // Crash between taking the lease and updating the row
    h.coordination
        .insert_raw(&lease_key(task.id), "crashed-claimant", Duration::from_secs(600))
        .await;
    assert!(h.state.lock.claim_next(None).await.unwrap().is_none());

    assert_eq!(h.state.lock.sweep_orphans().await.unwrap(), 1);

    let claimed = h.state.lock.claim_next(None).await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
}

#[tokio::test]
async fn test_sweep_keeps_live_leases() {
    let h = harness();
    pending_task(&h.store, "someone").await;
    h.state.lock.claim_next(None).await.unwrap();

    assert_eq!(h.state.lock.sweep_orphans().await.unwrap(), 0);
}
