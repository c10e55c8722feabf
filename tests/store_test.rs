//! Integration tests for the in-memory execution store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use portalflow::error::Error;
use portalflow::fingerprint::fingerprint;
use portalflow::model::*;
use portalflow::retry::FailureClass;
use portalflow::store::{ExecutionStore, MemoryStore};

fn pending(concept: &str) -> ExecutionRecord {
    let req = request(concept);
    let fp = fingerprint(&req);
    ExecutionRecord::pending(req, fp)
}

fn failure() -> ErrorDetail {
    ErrorDetail {
        class: FailureClass::Retriable,
        message: "timeout".to_string(),
        attempts: 3,
    }
}

async fn fail(store: &MemoryStore, id: ExchangeId) {
    store
        .transition(id, &[Status::Pending], Status::Running, RecordPatch::default())
        .await
        .unwrap();
    store
        .transition(
            id,
            &[Status::Running],
            Status::Failed,
            RecordPatch::default().error(failure()).completed_at(Utc::now()),
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserve_has_a_single_winner() {
    let store = Arc::new(MemoryStore::default());
    let fp = fingerprint(&request("A"));

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let store = Arc::clone(&store);
        let fp = fp.clone();
        tasks.push(tokio::spawn(async move {
            store.reserve(&fp, pending("A")).await
        }));
    }

    let mut winners = Vec::new();
    let mut holders = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(id) => winners.push(id),
            Err(Error::Duplicate(holder)) => holders.push(holder),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert!(holders.iter().all(|h| *h == winners[0]));
    assert_eq!(store.len(), 1);
    assert_eq!(store.dedup_holder(&fp), Some(winners[0]));
}

#[tokio::test]
async fn transitions_follow_the_lifecycle() {
    let store = MemoryStore::default();
    let record = pending("A");
    let fp = record.fingerprint.clone();
    let id = store.reserve(&fp, record).await.unwrap();

    // pending -> pending is not a move.
    let err = store
        .transition(id, &[Status::Pending], Status::Pending, RecordPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StaleTransition { .. }));

    store
        .transition(id, &[Status::Pending], Status::Running, RecordPatch::default())
        .await
        .unwrap();
    store
        .transition(id, &[Status::Running], Status::Running, RecordPatch::default().retry_count(1))
        .await
        .unwrap();
    store
        .transition(
            id,
            &Status::LIVE,
            Status::Completed,
            RecordPatch::default()
                .result(serde_json::json!({"slip": "VEP-1"}))
                .completed_at(Utc::now()),
        )
        .await
        .unwrap();

    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Completed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.result.unwrap()["slip"], "VEP-1");
    assert!(record.updated_at >= record.created_at);
}

#[tokio::test]
async fn terminal_records_never_move_again() {
    let store = MemoryStore::default();
    let record = pending("A");
    let fp = record.fingerprint.clone();
    let id = store.reserve(&fp, record).await.unwrap();
    fail(&store, id).await;

    for to in [Status::Pending, Status::Running, Status::Completed, Status::Failed] {
        let err = store
            .transition(
                id,
                &[Status::Pending, Status::Running, Status::Completed, Status::Failed],
                to,
                RecordPatch::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleTransition { .. }), "{to}: {err:?}");
    }
    assert_eq!(store.get(id).await.unwrap().unwrap().status, Status::Failed);
}

#[tokio::test]
async fn transition_on_unknown_record_is_stale() {
    let store = MemoryStore::default();
    let err = store
        .transition(ExchangeId::new(), &[Status::Pending], Status::Running, RecordPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StaleTransition { .. }));
}

#[tokio::test]
async fn release_only_drops_own_entry_and_is_idempotent() {
    let store = MemoryStore::default();
    let record = pending("A");
    let fp = record.fingerprint.clone();
    let id = store.reserve(&fp, record).await.unwrap();

    store.release_dedup(&fp, ExchangeId::new()).await.unwrap();
    assert_eq!(store.dedup_holder(&fp), Some(id));

    store.release_dedup(&fp, id).await.unwrap();
    store.release_dedup(&fp, id).await.unwrap();
    assert_eq!(store.dedup_holder(&fp), None);

    // Record survives release.
    assert!(store.get(id).await.unwrap().is_some());
}

#[tokio::test]
async fn expired_dedup_entry_does_not_block() {
    let store = MemoryStore::new(Duration::from_millis(10));
    let first = pending("A");
    let fp = first.fingerprint.clone();
    let first_id = store.reserve(&fp, first).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let second_id = store.reserve(&fp, pending("A")).await.unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(store.dedup_holder(&fp), Some(second_id));
}

#[tokio::test]
async fn readmission_is_allowed_once_per_failed_record() {
    let store = MemoryStore::default();
    let record = pending("A");
    let fp = record.fingerprint.clone();
    let id = store.reserve(&fp, record).await.unwrap();
    fail(&store, id).await;
    store.release_dedup(&fp, id).await.unwrap();

    let failed = store.get(id).await.unwrap().unwrap();
    assert_eq!(store.list_retry_candidates().await.unwrap().len(), 1);

    let successor = ExecutionRecord::readmission_of(&failed);
    let successor_id = store.reserve(&fp, successor).await.unwrap();
    store.release_dedup(&fp, successor_id).await.unwrap();

    // Even with the fingerprint free, a second re-admission is refused.
    let err = store
        .reserve(&fp, ExecutionRecord::readmission_of(&failed))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Duplicate(holder) if holder == successor_id));
    assert!(store.list_retry_candidates().await.unwrap().is_empty());

    let successor = store.get(successor_id).await.unwrap().unwrap();
    assert_eq!(successor.retry_of, Some(id));
    assert_eq!(successor.retry_count, failed.retry_count + 1);
}

#[tokio::test]
async fn list_stale_reports_only_idle_live_records() {
    let store = MemoryStore::default();
    let live = pending("A");
    let live_fp = live.fingerprint.clone();
    let live_id = store.reserve(&live_fp, live).await.unwrap();

    let done = pending("B");
    let done_fp = done.fingerprint.clone();
    let done_id = store.reserve(&done_fp, done).await.unwrap();
    fail(&store, done_id).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let stale = store.list_stale(Utc::now()).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].exchange_id, live_id);

    let cutoff = Utc::now() - chrono::Duration::hours(1);
    assert!(store.list_stale(cutoff).await.unwrap().is_empty());
}

#[tokio::test]
async fn purge_removes_old_terminal_records_only() {
    let store = MemoryStore::default();
    let live = pending("A");
    let live_fp = live.fingerprint.clone();
    let live_id = store.reserve(&live_fp, live).await.unwrap();

    let done = pending("B");
    let done_fp = done.fingerprint.clone();
    let done_id = store.reserve(&done_fp, done).await.unwrap();
    fail(&store, done_id).await;

    let long_ago = Utc::now() - chrono::Duration::days(1);
    assert_eq!(store.purge_terminal(long_ago).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.purge_terminal(Utc::now()).await.unwrap(), 1);
    assert!(store.get(done_id).await.unwrap().is_none());
    assert!(store.get(live_id).await.unwrap().is_some());
}

#[tokio::test]
async fn purge_waits_for_retain_until() {
    let store = MemoryStore::default();
    let kept = pending("A");
    let kept_fp = kept.fingerprint.clone();
    let kept_id = store.reserve(&kept_fp, kept).await.unwrap();

    let now = Utc::now();
    store
        .transition(
            kept_id,
            &[Status::Pending],
            Status::Completed,
            RecordPatch::default()
                .completed_at(now)
                .retain_until(now + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    let later = now + chrono::Duration::minutes(30);
    assert_eq!(store.purge_terminal(later).await.unwrap(), 0);

    let record = store.get(kept_id).await.unwrap().unwrap();
    assert_eq!(record.retain_until, Some(now + chrono::Duration::hours(1)));

    let past_deadline = now + chrono::Duration::hours(2);
    assert_eq!(store.purge_terminal(past_deadline).await.unwrap(), 1);
    assert!(store.get(kept_id).await.unwrap().is_none());
}
