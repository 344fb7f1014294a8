//! Behaviour every store backend must share, run against each backend's tests

use serde_json::json;
use std::time::Duration;

use super::*;
use crate::error::OrchestratorError;

fn job(fingerprint: &str, priority: i32) -> QueueJob {
    QueueJob::new(
        fingerprint,
        "default",
        priority,
        QueryDef::sql(format!("SELECT '{}'", fingerprint), vec![]),
    )
}

pub async fn kv_roundtrip_and_ttl(store: &dyn StoreDriver) {
    store.set("a", json!({"x": 1}), None).await.unwrap();
    assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));

    store
        .set("short", json!(1), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(store.get("short").await.unwrap(), None);

    assert!(store.delete("a").await.unwrap());
    assert!(!store.delete("a").await.unwrap());
}

pub async fn add_job_joins_live_job(store: &dyn StoreDriver) {
    let first = store.add_job(job("fp", 0), false).await.unwrap();
    assert!(matches!(first, AddJobOutcome::Added(_)));

    let second = store.add_job(job("fp", 0), false).await.unwrap();
    match second {
        AddJobOutcome::Joined(joined) => assert_eq!(joined.id, first.job().id),
        other => panic!("expected join, got {:?}", other),
    }

    let found = store.find_job("fp").await.unwrap().unwrap();
    assert_eq!(found.id, first.job().id);
    assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);
}

pub async fn force_renew_supersedes(store: &dyn StoreDriver) {
    let first = store.add_job(job("fp", 0), false).await.unwrap();
    let renewed = store.add_job(job("fp", 0), true).await.unwrap();

    match &renewed {
        AddJobOutcome::Superseded { added, cancelled } => {
            assert_eq!(cancelled.id, first.job().id);
            assert_ne!(added.id, first.job().id);
        }
        other => panic!("expected supersession, got {:?}", other),
    }

    let old = store.get_job(first.job().id).await.unwrap().unwrap();
    assert_eq!(old.status(), JobStatus::Cancelled);
    let live = store.find_job("fp").await.unwrap().unwrap();
    assert_eq!(live.id, renewed.job().id);
}

pub async fn claim_order_and_cap(store: &dyn StoreDriver) {
    store.add_job(job("a", 1), false).await.unwrap();
    store.add_job(job("b", 5), false).await.unwrap();
    store.add_job(job("c", 5), false).await.unwrap();

    let first = store.claim_next_job("default", 2, "w1").await.unwrap().unwrap();
    let second = store.claim_next_job("default", 2, "w1").await.unwrap().unwrap();
    assert_eq!(first.fingerprint, "b");
    assert_eq!(second.fingerprint, "c");
    assert_eq!(first.status(), JobStatus::Active);

    // Cap reached
    assert!(store.claim_next_job("default", 2, "w1").await.unwrap().is_none());
    // Other data sources are independent
    assert!(store.claim_next_job("other", 2, "w1").await.unwrap().is_none());

    let claim = first.claim().unwrap();
    assert!(store
        .complete_job(first.id, claim, JobOutcome::Done(json!(1)), None)
        .await
        .unwrap());

    let third = store.claim_next_job("default", 2, "w1").await.unwrap().unwrap();
    assert_eq!(third.fingerprint, "a");
}

pub async fn complete_requires_claim(store: &dyn StoreDriver) {
    store.add_job(job("fp", 0), false).await.unwrap();
    let claimed = store.claim_next_job("default", 1, "w1").await.unwrap().unwrap();
    let claim = claimed.claim().unwrap();

    assert!(!store.heartbeat_job(claimed.id, uuid::Uuid::new_v4()).await.unwrap());
    assert!(store.heartbeat_job(claimed.id, claim).await.unwrap());

    let write = KvWrite {
        key: cache_key("fp"),
        value: json!("stolen"),
        ttl: None,
    };
    let stolen = store
        .complete_job(
            claimed.id,
            uuid::Uuid::new_v4(),
            JobOutcome::Done(json!("stolen")),
            Some(write),
        )
        .await
        .unwrap();
    assert!(!stolen);
    assert_eq!(store.get(&cache_key("fp")).await.unwrap(), None);

    let write = KvWrite {
        key: cache_key("fp"),
        value: json!("mine"),
        ttl: None,
    };
    assert!(store
        .complete_job(claimed.id, claim, JobOutcome::Done(json!("mine")), Some(write))
        .await
        .unwrap());
    assert_eq!(store.get(&cache_key("fp")).await.unwrap(), Some(json!("mine")));

    let done = store.get_job(claimed.id).await.unwrap().unwrap();
    assert!(matches!(done.state, JobState::Done { .. }));
    assert!(store.find_job("fp").await.unwrap().is_none());

    // A second completion is rejected
    assert!(!store
        .complete_job(claimed.id, claim, JobOutcome::Done(json!("again")), None)
        .await
        .unwrap());
}

pub async fn stall_and_requeue(store: &dyn StoreDriver) {
    store.add_job(job("fp", 0), false).await.unwrap();
    let claimed = store.claim_next_job("default", 1, "dead").await.unwrap().unwrap();
    let claim = claimed.claim().unwrap();

    assert!(store.list_stalled(Duration::from_secs(60)).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let stalled = store.list_stalled(Duration::from_millis(10)).await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].status(), JobStatus::Stalled);

    // The dead worker lost ownership
    assert!(!store.heartbeat_job(claimed.id, claim).await.unwrap());

    assert!(store.requeue_job(claimed.id).await.unwrap());
    let requeued = store.get_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(requeued.status(), JobStatus::Queued);
    assert_eq!(requeued.stall_count, 1);

    let reclaimed = store.claim_next_job("default", 1, "alive").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, claimed.id);
    assert_eq!(reclaimed.attempts, 2);

    // Stale claim cannot complete
    assert!(!store
        .complete_job(claimed.id, claim, JobOutcome::Done(json!(0)), None)
        .await
        .unwrap());

    let failed = store
        .fail_job(
            reclaimed.id,
            OrchestratorError::Stalled {
                fingerprint: "fp".into(),
                attempts: 2,
            },
        )
        .await
        .unwrap();
    assert!(!failed, "active jobs are failed through complete_job");
}

pub async fn orphans_and_purge(store: &dyn StoreDriver) {
    let added = store.add_job(job("orphan", 0), false).await.unwrap();
    store
        .add_job(job("kept", 0).persistent(true), false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let orphaned = store.list_orphaned(Duration::from_millis(10)).await.unwrap();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].fingerprint, "orphan");

    store.touch_job(added.job().id).await.unwrap();
    assert!(store
        .list_orphaned(Duration::from_millis(10))
        .await
        .unwrap()
        .is_empty());

    let cancelled = store.cancel_job(added.job().id, "orphaned").await.unwrap();
    assert!(cancelled.is_some());
    assert!(store.cancel_job(added.job().id, "again").await.unwrap().is_none());

    assert_eq!(store.purge_finished(Duration::from_secs(60)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.purge_finished(Duration::from_millis(5)).await.unwrap(), 1);
    assert!(store.get_job(added.job().id).await.unwrap().is_none());
}

pub async fn version_entries(store: &dyn StoreDriver) {
    let mut older = VersionEntry::new("orders202001", "s1", "c1", "default");
    older.last_updated_at = chrono::Utc::now() - chrono::Duration::hours(1);
    let newer = VersionEntry::new("orders202001", "s1", "c2", "default");

    store.put_version_entry(older.clone()).await.unwrap();
    store.put_version_entry(newer.clone()).await.unwrap();
    store
        .put_version_entry(VersionEntry::new("orders202002", "s1", "c1", "default"))
        .await
        .unwrap();

    let entries = store.version_entries("orders202001").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].content_version, "c2");

    assert!(store.remove_version_entry(&older).await.unwrap());
    assert!(!store.remove_version_entry(&older).await.unwrap());
    assert_eq!(store.version_entries("orders202001").await.unwrap(), vec![newer]);
}
