//! Integration tests for the Postgres permission sync job store.
//!
//! These tests share the `testing::postgres()` container and are skipped
//! when Docker is not available.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use perms_sync::jobs::{
    CANCELLATION_REASON_HIGHER_PRIORITY, JobPriority, JobState, NewSyncJob, SyncJobQueue,
    SyncJobReason, SyncJobResult
};
use perms_sync::store::{SyncRecord, SyncRecordsStore};
use perms_sync::types::{
    Priority, ProviderStatus, ProviderStatusesSet, RequestType, SetPermissionsResult
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use storage::PgSyncJobStore;
use testing::postgres;

async fn store() -> Option<PgSyncJobStore> {
    let Some(fixture) = postgres().await else {
        eprintln!("Skipping PostgreSQL test: Docker not available");
        return None;
    };
    let store = PgSyncJobStore::new(fixture.url()).await.unwrap();
    store.initialize_schema().await.unwrap();
    sqlx::query("TRUNCATE permission_sync_jobs, permission_sync_records")
        .execute(store.pool())
        .await
        .unwrap();
    Some(store)
}

fn job(priority: JobPriority) -> NewSyncJob {
    NewSyncJob {
        reason: Some(SyncJobReason::ManualUserSync),
        priority,
        ..Default::default()
    }
}

async fn age_heartbeat(store: &PgSyncJobStore, job_id: i64) {
    sqlx::query(
        "UPDATE permission_sync_jobs SET last_heartbeat_at = NOW() - INTERVAL '1 hour' WHERE id = $1"
    )
    .bind(job_id)
    .execute(store.pool())
    .await
    .unwrap();
}

#[tokio::test]
#[serial]
async fn test_initialize_schema_is_idempotent() {
    let Some(store) = store().await else { return };
    assert!(store.initialize_schema().await.is_ok());
}

#[tokio::test]
#[serial]
async fn test_duplicate_job_is_suppressed() {
    let Some(store) = store().await else { return };

    let first = store.create_user_sync_job(1, &job(JobPriority::High)).await.unwrap();
    assert!(first.is_some());

    let duplicate = store.create_user_sync_job(1, &job(JobPriority::Low)).await.unwrap();
    assert_eq!(duplicate, None);

    // Same numeric ID, different entity.
    let repo = store.create_repo_sync_job(1, &job(JobPriority::Low)).await.unwrap();
    assert!(repo.is_some());
}

#[tokio::test]
#[serial]
async fn test_higher_priority_job_cancels_lower() {
    let Some(store) = store().await else { return };

    let low = store
        .create_user_sync_job(2, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();
    let high = store
        .create_user_sync_job(2, &job(JobPriority::High))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(low, high);

    let canceled = store.get(low).await.unwrap().unwrap();
    assert_eq!(canceled.state, JobState::Canceled);
    assert!(canceled.cancel);
    assert_eq!(
        canceled.cancellation_reason.as_deref(),
        Some(CANCELLATION_REASON_HIGHER_PRIORITY)
    );

    let queued = store.get(high).await.unwrap().unwrap();
    assert_eq!(queued.state, JobState::Queued);
    assert_eq!(queued.priority, JobPriority::High);
    assert_eq!(queued.reason, Some(SyncJobReason::ManualUserSync));
}

#[tokio::test]
#[serial]
async fn test_delayed_jobs_skip_deduplication() {
    let Some(store) = store().await else { return };

    let immediate = store
        .create_user_sync_job(3, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();
    let delayed = store
        .create_user_sync_job(
            3,
            &NewSyncJob {
                process_after: Some(Utc::now() + ChronoDuration::hours(1)),
                ..job(JobPriority::Low)
            }
        )
        .await
        .unwrap();
    assert!(delayed.is_some());

    let claimed = store.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, immediate);
    assert!(store.dequeue("worker-1").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_dequeue_order() {
    let Some(store) = store().await else { return };

    let repo_high = store
        .create_repo_sync_job(10, &job(JobPriority::High))
        .await
        .unwrap()
        .unwrap();
    let user_low = store
        .create_user_sync_job(11, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();
    let user_high = store
        .create_user_sync_job(12, &job(JobPriority::High))
        .await
        .unwrap()
        .unwrap();

    let mut order = Vec::new();
    while let Some(claimed) = store.dequeue("worker-1").await.unwrap() {
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.worker_hostname, "worker-1");
        assert!(claimed.started_at.is_some());
        order.push(claimed.id);
    }

    assert_eq!(order, vec![user_high, repo_high, user_low]);
}

#[tokio::test]
#[serial]
async fn test_mark_completed_stores_result() {
    let Some(store) = store().await else { return };
    let id = store
        .create_user_sync_job(20, &job(JobPriority::Medium))
        .await
        .unwrap()
        .unwrap();
    store.dequeue("worker-1").await.unwrap().unwrap();

    let err = errors::ProviderError::temporary("timeout");
    let mut states = ProviderStatusesSet::default();
    states.push(ProviderStatus::new("https://gitlab.com/", "gitlab", "FetchUserPerms", Some(&err)));
    store
        .mark_completed(
            id,
            &SyncJobResult {
                result: SetPermissionsResult {
                    added: 3,
                    removed: 1,
                    found: 7
                },
                partial_success: true,
                provider_states: states.clone()
            }
        )
        .await
        .unwrap();

    let done = store.get(id).await.unwrap().unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(
        (done.permissions_added, done.permissions_removed, done.permissions_found),
        (3, 1, 7)
    );
    assert!(done.is_partial_success);
    assert_eq!(done.code_host_states, states);
    assert!(done.finished_at.is_some());
}

#[tokio::test]
#[serial]
async fn test_mark_errored_fails_after_max_failures() {
    let Some(store) = store().await else { return };
    let id = store
        .create_user_sync_job(30, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();
    let empty = ProviderStatusesSet::default();

    store.dequeue("worker-1").await.unwrap().unwrap();
    let state = store.mark_errored(id, "boom", &empty, 2).await.unwrap();
    assert_eq!(state, JobState::Errored);

    // Errored jobs are picked up again.
    let retried = store.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(retried.id, id);
    assert_eq!(retried.num_failures, 1);

    let state = store.mark_errored(id, "boom again", &empty, 2).await.unwrap();
    assert_eq!(state, JobState::Failed);
    let failed = store.get(id).await.unwrap().unwrap();
    assert_eq!(failed.failure_message.as_deref(), Some("boom again"));
    assert!(store.dequeue("worker-1").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_mark_errored_unknown_job() {
    let Some(store) = store().await else { return };

    let err = store
        .mark_errored(999_999, "boom", &ProviderStatusesSet::default(), 1)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
#[serial]
async fn test_reset_stalled_requeues_then_fails() {
    let Some(store) = store().await else { return };
    let id = store
        .create_user_sync_job(40, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();

    store.dequeue("worker-1").await.unwrap().unwrap();
    age_heartbeat(&store, id).await;

    let stats = store.reset_stalled(Duration::from_secs(30), 1).await.unwrap();
    assert_eq!((stats.reset, stats.failed), (1, 0));
    let requeued = store.get(id).await.unwrap().unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.num_resets, 1);

    store.dequeue("worker-2").await.unwrap().unwrap();
    age_heartbeat(&store, id).await;

    let stats = store.reset_stalled(Duration::from_secs(30), 1).await.unwrap();
    assert_eq!((stats.reset, stats.failed), (0, 1));
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Failed);
}

#[tokio::test]
#[serial]
async fn test_heartbeat_keeps_job_alive() {
    let Some(store) = store().await else { return };
    let id = store
        .create_user_sync_job(50, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();

    store.dequeue("worker-1").await.unwrap().unwrap();
    age_heartbeat(&store, id).await;
    store.heartbeat(&[id]).await.unwrap();

    let stats = store.reset_stalled(Duration::from_secs(30), 5).await.unwrap();
    assert_eq!((stats.reset, stats.failed), (0, 0));
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Processing);
}

#[tokio::test]
#[serial]
async fn test_cancel_queued_job() {
    let Some(store) = store().await else { return };
    let id = store
        .create_repo_sync_job(60, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();

    assert!(store.cancel(id, "repository deleted").await.unwrap());
    assert!(!store.cancel(id, "repository deleted").await.unwrap());
    assert!(store.dequeue("worker-1").await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_latest_finished_sync_ignores_failures() {
    let Some(store) = store().await else { return };
    let t1 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let t2 = t1 + ChronoDuration::minutes(10);

    let record = |finished_at, failure_message: Option<&str>| SyncRecord {
        request_type: RequestType::User,
        id: 70,
        priority: Priority::Low,
        no_perms: false,
        invalidate_caches: false,
        started_at: finished_at - ChronoDuration::seconds(5),
        finished_at,
        result: failure_message.is_none().then_some(SetPermissionsResult::default()),
        provider_states: ProviderStatusesSet::default(),
        failure_message: failure_message.map(str::to_string)
    };

    assert_eq!(
        store.latest_finished_sync(RequestType::User, 70).await.unwrap(),
        None
    );

    store.record(&record(t1, None)).await.unwrap();
    store.record(&record(t2, Some("provider failure"))).await.unwrap();

    assert_eq!(
        store.latest_finished_sync(RequestType::User, 70).await.unwrap(),
        Some(t1)
    );
    assert_eq!(
        store.latest_finished_sync(RequestType::Repo, 70).await.unwrap(),
        None
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_concurrent_creates_queue_one_job() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .create_user_sync_job(80, &job(JobPriority::Low))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut created = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            created.push(id);
        }
    }
    assert_eq!(created.len(), 1);

    let (queued,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM permission_sync_jobs WHERE user_id = 80 AND state = 'queued'"
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(queued, 1);
}

#[tokio::test]
#[serial]
async fn test_reset_stalled_cancels_job_already_queued_again() {
    let Some(store) = store().await else { return };
    let stalled = store
        .create_user_sync_job(90, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();
    store.dequeue("worker-1").await.unwrap().unwrap();
    age_heartbeat(&store, stalled).await;

    let fresh = store
        .create_user_sync_job(90, &job(JobPriority::Low))
        .await
        .unwrap()
        .unwrap();

    let stats = store.reset_stalled(Duration::from_secs(30), 5).await.unwrap();
    assert_eq!((stats.reset, stats.failed), (0, 0));
    assert_eq!(store.get(stalled).await.unwrap().unwrap().state, JobState::Canceled);
    assert_eq!(store.get(fresh).await.unwrap().unwrap().state, JobState::Queued);
}
