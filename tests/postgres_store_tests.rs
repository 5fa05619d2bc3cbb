//! Postgres store tests, the paths the in-memory store cannot vouch for:
//! real transactions, row locks, and `FOR UPDATE SKIP LOCKED` contention.
//!
//! These need a dedicated database and truncate its tables, so they are
//! ignored by default. Run them with:
//!
//! ```text
//! TEST_DATABASE_URL=postgres://... cargo test -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use conductor::config::StoreConfig;
use conductor::error::ConductorError;
use conductor::store::{JobState, JobStore, PgStore};

const LEASE: Duration = Duration::from_secs(30);

async fn test_store() -> Option<PgStore> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres store test");
        return None;
    };

    let store = PgStore::connect(&StoreConfig::new(url))
        .await
        .expect("connect to the test database");
    store.run_migrations().await.expect("run migrations");

    sqlx::query("TRUNCATE job_leases, jobs, workers")
        .execute(store.pool())
        .await
        .expect("truncate test tables");

    Some(store)
}

async fn submit(store: &PgStore, max_attempts: i32) -> Uuid {
    let job_id = Uuid::new_v4();
    store
        .create_job(job_id, br#"{"x":1}"#.to_vec(), max_attempts, 5)
        .await
        .unwrap();
    job_id
}

async fn lease_and_pull(store: &PgStore) -> Uuid {
    store
        .acquire_lease(Uuid::new_v4(), LEASE)
        .await
        .unwrap()
        .expect("a pending job to lease");
    store
        .acquire_scheduled_job(Uuid::new_v4())
        .await
        .unwrap()
        .expect("a scheduled job to pull")
        .id
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn cancel_pending_job_succeeds_once() {
    let Some(store) = test_store().await else { return };
    let job_id = submit(&store, 3).await;

    store.cancel_job(job_id).await.unwrap();

    let second = store.cancel_job(job_id).await;
    assert!(matches!(
        second,
        Err(ConductorError::InvalidTransition { .. })
    ));

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.cancelled_at.is_some());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn completed_job_cannot_be_cancelled() {
    let Some(store) = test_store().await else { return };
    let job_id = submit(&store, 3).await;

    assert_eq!(lease_and_pull(&store).await, job_id);
    store.mark_job_completed(job_id).await.unwrap();

    let result = store.cancel_job(job_id).await;
    assert!(matches!(
        result,
        Err(ConductorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn failed_job_cannot_run_again() {
    let Some(store) = test_store().await else { return };
    let job_id = submit(&store, 1).await;

    lease_and_pull(&store).await;
    let state = store.mark_job_failed(job_id, "boom", true).await.unwrap();
    assert_eq!(state, JobState::Failed, "single attempt budget is spent");

    let result = store.mark_job_running(job_id).await;
    assert!(matches!(
        result,
        Err(ConductorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn submitted_payload_round_trips() {
    let Some(store) = test_store().await else { return };
    let job_id = submit(&store, 3).await;

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.payload, br#"{"x":1}"#.to_vec());
    assert_eq!(job.current_attempt, 0);

    assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn concurrent_lease_race_hands_out_distinct_jobs() {
    let Some(store) = test_store().await else { return };
    let store = Arc::new(store);

    for _ in 0..3 {
        submit(&store, 1).await;
    }

    let mut attempts = Vec::new();
    for _ in 0..5 {
        let store = Arc::clone(&store);
        attempts.push(tokio::spawn(async move {
            store.acquire_lease(Uuid::new_v4(), LEASE).await.unwrap()
        }));
    }

    let mut granted = Vec::new();
    let mut empty = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Some(grant) => granted.push(grant.job_id),
            None => empty += 1,
        }
    }

    assert_eq!(granted.len(), 3);
    assert_eq!(empty, 2);
    granted.sort();
    granted.dedup();
    assert_eq!(granted.len(), 3, "no job was leased twice");

    let leases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_leases")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(leases, 3);

    let scheduled = store
        .list_jobs(Some(JobState::Scheduled), 10)
        .await
        .unwrap();
    assert_eq!(scheduled.len(), 3);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn expired_scheduled_lease_rewinds_without_consuming_an_attempt() {
    let Some(store) = test_store().await else { return };
    let job_id = submit(&store, 3).await;

    store.acquire_lease(Uuid::new_v4(), LEASE).await.unwrap();

    // A sweep before expiry is a no-op.
    let recovered = store.recover_expired_leases(Utc::now()).await.unwrap();
    assert!(recovered.is_empty());

    // Recovery takes the reference clock as input, so expiry needs no sleep.
    let recovered = store
        .recover_expired_leases(Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(recovered, vec![job_id]);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.current_attempt, 0);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn expired_running_lease_consumes_an_attempt() {
    let Some(store) = test_store().await else { return };
    let job_id = submit(&store, 2).await;

    lease_and_pull(&store).await;

    let recovered = store
        .recover_expired_leases(Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(recovered, vec![job_id]);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.current_attempt, 1);

    // The final attempt exhausts the budget.
    lease_and_pull(&store).await;
    store
        .recover_expired_leases(Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap();

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.current_attempt, 2);
    assert!(job.last_error.unwrap().contains("attempts exhausted"));
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn worker_heartbeat_upserts() {
    let Some(store) = test_store().await else { return };
    let worker_id = Uuid::new_v4();

    store.heartbeat_worker(worker_id, 4).await.unwrap();
    store.heartbeat_worker(worker_id, 8).await.unwrap();

    let capacity: i32 = sqlx::query_scalar("SELECT capacity FROM workers WHERE id = $1")
        .bind(worker_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(capacity, 8);
}
