//! Control-API behavior over the SQLite store: defaulting rules, the DLQ
//! listing shorthand, and clock injection.

use std::path::PathBuf;

use queuectl_core::core::api::QueueApi;
use queuectl_core::core::clock::{Clock, ManualClock};
use queuectl_core::core::job::{JobState, NewJob};
use queuectl_core::core::outcome::Outcome;
use queuectl_core::core::store::{JobStore, StoreError};
use queuectl_core::core::{Duration, Utc};
use queuectl_sqlite::{init_store, SqliteStore};
use uuid::Uuid;

struct TempDb(PathBuf);

impl TempDb {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "queuectl-api-{tag}-{}",
            Uuid::now_v7().simple()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn now_ms() -> queuectl_core::core::DateTime {
    use chrono::TimeZone;
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis()).unwrap()
}

async fn api(tag: &str) -> (TempDb, QueueApi<SqliteStore, ManualClock>, ManualClock) {
    let tmp = TempDb::new(tag);
    let pool = init_store(&tmp.0.join("queue.db")).await.unwrap();
    let clock = ManualClock::new(now_ms());
    (tmp, QueueApi::new(SqliteStore::with_pool(pool), clock.clone()), clock)
}

#[tokio::test]
async fn enqueue_defaults_run_at_to_the_clock() {
    let (_tmp, api, clock) = api("enqueue-default").await;
    clock.advance(Duration::minutes(5));

    let id = api.enqueue("true".into(), 0, 3, None).await.unwrap();
    let job = api.get(id).await.unwrap();
    assert_eq!(job.run_at, clock.now());

    // An explicit run_at wins over the clock.
    let at = clock.now() + Duration::hours(1);
    let id = api.enqueue("true".into(), 0, 3, Some(at)).await.unwrap();
    assert_eq!(api.get(id).await.unwrap().run_at, at);
}

#[tokio::test]
async fn dlq_flag_overrides_state_filter() {
    let (_tmp, api, clock) = api("dlq-flag").await;
    let now = clock.now();

    let store = api.store();
    let dead = store
        .enqueue(NewJob::new("false").with_max_retries(0).run_at(now))
        .await
        .unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();
    store
        .record_outcome(
            dead,
            "w1",
            &Outcome::FailedNonZero {
                exit_code: 1,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
            },
            now,
        )
        .await
        .unwrap();
    let pending = store.enqueue(NewJob::new("true").run_at(now)).await.unwrap();

    let listed = api.list(Some(JobState::Pending), true, None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, dead);

    let listed = api.list(Some(JobState::Pending), false, None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, pending);
}

#[tokio::test]
async fn requeue_stamps_run_at_from_the_clock() {
    let (_tmp, api, clock) = api("requeue-clock").await;
    let now = clock.now();

    let store = api.store();
    let id = store
        .enqueue(NewJob::new("false").with_max_retries(0).run_at(now))
        .await
        .unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();
    store
        .record_outcome(
            id,
            "w1",
            &Outcome::SpawnFailed {
                message: "gone".into(),
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(api.get(id).await.unwrap().state, JobState::Dead);

    clock.advance(Duration::hours(2));
    api.requeue(id).await.unwrap();

    let job = api.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.run_at, clock.now());
    assert_eq!(job.attempts, 0);

    // A second requeue finds the job pending and refuses.
    assert!(matches!(
        api.requeue(id).await,
        Err(StoreError::NotDead { .. })
    ));
}
