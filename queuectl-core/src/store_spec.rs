//! Shared test specifications for `JobStore` implementations.
//!
//! These functions can be called by any backend to ensure consistent
//! state-machine behavior. They assume the store was constructed with the
//! default backoff policy (base 2, no jitter) and drive time explicitly
//! through the `now` parameters, so none of them sleep.

use uuid::Uuid;

use crate::core::job::{JobFilter, JobState, NewJob};
use crate::core::outcome::Outcome;
use crate::core::store::{JobStore, StoreError};
use crate::core::{DateTime, Duration, Utc};

/// Stores persist timestamps at millisecond precision; test clocks start
/// there so equality assertions are exact.
fn now_ms() -> DateTime {
    use chrono::TimeZone;
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis()).unwrap()
}

fn success() -> Outcome {
    Outcome::Succeeded {
        exit_code: 0,
        stdout_tail: "out".into(),
        stderr_tail: String::new(),
    }
}

fn failure(exit_code: i32) -> Outcome {
    Outcome::FailedNonZero {
        exit_code,
        stdout_tail: String::new(),
        stderr_tail: "boom".into(),
    }
}

/// Enqueue/get roundtrip preserves every field.
pub async fn enqueue_then_get<S: JobStore>(store: S) {
    let run_at = now_ms() + Duration::minutes(10);
    let id = store
        .enqueue(
            NewJob::new("echo hello")
                .with_priority(7)
                .with_max_retries(5)
                .run_at(run_at),
        )
        .await
        .unwrap();

    let job = store.get(id).await.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.command, "echo hello");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.priority, 7);
    assert_eq!(job.max_retries, 5);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.run_at, run_at);
    assert_eq!(job.last_exit_code, None);
    assert_eq!(job.worker_id, None);
    assert_eq!(job.claimed_at, None);
    assert_eq!(job.created_at, job.updated_at);
}

/// Missing ids surface `NotFound`.
pub async fn get_missing_job_is_not_found<S: JobStore>(store: S) {
    let id = Uuid::now_v7();
    match store.get(id).await {
        Err(StoreError::NotFound(missing)) => assert_eq!(missing, id),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

/// An empty store has nothing to claim.
pub async fn claim_from_empty_store_returns_none<S: JobStore>(store: S) {
    assert!(store.claim_one("w1", now_ms()).await.unwrap().is_none());
}

/// A claim sets the processing lease and makes the job invisible to other
/// claimers.
pub async fn claim_marks_processing<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store.enqueue(NewJob::new("true").run_at(now)).await.unwrap();

    let job = store.claim_one("w1", now).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("w1"));
    assert_eq!(job.claimed_at, Some(now));
    // Claiming does not count as an attempt.
    assert_eq!(job.attempts, 0);

    assert!(store.claim_one("w2", now).await.unwrap().is_none());
}

/// Higher priority wins; ties break on earlier `run_at`, then insertion id.
pub async fn claim_orders_by_priority_then_run_at<S: JobStore>(store: S) {
    let now = now_ms();
    let low = store
        .enqueue(NewJob::new("low").with_priority(0).run_at(now - Duration::minutes(5)))
        .await
        .unwrap();
    let high = store
        .enqueue(NewJob::new("high").with_priority(10).run_at(now))
        .await
        .unwrap();
    let mid_late = store
        .enqueue(NewJob::new("mid late").with_priority(5).run_at(now))
        .await
        .unwrap();
    let mid_early = store
        .enqueue(
            NewJob::new("mid early")
                .with_priority(5)
                .run_at(now - Duration::minutes(1)),
        )
        .await
        .unwrap();

    let order: Vec<Uuid> = [
        store.claim_one("w1", now).await.unwrap().unwrap().id,
        store.claim_one("w1", now).await.unwrap().unwrap().id,
        store.claim_one("w1", now).await.unwrap().unwrap().id,
        store.claim_one("w1", now).await.unwrap().unwrap().id,
    ]
    .to_vec();
    assert_eq!(order, vec![high, mid_early, mid_late, low]);
}

/// A scheduled job is invisible until its `run_at` passes.
pub async fn claim_respects_run_at<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store
        .enqueue(NewJob::new("later").run_at(now + Duration::hours(1)))
        .await
        .unwrap();

    assert!(store.claim_one("w1", now).await.unwrap().is_none());
    assert!(store
        .claim_one("w1", now + Duration::minutes(59))
        .await
        .unwrap()
        .is_none());

    let job = store
        .claim_one("w1", now + Duration::hours(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
}

/// A successful attempt completes the job and releases the lease.
pub async fn success_outcome_completes_job<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store.enqueue(NewJob::new("true").run_at(now)).await.unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();

    let state = store
        .record_outcome(id, "w1", &success(), now)
        .await
        .unwrap();
    assert_eq!(state, JobState::Completed);

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_exit_code, Some(0));
    assert_eq!(job.stdout_tail.as_deref(), Some("out"));
    assert_eq!(job.worker_id, None);
    assert_eq!(job.claimed_at, None);
}

/// A retryable failure reschedules with exponential backoff from the
/// post-increment attempt count: the first retry waits base^1 = 2 s.
pub async fn failure_schedules_retry_with_backoff<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store
        .enqueue(NewJob::new("false").with_max_retries(3).run_at(now))
        .await
        .unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();

    let state = store
        .record_outcome(id, "w1", &failure(1), now)
        .await
        .unwrap();
    assert_eq!(state, JobState::FailedTransient);

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::FailedTransient);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_exit_code, Some(1));
    assert_eq!(job.stderr_tail.as_deref(), Some("boom"));
    assert_eq!(job.worker_id, None);
    assert_eq!(job.claimed_at, None);
    assert_eq!(job.run_at, now + Duration::seconds(2));

    // Not ready before the backoff expires, ready after.
    assert!(store.claim_one("w1", now).await.unwrap().is_none());
    assert!(store
        .claim_one("w1", now + Duration::seconds(3))
        .await
        .unwrap()
        .is_some());
}

/// Failures past the retry budget bury the job: with `max_retries = 2` the
/// third failed attempt lands in the DLQ with `attempts = 3`.
pub async fn exhaustion_moves_job_to_dlq<S: JobStore>(store: S) {
    let mut now = now_ms();
    let id = store
        .enqueue(NewJob::new("false").with_max_retries(2).run_at(now))
        .await
        .unwrap();

    for expected_attempts in 1..=2u32 {
        store.claim_one("w1", now).await.unwrap().unwrap();
        let state = store
            .record_outcome(id, "w1", &failure(9), now)
            .await
            .unwrap();
        assert_eq!(state, JobState::FailedTransient);
        let job = store.get(id).await.unwrap();
        assert_eq!(job.attempts, expected_attempts);
        // Jump past the backoff.
        now = job.run_at + Duration::seconds(1);
    }

    store.claim_one("w1", now).await.unwrap().unwrap();
    let state = store
        .record_outcome(id, "w1", &failure(9), now)
        .await
        .unwrap();
    assert_eq!(state, JobState::Dead);

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_exit_code, Some(9));
    assert_eq!(job.worker_id, None);

    // Dead jobs are not claimable.
    assert!(store
        .claim_one("w1", now + Duration::hours(24))
        .await
        .unwrap()
        .is_none());
}

/// Recording an outcome for a claim the caller no longer holds is rejected
/// and leaves the row untouched.
pub async fn record_outcome_is_guarded_by_worker<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store.enqueue(NewJob::new("true").run_at(now)).await.unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();

    match store.record_outcome(id, "w2", &success(), now).await {
        Err(StoreError::LostClaim { id: lost, worker_id }) => {
            assert_eq!(lost, id);
            assert_eq!(worker_id, "w2");
        }
        other => panic!("expected LostClaim, got {other:?}"),
    }

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("w1"));
    assert_eq!(job.attempts, 0);
}

/// Recording an outcome against a job that was never claimed is the same
/// lost-claim rejection (the lease simply does not exist).
pub async fn record_outcome_without_claim_is_rejected<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store.enqueue(NewJob::new("true").run_at(now)).await.unwrap();

    assert!(matches!(
        store.record_outcome(id, "w1", &success(), now).await,
        Err(StoreError::LostClaim { .. })
    ));
    assert!(matches!(
        store
            .record_outcome(Uuid::now_v7(), "w1", &success(), now)
            .await,
        Err(StoreError::NotFound(_))
    ));
}

/// `requeue` resurrects a dead job with a fresh budget.
pub async fn requeue_dead_job_resets<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store
        .enqueue(NewJob::new("false").with_max_retries(0).run_at(now))
        .await
        .unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();
    let state = store
        .record_outcome(id, "w1", &failure(1), now)
        .await
        .unwrap();
    assert_eq!(state, JobState::Dead);

    let later = now + Duration::minutes(30);
    store.requeue(id, later).await.unwrap();

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.run_at, later);

    // And it is immediately claimable again.
    let claimed = store.claim_one("w2", later).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

/// `requeue` refuses anything that is not dead.
pub async fn requeue_non_dead_job_fails<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store.enqueue(NewJob::new("true").run_at(now)).await.unwrap();

    match store.requeue(id, now).await {
        Err(StoreError::NotDead { id: rejected, state }) => {
            assert_eq!(rejected, id);
            assert_eq!(state, JobState::Pending);
        }
        other => panic!("expected NotDead, got {other:?}"),
    }

    assert!(matches!(
        store.requeue(Uuid::now_v7(), now).await,
        Err(StoreError::NotFound(_))
    ));
}

/// Completed is terminal: the job never reappears in the ready set.
pub async fn completed_job_is_never_reclaimed<S: JobStore>(store: S) {
    let now = now_ms();
    let id = store.enqueue(NewJob::new("true").run_at(now)).await.unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();
    store
        .record_outcome(id, "w1", &success(), now)
        .await
        .unwrap();

    assert!(store
        .claim_one("w1", now + Duration::days(7))
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.get(id).await.unwrap().state, JobState::Completed);

    // Terminal but completed, so requeue refuses too.
    assert!(matches!(
        store.requeue(id, now).await,
        Err(StoreError::NotDead { .. })
    ));
}

/// Listing filters by state and honors the limit, oldest first.
pub async fn listing_filters_by_state<S: JobStore>(store: S) {
    let now = now_ms();
    let first = store.enqueue(NewJob::new("one").run_at(now)).await.unwrap();
    let second = store.enqueue(NewJob::new("two").run_at(now)).await.unwrap();
    let third = store.enqueue(NewJob::new("three").run_at(now)).await.unwrap();
    store.claim_one("w1", now).await.unwrap().unwrap();

    let pending = store
        .list(JobFilter::with_state(JobState::Pending))
        .await
        .unwrap();
    assert_eq!(
        pending.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![second, third]
    );

    let processing = store
        .list(JobFilter::with_state(JobState::Processing))
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, first);

    let all = store.list(JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let limited = store.list(JobFilter::default().limit(2)).await.unwrap();
    assert_eq!(limited.len(), 2);

    assert!(store
        .list(JobFilter::with_state(JobState::Dead))
        .await
        .unwrap()
        .is_empty());
}

/// At-most-once concurrent execution: K claimers racing over N jobs never
/// observe the same job twice.
pub async fn concurrent_claims_are_distinct<S>(store: S)
where
    S: JobStore + Clone + 'static,
{
    const JOBS: usize = 50;
    const WORKERS: usize = 8;

    let now = now_ms();
    let mut expected = Vec::with_capacity(JOBS);
    for n in 0..JOBS {
        expected.push(
            store
                .enqueue(NewJob::new(format!("job {n}")).run_at(now))
                .await
                .unwrap(),
        );
    }

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let store = store.clone();
        let worker_id = format!("w{worker}");
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match store.claim_one(&worker_id, now_ms()).await {
                    Ok(Some(job)) => claimed.push(job.id),
                    Ok(None) => break,
                    Err(e) => panic!("claim failed: {e}"),
                }
            }
            claimed
        }));
    }

    let mut seen = std::collections::HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} was claimed twice");
            total += 1;
        }
    }
    assert_eq!(total, JOBS);
    for id in expected {
        assert!(seen.contains(&id));
    }
}

/// A stale claim is returned to the retry machinery; a fresh claim is left
/// alone.
pub async fn reap_returns_stale_claims_to_queue<S: JobStore>(store: S) {
    let t0 = now_ms();
    let stale = store
        .enqueue(NewJob::new("stale").with_max_retries(3).run_at(t0))
        .await
        .unwrap();
    store.claim_one("w-dead", t0).await.unwrap().unwrap();

    let t1 = t0 + Duration::minutes(2);
    let fresh = store
        .enqueue(NewJob::new("fresh").with_max_retries(3).run_at(t1))
        .await
        .unwrap();
    store.claim_one("w-live", t1).await.unwrap().unwrap();

    let reaped = store
        .reap_orphans(Duration::minutes(1), t1)
        .await
        .unwrap();
    assert_eq!(reaped, vec![stale]);

    let job = store.get(stale).await.unwrap();
    assert_eq!(job.state, JobState::FailedTransient);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.worker_id, None);
    assert!(job.run_at > t1);

    let untouched = store.get(fresh).await.unwrap();
    assert_eq!(untouched.state, JobState::Processing);
    assert_eq!(untouched.worker_id.as_deref(), Some("w-live"));

    // The reaped job becomes claimable once its backoff passes.
    let claimed = store
        .claim_one("w2", job.run_at + Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, stale);
}

/// Reaping an orphan whose budget is spent buries it.
pub async fn reap_buries_exhausted_jobs<S: JobStore>(store: S) {
    let t0 = now_ms();
    let id = store
        .enqueue(NewJob::new("doomed").with_max_retries(0).run_at(t0))
        .await
        .unwrap();
    store.claim_one("w-dead", t0).await.unwrap().unwrap();

    let reaped = store
        .reap_orphans(Duration::minutes(1), t0 + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(reaped, vec![id]);

    let job = store.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 1);
}
