//! Worker-loop behavior against the real SQLite store: the claim→execute→
//! record cycle, retry scheduling, DLQ exhaustion and cooperative shutdown.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use queuectl_core::core::backoff::BackoffPolicy;
use queuectl_core::core::clock::SystemClock;
use queuectl_core::core::job::{JobState, NewJob};
use queuectl_core::core::outcome::Outcome;
use queuectl_core::core::store::JobStore;
use queuectl_core::core::Duration;
use queuectl_core::runner::executor::{Executor, ShellExecutor};
use queuectl_core::runner::worker::{generate_worker_id, Worker, WorkerOptions};
use queuectl_sqlite::{init_store, SqliteStore};
use uuid::Uuid;

struct TempDb(PathBuf);

impl TempDb {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "queuectl-worker-{tag}-{}",
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

/// Executor that replays a script of outcomes, then keeps succeeding.
struct ScriptedExecutor {
    script: Mutex<VecDeque<Outcome>>,
    delay: StdDuration,
}

impl ScriptedExecutor {
    fn new(script: Vec<Outcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            delay: StdDuration::ZERO,
        }
    }

    fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, _command: &str, _timeout: Option<StdDuration>) -> Outcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Succeeded {
            exit_code: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        })
    }
}

fn fail(exit_code: i32) -> Outcome {
    Outcome::FailedNonZero {
        exit_code,
        stdout_tail: String::new(),
        stderr_tail: "scripted failure".into(),
    }
}

/// Fast loop settings: tight polling, no jitter, short backoff cap so retry
/// waits are milliseconds.
fn fast_options() -> WorkerOptions {
    WorkerOptions {
        poll_interval: StdDuration::from_millis(50),
        poll_jitter: 0.0,
        reap_interval: StdDuration::from_secs(3600),
        ..WorkerOptions::default()
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::default().with_cap(Duration::milliseconds(100))
}

async fn setup(tag: &str) -> (TempDb, SqliteStore) {
    let tmp = TempDb::new(tag);
    let pool = init_store(&tmp.0.join("queue.db")).await.unwrap();
    (tmp, SqliteStore::new(pool, fast_backoff()))
}

async fn wait_for_state(store: &SqliteStore, id: Uuid, wanted: JobState, budget: StdDuration) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let job = store.get(id).await.unwrap();
        if job.state == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {:?}, wanted {wanted:?}",
            job.state
        );
        tokio::time::sleep(StdDuration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_trip_success_with_real_shell() {
    let (_tmp, store) = setup("round-trip").await;
    let id = store.enqueue(NewJob::new("true")).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        generate_worker_id(),
        store.clone(),
        ShellExecutor::new(),
        SystemClock,
        fast_options(),
    );
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    wait_for_state(&store, id, JobState::Completed, StdDuration::from_secs(2)).await;
    let job = store.get(id).await.unwrap();
    assert_eq!(job.last_exit_code, Some(0));
    assert_eq!(job.attempts, 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_then_succeed() {
    let (_tmp, store) = setup("retry-succeed").await;
    let id = store
        .enqueue(NewJob::new("flaky").with_max_retries(3))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        generate_worker_id(),
        store.clone(),
        ScriptedExecutor::new(vec![fail(1)]),
        SystemClock,
        fast_options(),
    );
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    wait_for_state(&store, id, JobState::Completed, StdDuration::from_secs(3)).await;
    let job = store.get(id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_exit_code, Some(0));

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_land_in_dlq() {
    let (_tmp, store) = setup("dlq").await;
    let id = store
        .enqueue(NewJob::new("doomed").with_max_retries(2))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        generate_worker_id(),
        store.clone(),
        ScriptedExecutor::new(vec![fail(7), fail(7), fail(7), fail(7)]),
        SystemClock,
        fast_options(),
    );
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    wait_for_state(&store, id, JobState::Dead, StdDuration::from_secs(3)).await;
    let job = store.get(id).await.unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_exit_code, Some(7));

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_worker_stops_within_a_poll() {
    let (_tmp, store) = setup("idle-stop").await;

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        generate_worker_id(),
        store,
        ShellExecutor::new(),
        SystemClock,
        fast_options(),
    );
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    shutdown.cancel();
    tokio::time::timeout(StdDuration::from_secs(1), handle)
        .await
        .expect("worker did not stop within a poll interval")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_worker_never_claims() {
    let (_tmp, store) = setup("no-claim").await;
    let id = store.enqueue(NewJob::new("true")).await.unwrap();

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let worker = Worker::new(
        generate_worker_id(),
        store.clone(),
        ShellExecutor::new(),
        SystemClock,
        fast_options(),
    );
    worker.run(shutdown).await.unwrap();

    assert_eq!(store.get(id).await.unwrap().state, JobState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_the_in_flight_job() {
    let (_tmp, store) = setup("drain").await;
    let id = store.enqueue(NewJob::new("slow")).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        generate_worker_id(),
        store.clone(),
        ScriptedExecutor::new(vec![]).with_delay(StdDuration::from_millis(500)),
        SystemClock,
        fast_options(),
    );
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    wait_for_state(&store, id, JobState::Processing, StdDuration::from_secs(2)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // The in-flight job was finished and recorded, not abandoned.
    assert_eq!(store.get(id).await.unwrap().state, JobState::Completed);
}
