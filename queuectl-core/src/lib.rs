//! Core of queuectl: the persistent job model, the store contract every
//! backend implements, and the worker runtime that executes shell commands
//! against it.

pub mod core;

/// Shared test specifications for backend implementations.
///
/// These test functions ensure consistent behavior across all `JobStore`
/// implementations. Backend tests should call these functions with their
/// store instance.
#[doc(hidden)]
pub mod store_spec;

/// Default implementation of the execution side: shell executor and the
/// per-process worker loop.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod executor;
    pub mod worker;
}

/// Re-exports to simplify importing this crate's types.
pub mod prelude {
    pub use super::core::{
        api::QueueApi,
        backoff::BackoffPolicy,
        clock::{Clock, SystemClock},
        job::{Job, JobFilter, JobState, NewJob},
        outcome::{Disposition, Outcome},
        store::{JobStore, StoreError},
        CancellationToken, DateTime, Duration, Uuid,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::{
        executor::{Executor, ShellExecutor},
        worker::{Worker, WorkerOptions},
    };
}
