//! Backend-agnostic types and traits, plus re-exports of 3rd party types
//! used in the public interface.

pub use uuid::Uuid;

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::{Duration, Utc};
pub use tokio_util::sync::CancellationToken;

pub mod api;
pub mod backoff;
pub mod clock;
pub mod job;
pub mod outcome;
pub mod store;
