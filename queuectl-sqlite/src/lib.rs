//! SQLite implementation of the queuectl `JobStore`.
//!
//! One local file holds the whole queue. WAL journaling keeps readers and
//! writers out of each other's way; write transactions are serialized by
//! SQLite itself, which is what makes the single-statement claim
//! linearizable.

pub mod store;
pub mod types;

pub use store::SqliteStore;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use queuectl_core::core::store::StoreError;

/// Schema version written by this build. `init_store` migrates upward and
/// refuses to touch anything newer.
pub const SCHEMA_VERSION: i64 = 1;

async fn connect(path: &Path, create: bool) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    Ok(pool)
}

/// Create the store file and schema if absent, migrate an older schema
/// upward, and return a ready pool. Idempotent.
pub async fn init_store(path: &Path) -> Result<SqlitePool, StoreError> {
    let pool = connect(path, true).await?;
    migrate(&pool).await?;
    info!(path = %path.display(), "store initialized");
    Ok(pool)
}

/// Open an existing store, verifying its schema version. Commands other
/// than `initdb` go through here so a missing or newer-than-supported
/// database is a startup error, not a runtime surprise.
pub async fn open_store(path: &Path) -> Result<SqlitePool, StoreError> {
    if !path.exists() {
        return Err(StoreError::Database(anyhow::anyhow!(
            "no store at {} (run `queuectl initdb` first)",
            path.display()
        )));
    }
    let pool = connect(path, false).await?;
    let version = schema_version(&pool).await?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version < 1 {
        return Err(StoreError::Database(anyhow::anyhow!(
            "store at {} has no schema (run `queuectl initdb`)",
            path.display()
        )));
    }
    Ok(pool)
}

async fn schema_version(pool: &SqlitePool) -> Result<i64, StoreError> {
    let has_meta: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'queuectl_meta'",
    )
    .fetch_optional(pool)
    .await
    .context("failed to inspect schema")?;
    if has_meta.is_none() {
        return Ok(0);
    }

    let version: Option<(i64,)> = sqlx::query_as("SELECT version FROM queuectl_meta LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("failed to read schema version")?;
    Ok(version.map(|(v,)| v).unwrap_or(0))
}

async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await.context("failed to begin migration")?;

    sqlx::query("CREATE TABLE IF NOT EXISTS queuectl_meta (version INTEGER NOT NULL)")
        .execute(&mut *tx)
        .await
        .context("failed to create meta table")?;

    let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM queuectl_meta LIMIT 1")
        .fetch_optional(&mut *tx)
        .await
        .context("failed to read schema version")?;
    let current = match current {
        Some((v,)) => v,
        None => {
            sqlx::query("INSERT INTO queuectl_meta (version) VALUES (0)")
                .execute(&mut *tx)
                .await
                .context("failed to seed schema version")?;
            0
        }
    };

    if current > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    if current < 1 {
        debug!("applying schema migration v1");
        sqlx::query(
            "CREATE TABLE jobs (
                id             TEXT PRIMARY KEY,
                command        TEXT NOT NULL,
                state          TEXT NOT NULL CHECK (state IN
                    ('pending', 'processing', 'completed', 'failed_transient', 'dead')),
                priority       INTEGER NOT NULL DEFAULT 0,
                max_retries    INTEGER NOT NULL DEFAULT 3,
                attempts       INTEGER NOT NULL DEFAULT 0,
                run_at         INTEGER NOT NULL,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL,
                last_exit_code INTEGER,
                stdout_tail    TEXT,
                stderr_tail    TEXT,
                worker_id      TEXT,
                claimed_at     INTEGER
            )",
        )
        .execute(&mut *tx)
        .await
        .context("failed to create jobs table")?;

        sqlx::query(
            "CREATE INDEX idx_jobs_claim ON jobs (state, priority DESC, run_at ASC, id ASC)",
        )
        .execute(&mut *tx)
        .await
        .context("failed to create claim index")?;
        sqlx::query("CREATE INDEX idx_jobs_reap ON jobs (state, claimed_at)")
            .execute(&mut *tx)
            .await
            .context("failed to create reap index")?;
        sqlx::query("CREATE INDEX idx_jobs_list ON jobs (state, created_at)")
            .execute(&mut *tx)
            .await
            .context("failed to create list index")?;

        sqlx::query("UPDATE queuectl_meta SET version = 1")
            .execute(&mut *tx)
            .await
            .context("failed to record schema version")?;
    }

    tx.commit().await.context("failed to commit migration")?;
    Ok(())
}
