//! Database access for tonelab-lab
//!
//! SQLite via sqlx with WAL journaling, a 5 second busy timeout and
//! foreign keys enforced. All components go through the typed operations
//! in the per-entity modules below; nothing else touches raw storage.

pub mod action_logs;
pub mod albums;
pub mod analysis_results;
pub mod artifacts;
pub mod jobs;
pub mod libraries;
pub mod media_files;
pub mod profiles;
pub mod retry;
pub mod scan_runs;
pub mod schema;
pub mod settings;
pub mod stats;
pub mod tracks;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tonelab_common::{Error, Result};

/// Map a constraint violation to `Conflict`, leaving other errors as
/// store failures.
pub(crate) fn map_constraint(err: sqlx::Error, what: &str) -> Error {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.message().contains("UNIQUE constraint failed") {
            return Error::Conflict(format!("{} already exists", what));
        }
    }
    Error::Database(err)
}

/// Open (creating if missing) the database at `dsn` and apply migrations.
///
/// Writes are serialized by SQLite's single-writer discipline; the busy
/// timeout plus [`retry::retry_on_lock`] absorb short contention windows
/// between scanner writes and worker updates.
pub async fn connect(dsn: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(dsn).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", dsn))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    schema::initialize_schema(&pool).await?;
    schema::seed_defaults(&pool).await?;

    tracing::info!(dsn = %dsn, "Database ready");
    Ok(pool)
}

/// In-memory pool, used by tests and one-shot tooling. Single connection
/// so every query sees the same database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(sqlx::Error::from)?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    schema::initialize_schema(&pool).await?;
    schema::seed_defaults(&pool).await?;
    Ok(pool)
}
