//! Scan run persistence

use crate::models::{status, ScanRun};
use chrono::Utc;
use sqlx::SqlitePool;
use tonelab_common::{Error, Result};
use uuid::Uuid;

/// Open a new run in `running` state.
pub async fn create_scan_run(pool: &SqlitePool, library_id: &str) -> Result<ScanRun> {
    let run = ScanRun {
        id: Uuid::new_v4().to_string(),
        library_id: library_id.to_string(),
        status: status::RUNNING.to_string(),
        files_found: 0,
        files_new: 0,
        files_changed: 0,
        files_deleted: 0,
        files_failed: 0,
        started_at: Utc::now(),
        finished_at: None,
        error_msg: None,
    };

    sqlx::query(
        "INSERT INTO scan_runs
         (id, library_id, status, files_found, files_new, files_changed, files_deleted, files_failed, started_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&run.id)
    .bind(&run.library_id)
    .bind(&run.status)
    .bind(run.files_found)
    .bind(run.files_new)
    .bind(run.files_changed)
    .bind(run.files_deleted)
    .bind(run.files_failed)
    .bind(run.started_at)
    .execute(pool)
    .await?;

    Ok(run)
}

/// Write the final counters and status. Runs are immutable afterwards.
pub async fn update_scan_run(pool: &SqlitePool, run: &ScanRun) -> Result<()> {
    let result = sqlx::query(
        "UPDATE scan_runs SET
             status = ?, files_found = ?, files_new = ?, files_changed = ?,
             files_deleted = ?, files_failed = ?, finished_at = ?, error_msg = ?
         WHERE id = ?",
    )
    .bind(&run.status)
    .bind(run.files_found)
    .bind(run.files_new)
    .bind(run.files_changed)
    .bind(run.files_deleted)
    .bind(run.files_failed)
    .bind(run.finished_at)
    .bind(&run.error_msg)
    .bind(&run.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("scan run {}", run.id)));
    }
    Ok(())
}

pub async fn list_scan_runs(
    pool: &SqlitePool,
    library_id: &str,
    limit: i64,
) -> Result<Vec<ScanRun>> {
    let runs = sqlx::query_as::<_, ScanRun>(
        "SELECT * FROM scan_runs WHERE library_id = ? ORDER BY started_at DESC LIMIT ?",
    )
    .bind(library_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::libraries::{create_library, NewLibrary};

    #[tokio::test]
    async fn run_lifecycle() {
        let pool = connect_in_memory().await.unwrap();
        let library = create_library(
            &pool,
            NewLibrary {
                name: "Main".to_string(),
                root_path: "/music".to_string(),
                scan_interval: "15m".to_string(),
                read_only: true,
                output_path: None,
                allowed_formats: None,
            },
        )
        .await
        .unwrap();

        let mut run = create_scan_run(&pool, &library.id).await.unwrap();
        assert_eq!(run.status, status::RUNNING);

        run.files_found = 3;
        run.files_new = 3;
        run.status = status::SUCCESS.to_string();
        run.finished_at = Some(Utc::now());
        update_scan_run(&pool, &run).await.unwrap();

        let runs = list_scan_runs(&pool, &library.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].files_new, 3);
        assert!(runs[0].finished_at.is_some());
    }
}
