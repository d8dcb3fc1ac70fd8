//! Dashboard aggregates

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tonelab_common::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_libraries: i64,
    pub total_tracks: i64,
    pub total_size: i64,
    pub tracks_with_issues: i64,
    pub active_jobs: i64,
    pub recent_scans: i64,
}

pub async fn dashboard_stats(pool: &SqlitePool) -> Result<DashboardStats> {
    let total_libraries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM libraries")
        .fetch_one(pool)
        .await?;
    let total_tracks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
        .fetch_one(pool)
        .await?;
    let total_size: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(size), 0) FROM media_files WHERE status != 'deleted'",
    )
    .fetch_one(pool)
    .await?;
    let tracks_with_issues: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT t.id) FROM tracks t
         JOIN analysis_results ar ON ar.track_id = t.id
         WHERE ar.lossless_status != 'pass'
           AND ar.version = (SELECT MAX(version) FROM analysis_results WHERE track_id = t.id)",
    )
    .fetch_one(pool)
    .await?;
    let active_jobs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'running')")
            .fetch_one(pool)
            .await?;
    let recent_scans: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM scan_runs WHERE started_at > datetime('now', '-24 hours')",
    )
    .fetch_one(pool)
    .await?;

    Ok(DashboardStats {
        total_libraries,
        total_tracks,
        total_size,
        tracks_with_issues,
        active_jobs,
        recent_scans,
    })
}
