//! Analysis result persistence
//!
//! Every run inserts a new row with the next version number; readers take
//! the latest version per track and the rest is retained as history.

use crate::models::{AnalysisResult, Issue};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tonelab_common::Result;
use uuid::Uuid;

/// Insert a result for a track. `result.version` is assigned here as
/// one past the track's current maximum.
pub async fn create_analysis_result(
    pool: &SqlitePool,
    result: &mut AnalysisResult,
) -> Result<()> {
    result.id = Uuid::new_v4().to_string();
    result.created_at = Utc::now();

    let max_version: Option<i32> =
        sqlx::query_scalar("SELECT MAX(version) FROM analysis_results WHERE track_id = ?")
            .bind(&result.track_id)
            .fetch_one(pool)
            .await?;
    result.version = max_version.unwrap_or(0) + 1;

    sqlx::query(
        "INSERT INTO analysis_results
         (id, track_id, version, lossless_score, lossless_status, integrity_ok, decode_errors,
          peak_level, true_peak, crest_factor, clipped_samples, dc_offset,
          integrated_loudness, loudness_range, high_freq_cutoff, spectral_rolloff,
          phase_correlation, issues_json, stats_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&result.id)
    .bind(&result.track_id)
    .bind(result.version)
    .bind(result.lossless_score)
    .bind(&result.lossless_status)
    .bind(result.integrity_ok)
    .bind(result.decode_errors)
    .bind(result.peak_level)
    .bind(result.true_peak)
    .bind(result.crest_factor)
    .bind(result.clipped_samples)
    .bind(result.dc_offset)
    .bind(result.integrated_loudness)
    .bind(result.loudness_range)
    .bind(result.high_freq_cutoff)
    .bind(result.spectral_rolloff)
    .bind(result.phase_correlation)
    .bind(&result.issues_json)
    .bind(&result.stats_json)
    .bind(result.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Latest result for a track, or `None` if it has never been analyzed.
pub async fn get_latest_result(
    pool: &SqlitePool,
    track_id: &str,
) -> Result<Option<AnalysisResult>> {
    let result = sqlx::query_as::<_, AnalysisResult>(
        "SELECT * FROM analysis_results WHERE track_id = ? ORDER BY version DESC LIMIT 1",
    )
    .bind(track_id)
    .fetch_optional(pool)
    .await?;
    Ok(result)
}

/// Merge module summary maps into the latest result's stats. Best-effort:
/// the caller treats failure as non-fatal because the manifest remains
/// the source of truth.
pub async fn merge_latest_stats(
    pool: &SqlitePool,
    track_id: &str,
    module_stats: &HashMap<String, Value>,
) -> Result<bool> {
    let Some(result) = get_latest_result(pool, track_id).await? else {
        return Ok(false);
    };

    let mut stats = result.stats();
    for (module, summary) in module_stats {
        stats.insert(module.clone(), summary.clone());
    }

    let stats_json = serde_json::to_string(&stats)
        .map_err(|e| tonelab_common::Error::Internal(format!("serialize stats: {}", e)))?;

    sqlx::query("UPDATE analysis_results SET stats_json = ? WHERE id = ?")
        .bind(stats_json)
        .bind(&result.id)
        .execute(pool)
        .await?;

    Ok(true)
}

/// Convenience used by the first-pass analyzer to serialize issues.
pub fn issues_to_json(issues: &[Issue]) -> String {
    serde_json::to_string(issues).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::libraries::{create_library, NewLibrary};
    use crate::db::media_files::create_media_file;
    use crate::db::tracks::create_track;
    use crate::models::{lossless, Track};

    async fn setup_track(pool: &SqlitePool) -> String {
        let library = create_library(
            pool,
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
        let file = create_media_file(pool, &library.id, "/music/a.flac", 1, Utc::now())
            .await
            .unwrap();
        let mut track = Track {
            media_file_id: file.id,
            ..Default::default()
        };
        create_track(pool, &mut track).await.unwrap();
        track.id
    }

    fn blank_result(track_id: &str) -> AnalysisResult {
        AnalysisResult {
            id: String::new(),
            track_id: track_id.to_string(),
            version: 0,
            lossless_score: 100.0,
            lossless_status: lossless::PASS.to_string(),
            integrity_ok: true,
            decode_errors: 0,
            peak_level: -1.0,
            true_peak: -0.8,
            crest_factor: 12.0,
            clipped_samples: 0,
            dc_offset: 0.0,
            integrated_loudness: -14.0,
            loudness_range: 8.0,
            high_freq_cutoff: 0.0,
            spectral_rolloff: 0.0,
            phase_correlation: 0.95,
            issues_json: "[]".to_string(),
            stats_json: "{}".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn versions_increment_and_latest_wins() {
        let pool = connect_in_memory().await.unwrap();
        let track_id = setup_track(&pool).await;

        let mut first = blank_result(&track_id);
        create_analysis_result(&pool, &mut first).await.unwrap();
        assert_eq!(first.version, 1);

        let mut second = blank_result(&track_id);
        second.lossless_status = lossless::WARN.to_string();
        create_analysis_result(&pool, &mut second).await.unwrap();
        assert_eq!(second.version, 2);

        let latest = get_latest_result(&pool, &track_id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.lossless_status, lossless::WARN);
    }

    #[tokio::test]
    async fn merge_stats_updates_latest_row() {
        let pool = connect_in_memory().await.unwrap();
        let track_id = setup_track(&pool).await;

        let mut result = blank_result(&track_id);
        create_analysis_result(&pool, &mut result).await.unwrap();

        let mut stats = HashMap::new();
        stats.insert(
            "loudness".to_string(),
            serde_json::json!({"integratedLUFS": -14.2}),
        );
        assert!(merge_latest_stats(&pool, &track_id, &stats).await.unwrap());

        let latest = get_latest_result(&pool, &track_id).await.unwrap().unwrap();
        assert_eq!(latest.stats()["loudness"]["integratedLUFS"], -14.2);
    }

    #[tokio::test]
    async fn merge_stats_without_result_is_noop() {
        let pool = connect_in_memory().await.unwrap();
        let track_id = setup_track(&pool).await;

        let merged = merge_latest_stats(&pool, &track_id, &HashMap::new())
            .await
            .unwrap();
        assert!(!merged);
    }
}
