//! Album read models
//!
//! Albums are groupings of tracks by (album, album_artist); the detail
//! view adds the consistency analysis: dominant codec/rate/depth, DR and
//! loudness averages, and per-track outlier flags.

use crate::models::lossless;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tonelab_common::{Error, Result};

/// One row of the album list
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AlbumSummary {
    pub name: String,
    pub artist: String,
    pub year: i32,
    pub track_count: i32,
    pub version_count: i32,
    /// Distinct codecs, comma separated
    pub codecs: String,
    pub total_size: i64,
    pub has_issues: bool,
    pub avg_dr: i32,
    pub is_lossless: bool,
    pub is_suspect: bool,
    pub max_bit_depth: i32,
    pub max_sample_rate: i32,
}

/// A track within the album detail, carrying its latest analysis scalars
/// and the computed outlier flags
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AlbumTrack {
    pub id: String,
    pub track_number: i32,
    pub disc_number: i32,
    pub title: String,
    pub duration: f64,
    pub codec: String,
    pub sample_rate: i32,
    pub bit_depth: i32,
    pub bitrate: i32,
    pub file_size: i64,
    pub path: String,

    pub lossless_status: String,
    pub lossless_score: f64,
    pub integrity_ok: bool,
    pub clipped_samples: i32,
    pub peak_level: f64,
    pub integrated_loudness: f64,
    pub loudness_range: f64,
    pub crest_factor: f64,

    #[sqlx(default)]
    pub dr_score: i32,
    #[sqlx(default)]
    pub is_codec_outlier: bool,
    #[sqlx(default)]
    pub is_sample_rate_outlier: bool,
    #[sqlx(default)]
    pub is_bit_depth_outlier: bool,
    #[sqlx(default)]
    pub is_dr_outlier: bool,
    #[sqlx(default)]
    pub is_loudness_outlier: bool,
    #[sqlx(default)]
    pub is_suspect: bool,
}

/// Aggregated consistency verdict for an album
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumConsistency {
    pub is_consistent: bool,
    pub dominant_codec: String,
    pub dominant_sample_rate: i32,
    pub dominant_bit_depth: i32,
    pub avg_dr: i32,
    pub avg_loudness: f64,
    pub codec_variety: i32,
    pub sample_rate_variety: i32,
    pub bit_depth_variety: i32,
    pub suspect_count: i32,
    pub issue_count: i32,
}

/// Full album view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumDetail {
    pub name: String,
    pub artist: String,
    pub year: i32,
    pub track_count: i32,
    pub total_duration: f64,
    pub total_size: i64,
    pub tracks: Vec<AlbumTrack>,
    pub consistency: AlbumConsistency,
}

/// DR score for one track: loudness range plus half the crest factor,
/// clamped to [1, 20].
pub fn dr_score(loudness_range: f64, crest_factor: f64) -> i32 {
    ((loudness_range + crest_factor / 2.0).round() as i32).clamp(1, 20)
}

pub async fn list_albums(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<AlbumSummary>, i64)> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM (
             SELECT 1 FROM tracks t
             WHERE t.album IS NOT NULL AND t.album != ''
             GROUP BY t.album, COALESCE(t.album_artist, t.artist)
         )",
    )
    .fetch_one(pool)
    .await?;

    let albums = sqlx::query_as::<_, AlbumSummary>(
        r#"
        SELECT
            t.album AS name,
            COALESCE(t.album_artist, t.artist, 'Unknown Artist') AS artist,
            COALESCE(MAX(t.year), 0) AS year,
            COUNT(DISTINCT t.id) AS track_count,
            COUNT(DISTINCT SUBSTR(m.path, 1, LENGTH(m.path) - LENGTH(m.filename) - 1)) AS version_count,
            GROUP_CONCAT(DISTINCT t.codec) AS codecs,
            COALESCE(SUM(m.size), 0) AS total_size,
            CASE WHEN SUM(CASE WHEN ar.lossless_status IS NOT NULL AND ar.lossless_status != 'pass'
                 THEN 1 ELSE 0 END) > 0 THEN 1 ELSE 0 END AS has_issues,
            CAST(COALESCE(AVG(ar.loudness_range + ar.crest_factor / 2), 0) AS INTEGER) AS avg_dr,
            CASE WHEN MAX(t.codec) IN ('flac', 'alac', 'wav', 'aiff') THEN 1 ELSE 0 END AS is_lossless,
            CASE WHEN SUM(CASE WHEN ar.lossless_status IN ('warn', 'fail') THEN 1 ELSE 0 END) > 0
                 THEN 1 ELSE 0 END AS is_suspect,
            COALESCE(MAX(t.bit_depth), 0) AS max_bit_depth,
            COALESCE(MAX(t.sample_rate), 0) AS max_sample_rate
        FROM tracks t
        JOIN media_files m ON t.media_file_id = m.id
        LEFT JOIN analysis_results ar ON ar.track_id = t.id
            AND ar.version = (SELECT MAX(version) FROM analysis_results WHERE track_id = t.id)
        WHERE t.album IS NOT NULL AND t.album != ''
        GROUP BY t.album, COALESCE(t.album_artist, t.artist)
        ORDER BY t.album
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok((albums, total))
}

/// Assemble the album consistency view for `(album, album_artist)`.
pub async fn album_detail(
    pool: &SqlitePool,
    album_name: &str,
    artist_name: &str,
) -> Result<AlbumDetail> {
    let mut tracks = sqlx::query_as::<_, AlbumTrack>(
        r#"
        SELECT
            t.id,
            COALESCE(t.track_number, 0) AS track_number,
            COALESCE(t.disc_number, 1) AS disc_number,
            COALESCE(t.title, m.filename) AS title,
            t.duration,
            t.codec,
            t.sample_rate,
            t.bit_depth,
            COALESCE(t.bitrate, 0) AS bitrate,
            m.size AS file_size,
            m.path,
            COALESCE(ar.lossless_status, 'pending') AS lossless_status,
            COALESCE(ar.lossless_score, 0) AS lossless_score,
            COALESCE(ar.integrity_ok, 1) AS integrity_ok,
            COALESCE(ar.clipped_samples, 0) AS clipped_samples,
            COALESCE(ar.peak_level, 0) AS peak_level,
            COALESCE(ar.integrated_loudness, 0) AS integrated_loudness,
            COALESCE(ar.loudness_range, 0) AS loudness_range,
            COALESCE(ar.crest_factor, 0) AS crest_factor
        FROM tracks t
        JOIN media_files m ON t.media_file_id = m.id
        LEFT JOIN analysis_results ar ON ar.track_id = t.id
            AND ar.version = (SELECT MAX(version) FROM analysis_results WHERE track_id = t.id)
        WHERE t.album = ? AND COALESCE(t.album_artist, t.artist, '') = ?
        ORDER BY t.disc_number, t.track_number, t.title
        "#,
    )
    .bind(album_name)
    .bind(artist_name)
    .fetch_all(pool)
    .await?;

    if tracks.is_empty() {
        return Err(Error::NotFound(format!(
            "album {:?} by {:?}",
            album_name, artist_name
        )));
    }

    let mut codec_count: HashMap<String, i32> = HashMap::new();
    let mut sample_rate_count: HashMap<i32, i32> = HashMap::new();
    let mut bit_depth_count: HashMap<i32, i32> = HashMap::new();
    let mut total_dr = 0.0;
    let mut dr_count = 0;
    let mut total_loudness = 0.0;
    let mut loudness_count = 0;
    let mut total_duration = 0.0;
    let mut total_size = 0i64;
    let mut suspect_count = 0;
    let mut issue_count = 0;
    let mut year = 0;

    for track in tracks.iter_mut() {
        track.dr_score = dr_score(track.loudness_range, track.crest_factor);

        if track.loudness_range > 0.0 {
            total_dr += track.dr_score as f64;
            dr_count += 1;
        }
        if track.integrated_loudness != 0.0 {
            total_loudness += track.integrated_loudness;
            loudness_count += 1;
        }

        *codec_count.entry(track.codec.clone()).or_insert(0) += 1;
        *sample_rate_count.entry(track.sample_rate).or_insert(0) += 1;
        *bit_depth_count.entry(track.bit_depth).or_insert(0) += 1;

        total_duration += track.duration;
        total_size += track.file_size;

        if track.lossless_status == lossless::WARN || track.lossless_status == lossless::FAIL {
            track.is_suspect = true;
            suspect_count += 1;
        }
        if !track.integrity_ok || track.clipped_samples > 100 {
            issue_count += 1;
        }
    }

    // Album year: first non-zero year among the tracks
    let year_row: Option<i32> =
        sqlx::query_scalar("SELECT COALESCE(MAX(year), 0) FROM tracks WHERE album = ?")
            .bind(album_name)
            .fetch_optional(pool)
            .await?;
    if let Some(y) = year_row {
        year = y;
    }

    let dominant_codec = dominant_key(&codec_count).unwrap_or_default();
    let dominant_sample_rate = dominant_key(&sample_rate_count).unwrap_or(0);
    let dominant_bit_depth = dominant_key(&bit_depth_count).unwrap_or(0);

    let avg_dr = if dr_count > 0 {
        (total_dr / dr_count as f64) as i32
    } else {
        0
    };
    let avg_loudness = if loudness_count > 0 {
        total_loudness / loudness_count as f64
    } else {
        0.0
    };

    for track in tracks.iter_mut() {
        track.is_codec_outlier = track.codec != dominant_codec;
        track.is_sample_rate_outlier = track.sample_rate != dominant_sample_rate;
        track.is_bit_depth_outlier = track.bit_depth != dominant_bit_depth;
        if avg_dr > 0 {
            track.is_dr_outlier = (track.dr_score - avg_dr).abs() > 4;
        }
        if avg_loudness != 0.0 && track.integrated_loudness != 0.0 {
            track.is_loudness_outlier = (track.integrated_loudness - avg_loudness).abs() > 3.0;
        }
    }

    let consistency = AlbumConsistency {
        is_consistent: codec_count.len() == 1
            && sample_rate_count.len() == 1
            && bit_depth_count.len() == 1
            && suspect_count == 0,
        dominant_codec,
        dominant_sample_rate,
        dominant_bit_depth,
        avg_dr,
        avg_loudness,
        codec_variety: codec_count.len() as i32,
        sample_rate_variety: sample_rate_count.len() as i32,
        bit_depth_variety: bit_depth_count.len() as i32,
        suspect_count,
        issue_count,
    };

    Ok(AlbumDetail {
        name: album_name.to_string(),
        artist: artist_name.to_string(),
        year,
        track_count: tracks.len() as i32,
        total_duration,
        total_size,
        tracks,
        consistency,
    })
}

fn dominant_key<K: Clone>(counts: &HashMap<K, i32>) -> Option<K> {
    counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(key, _)| key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::analysis_results::create_analysis_result;
    use crate::db::connect_in_memory;
    use crate::db::libraries::{create_library, NewLibrary};
    use crate::db::media_files::create_media_file;
    use crate::db::tracks::create_track;
    use crate::models::{AnalysisResult, Track};

    #[test]
    fn dr_score_clamps() {
        assert_eq!(dr_score(8.0, 12.0), 14);
        assert_eq!(dr_score(0.0, 0.0), 1);
        assert_eq!(dr_score(30.0, 20.0), 20);
        // round() on the raw value before clamping
        assert_eq!(dr_score(5.4, 6.0), 8);
    }

    async fn insert_album_track(
        pool: &SqlitePool,
        library_id: &str,
        path: &str,
        codec: &str,
        sample_rate: i32,
        lra: f64,
        crest: f64,
        loudness: f64,
        verdict: &str,
    ) -> String {
        let file = create_media_file(pool, library_id, path, 1_000_000, Utc::now())
            .await
            .unwrap();
        let mut track = Track {
            media_file_id: file.id,
            duration: 200.0,
            codec: codec.to_string(),
            sample_rate,
            bit_depth: 16,
            channels: 2,
            album: Some("Album".to_string()),
            artist: Some("Artist".to_string()),
            album_artist: Some("Artist".to_string()),
            ..Default::default()
        };
        create_track(pool, &mut track).await.unwrap();

        let mut result = AnalysisResult {
            id: String::new(),
            track_id: track.id.clone(),
            version: 0,
            lossless_score: 100.0,
            lossless_status: verdict.to_string(),
            integrity_ok: true,
            decode_errors: 0,
            peak_level: -1.0,
            true_peak: -0.9,
            crest_factor: crest,
            clipped_samples: 0,
            dc_offset: 0.0,
            integrated_loudness: loudness,
            loudness_range: lra,
            high_freq_cutoff: 0.0,
            spectral_rolloff: 0.0,
            phase_correlation: 0.9,
            issues_json: "[]".to_string(),
            stats_json: "{}".to_string(),
            created_at: Utc::now(),
        };
        create_analysis_result(pool, &mut result).await.unwrap();
        track.id
    }

    #[tokio::test]
    async fn consistent_album_has_no_outliers() {
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

        for i in 0..3 {
            insert_album_track(
                &pool,
                &library.id,
                &format!("/music/{:02}.flac", i),
                "flac",
                44100,
                8.0,
                12.0,
                -14.0,
                lossless::PASS,
            )
            .await;
        }

        let detail = album_detail(&pool, "Album", "Artist").await.unwrap();
        assert_eq!(detail.track_count, 3);
        assert!(detail.consistency.is_consistent);
        assert_eq!(detail.consistency.dominant_codec, "flac");
        assert!(detail.tracks.iter().all(|t| !t.is_codec_outlier));
        assert!(detail.tracks.iter().all(|t| !t.is_loudness_outlier));
    }

    #[tokio::test]
    async fn mixed_codec_and_suspect_flags() {
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

        insert_album_track(&pool, &library.id, "/music/01.flac", "flac", 44100, 8.0, 12.0, -14.0, lossless::PASS).await;
        insert_album_track(&pool, &library.id, "/music/02.flac", "flac", 44100, 8.0, 12.0, -14.0, lossless::PASS).await;
        insert_album_track(&pool, &library.id, "/music/03.mp3", "mp3", 44100, 8.0, 12.0, -19.0, lossless::WARN).await;

        let detail = album_detail(&pool, "Album", "Artist").await.unwrap();
        assert!(!detail.consistency.is_consistent);
        assert_eq!(detail.consistency.dominant_codec, "flac");
        assert_eq!(detail.consistency.codec_variety, 2);
        assert_eq!(detail.consistency.suspect_count, 1);

        let outlier = detail.tracks.iter().find(|t| t.codec == "mp3").unwrap();
        assert!(outlier.is_codec_outlier);
        assert!(outlier.is_suspect);
        assert!(outlier.is_loudness_outlier);
    }

    #[tokio::test]
    async fn unknown_album_is_not_found() {
        let pool = connect_in_memory().await.unwrap();
        let err = album_detail(&pool, "Nope", "Nobody").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
