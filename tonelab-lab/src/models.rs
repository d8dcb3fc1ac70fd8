//! Entity types shared by the store and the pipeline components
//!
//! Identifiers are UUID v4 strings bound as TEXT. Timestamps are UTC and
//! stored as RFC 3339 TEXT. Nullable fields are `Option<T>`; the one
//! historical exception is `Track::bit_depth` where 0 means unknown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle and job status values, stored as TEXT.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const DELETED: &str = "deleted";
    pub const RETRY: &str = "retry";
}

/// Lossless verdict values for analysis results.
pub mod lossless {
    pub const PASS: &str = "pass";
    pub const WARN: &str = "warn";
    pub const FAIL: &str = "fail";
}

/// Issue severities.
pub mod severity {
    pub const INFO: &str = "info";
    pub const WARNING: &str = "warning";
    pub const ERROR: &str = "error";
}

/// Job types handled by the worker pool (`convert` is enqueued only; its
/// executor lives outside this service).
pub mod job_type {
    pub const ANALYZE: &str = "analyze";
    pub const AUDIOSCAN: &str = "audioscan";
    pub const CONVERT: &str = "convert";
}

/// A music library root folder watched by the scanner
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    pub id: String,
    pub name: String,
    pub root_path: String,
    /// Human duration string, e.g. "15m"
    pub scan_interval: String,
    pub read_only: bool,
    pub output_path: Option<String>,
    pub allowed_formats: Option<String>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Aggregates populated by list queries
    #[sqlx(default)]
    pub track_count: i64,
    #[sqlx(default)]
    pub total_size: i64,
}

/// A file observed on disk. Rows are never removed when the source file
/// disappears; the status flips to `deleted` to preserve history.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub id: String,
    pub library_id: String,
    pub path: String,
    pub filename: String,
    pub extension: String,
    pub size: i64,
    pub mtime: DateTime<Utc>,
    pub quick_hash: Option<String>,
    pub full_hash: Option<String>,
    pub status: String,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audio track metadata, one-to-one with a media file.
///
/// `path` and `library_id` are joined in from `media_files` by every track
/// query; they are not columns of the `tracks` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub media_file_id: String,
    /// Seconds
    pub duration: f64,
    pub codec: String,
    pub sample_rate: i32,
    /// 0 = unknown (lossy codecs)
    pub bit_depth: i32,
    pub channels: i32,
    pub bitrate: i32,

    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: Option<i32>,
    pub disc_number: Option<i32>,
    pub year: Option<i32>,
    pub genre: Option<String>,

    pub has_artwork: bool,
    pub artwork_width: Option<i32>,
    pub artwork_height: Option<i32>,

    #[sqlx(default)]
    pub path: String,
    #[sqlx(default)]
    pub library_id: String,
}

/// One scanner pass over a library. Immutable once finished.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScanRun {
    pub id: String,
    pub library_id: String,
    pub status: String,
    pub files_found: i32,
    pub files_new: i32,
    pub files_changed: i32,
    pub files_deleted: i32,
    pub files_failed: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
}

/// Summary scalars for one analysis run of a track. The manifest plus raw
/// artifacts remain the source of truth; this row is the denormalized
/// convenience the UI lists from.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    pub track_id: String,
    pub version: i32,

    pub lossless_score: f64,
    /// pass | warn | fail
    pub lossless_status: String,

    pub integrity_ok: bool,
    pub decode_errors: i32,

    pub peak_level: f64,
    pub true_peak: f64,
    pub crest_factor: f64,
    pub clipped_samples: i32,
    pub dc_offset: f64,

    pub integrated_loudness: f64,
    pub loudness_range: f64,

    pub high_freq_cutoff: f64,
    pub spectral_rolloff: f64,

    pub phase_correlation: f64,

    #[serde(skip)]
    pub issues_json: String,
    #[serde(skip)]
    pub stats_json: String,

    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn issues(&self) -> Vec<Issue> {
        if self.issues_json.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.issues_json).unwrap_or_default()
    }

    pub fn stats(&self) -> HashMap<String, serde_json::Value> {
        if self.stats_json.is_empty() {
            return HashMap::new();
        }
        serde_json::from_str(&self.stats_json).unwrap_or_default()
    }
}

/// A detected problem attached to an analysis result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: String,
    /// info | warning | error
    pub severity: String,
    pub message: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
}

/// A durable on-disk side product of analysis (image or compressed series)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub track_id: String,
    /// artwork | waveform | spectrogram | audioscan_curve | *_series
    pub kind: String,
    pub path: String,
    pub mime_type: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// A queued unit of background work
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub target_type: String,
    pub target_id: String,
    pub status: String,
    /// Higher first
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub payload_json: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn payload(&self) -> Option<serde_json::Value> {
        self.payload_json
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
    }
}

/// Immutable audit record of an operator or system action
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ActionLog {
    pub id: String,
    /// tag_edit | convert | artwork_apply | ...
    pub action_type: String,
    pub target_type: String,
    pub target_id: String,
    pub actor: String,
    pub before_json: String,
    pub after_json: String,
    pub created_at: DateTime<Utc>,
}

/// Key/value application setting with a type discriminator
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub key: String,
    pub value: String,
    /// string | int | bool | json
    pub value_type: String,
    pub category: String,
    pub updated_at: DateTime<Utc>,
}

/// A conversion preset referenced by `convert` job payloads
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConversionProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub codec: String,
    pub sample_rate: i32,
    pub bit_depth: i32,
    pub bitrate: i32,
    pub is_builtin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_result_parses_issue_json() {
        let result = AnalysisResult {
            id: "r1".to_string(),
            track_id: "t1".to_string(),
            version: 1,
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
            issues_json: r#"[{"type":"clipping","severity":"warning","message":"m","confidence":0.9}]"#
                .to_string(),
            stats_json: String::new(),
            created_at: Utc::now(),
        };

        let issues = result.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, "clipping");
        assert!(result.stats().is_empty());
    }

    #[test]
    fn job_payload_is_optional_and_lenient() {
        let mut job = Job {
            id: "j1".to_string(),
            job_type: job_type::CONVERT.to_string(),
            target_type: "track".to_string(),
            target_id: "t1".to_string(),
            status: status::QUEUED.to_string(),
            priority: 0,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            payload_json: Some(r#"{"profile":"redbook"}"#.to_string()),
            scheduled_at: Utc::now(),
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        };

        assert_eq!(job.payload().unwrap()["profile"], "redbook");

        job.payload_json = Some("not json".to_string());
        assert!(job.payload().is_none());

        job.payload_json = None;
        assert!(job.payload().is_none());
    }
}
