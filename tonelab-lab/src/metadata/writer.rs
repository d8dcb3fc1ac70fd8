//! Atomic metadata writer
//!
//! Tag writes go through the external muxer with stream copy (never
//! re-encoding audio), land in a hidden temp file in the source
//! directory, and swap in via backup-and-rename. A failure at any rung
//! restores the original; the source file is never left in an
//! intermediate state.

use crate::db;
use crate::db::jobs::NewJob;
use crate::models::{job_type, Track};
use crate::probe::stderr_tail;
use crate::tools::CommandRunner;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::{Error, Result};

const MUX_TIMEOUT: Duration = Duration::from_secs(300);
const BACKUP_SUFFIX: &str = ".tonelab_backup";
const TEMP_PREFIX: &str = ".tonelab_tmp_";

/// Requested tag changes. Omitted fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disc_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
}

impl TagChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.album_artist.is_none()
            && self.track_number.is_none()
            && self.disc_number.is_none()
            && self.year.is_none()
            && self.genre.is_none()
    }
}

/// Before/after for a single field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagDiff {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritePreview {
    pub track_id: String,
    pub path: String,
    pub diffs: Vec<TagDiff>,
    pub can_write: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub track_id: String,
    pub path: String,
    pub success: bool,
    pub diffs: Vec<TagDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_log_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a bulk operation: one result per affected track
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub results: Vec<WriteResult>,
    pub applied: usize,
    pub failed: usize,
}

impl BulkResult {
    fn from_results(results: Vec<WriteResult>) -> Self {
        let applied = results.iter().filter(|r| r.success).count();
        let failed = results.len() - applied;
        Self {
            results,
            applied,
            failed,
        }
    }
}

pub struct MetadataWriter {
    db: SqlitePool,
    runner: Arc<dyn CommandRunner>,
    ffmpeg_path: String,
}

impl MetadataWriter {
    pub fn new(db: SqlitePool, runner: Arc<dyn CommandRunner>, ffmpeg_path: String) -> Self {
        Self {
            db,
            runner,
            ffmpeg_path,
        }
    }

    /// Dry run: compute diffs and writability without touching anything.
    pub async fn preview(&self, track_id: &str, changes: &TagChanges) -> Result<WritePreview> {
        let track = db::tracks::get_track(&self.db, track_id).await?;

        let mut preview = WritePreview {
            track_id: track_id.to_string(),
            path: track.path.clone(),
            diffs: Vec::new(),
            can_write: true,
            error: None,
        };

        if !Path::new(&track.path).exists() {
            preview.can_write = false;
            preview.error = Some("File does not exist".to_string());
            return Ok(preview);
        }
        if let Err(e) = std::fs::OpenOptions::new().write(true).open(&track.path) {
            preview.can_write = false;
            preview.error = Some(format!("File is not writable: {}", e));
            return Ok(preview);
        }

        preview.diffs = compute_diffs(&track, changes);
        Ok(preview)
    }

    /// Apply changes atomically, update the track row and write the
    /// action log entry. An empty diff succeeds as a no-op.
    pub async fn apply(
        &self,
        track_id: &str,
        changes: &TagChanges,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<WriteResult> {
        let preview = self.preview(track_id, changes).await?;

        if !preview.can_write {
            return Ok(WriteResult {
                track_id: track_id.to_string(),
                path: preview.path,
                success: false,
                diffs: preview.diffs,
                action_log_id: None,
                error: preview.error,
            });
        }
        if preview.diffs.is_empty() {
            return Ok(WriteResult {
                track_id: track_id.to_string(),
                path: preview.path,
                success: true,
                diffs: Vec::new(),
                action_log_id: None,
                error: None,
            });
        }

        let mut track = db::tracks::get_track(&self.db, track_id).await?;
        let before_state = track_tag_map(&track);

        if let Err(e) = self.atomic_write(&track.path, changes, cancel).await {
            return Ok(WriteResult {
                track_id: track_id.to_string(),
                path: track.path.clone(),
                success: false,
                diffs: preview.diffs,
                action_log_id: None,
                error: Some(format!("Write failed: {}", e)),
            });
        }

        apply_changes_to_track(&mut track, changes);
        if let Err(e) = db::tracks::update_track(&self.db, &track).await {
            // The file already carries the new tags; surfacing this as a
            // write failure would mislead the operator.
            tracing::error!(
                track_id = %track_id,
                error = %e,
                "Track row update failed after successful file write"
            );
        }

        let after_state = track_tag_map(&track);
        let action_log_id = match db::action_logs::create_action_log(
            &self.db,
            "tag_edit",
            "track",
            track_id,
            actor,
            &before_state.to_string(),
            &after_state.to_string(),
        )
        .await
        {
            Ok(log) => Some(log.id),
            Err(e) => {
                tracing::error!(track_id = %track_id, error = %e, "Failed to create action log");
                None
            }
        };

        Ok(WriteResult {
            track_id: track_id.to_string(),
            path: track.path.clone(),
            success: true,
            diffs: preview.diffs,
            action_log_id,
            error: None,
        })
    }

    /// The backup-and-rename sequence. The original is untouched unless
    /// the muxer succeeded and the temp file is present.
    async fn atomic_write(
        &self,
        file_path: &str,
        changes: &TagChanges,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = Path::new(file_path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let temp_path = dir.join(format!("{}{}{}", TEMP_PREFIX, nanos, ext));

        let mut args = vec![
            "-i".to_string(),
            file_path.to_string(),
            "-c".to_string(),
            "copy".to_string(),
        ];
        for (key, value) in metadata_pairs(changes) {
            args.push("-metadata".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-y".to_string());
        args.push(temp_path.to_string_lossy().into_owned());

        tracing::debug!(path = %file_path, "Running muxer for metadata write");
        let output = self
            .runner
            .run(&self.ffmpeg_path, &args, MUX_TIMEOUT, cancel)
            .await;

        let failed = match &output {
            Ok(out) => !out.success(),
            Err(_) => true,
        };
        if failed || !temp_path.exists() {
            let _ = std::fs::remove_file(&temp_path);
            return match output {
                Ok(out) if !out.success() => Err(Error::Tool(format!(
                    "muxer exited with {}: {}",
                    out.exit_code,
                    stderr_tail(&out.stderr)
                ))),
                Ok(_) => Err(Error::Tool("temp file was not created".to_string())),
                Err(e) => Err(e),
            };
        }

        let backup_path = format!("{}{}", file_path, BACKUP_SUFFIX);
        if let Err(e) = std::fs::rename(file_path, &backup_path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(Error::Io(e));
        }

        if let Err(e) = std::fs::rename(&temp_path, file_path) {
            // Restore the original before reporting
            let _ = std::fs::rename(&backup_path, file_path);
            let _ = std::fs::remove_file(&temp_path);
            return Err(Error::Io(e));
        }

        let _ = std::fs::remove_file(&backup_path);
        tracing::info!(path = %file_path, "Metadata written");
        Ok(())
    }

    /// Set `album_artist` on every track of the album, optionally
    /// filtered by artist. One result and one action log per track.
    pub async fn normalize_album_artist(
        &self,
        album: &str,
        artist: Option<&str>,
        album_artist: &str,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<BulkResult> {
        if album.trim().is_empty() {
            return Err(Error::InvalidInput("album name must not be empty".to_string()));
        }

        let tracks = db::tracks::list_tracks_by_album(&self.db, album, artist).await?;
        let changes = TagChanges {
            album_artist: Some(album_artist.to_string()),
            ..Default::default()
        };

        let mut results = Vec::with_capacity(tracks.len());
        for track in &tracks {
            match self.apply(&track.id, &changes, actor, cancel).await {
                Ok(result) => results.push(result),
                Err(e) => results.push(failed_result(track, e)),
            }
        }
        Ok(BulkResult::from_results(results))
    }

    /// Renumber an album's tracks sequentially in their existing
    /// (disc, track, title) order.
    pub async fn fix_track_numbering(
        &self,
        album: &str,
        artist: Option<&str>,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<BulkResult> {
        if album.trim().is_empty() {
            return Err(Error::InvalidInput("album name must not be empty".to_string()));
        }

        let tracks = db::tracks::list_tracks_by_album(&self.db, album, artist).await?;
        let mut results = Vec::with_capacity(tracks.len());
        for (i, track) in tracks.iter().enumerate() {
            let changes = TagChanges {
                track_number: Some(i as i32 + 1),
                ..Default::default()
            };
            match self.apply(&track.id, &changes, actor, cancel).await {
                Ok(result) => results.push(result),
                Err(e) => results.push(failed_result(track, e)),
            }
        }
        Ok(BulkResult::from_results(results))
    }

    /// Assign one field across a selection of tracks. Unknown fields are
    /// rejected as invalid input, never silently ignored.
    pub async fn set_field(
        &self,
        track_ids: &[String],
        field: &str,
        value: &Value,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<BulkResult> {
        if track_ids.is_empty() {
            return Err(Error::InvalidInput("no track ids provided".to_string()));
        }
        let changes = changes_for_field(field, value)?;

        let mut results = Vec::with_capacity(track_ids.len());
        for track_id in track_ids {
            match self.apply(track_id, &changes, actor, cancel).await {
                Ok(result) => results.push(result),
                Err(e) => results.push(WriteResult {
                    track_id: track_id.clone(),
                    path: String::new(),
                    success: false,
                    diffs: Vec::new(),
                    action_log_id: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        Ok(BulkResult::from_results(results))
    }

    /// Queue format conversions for a selection of tracks. The executor
    /// is an external collaborator; here we validate the profile, create
    /// the jobs and record the actions.
    pub async fn enqueue_conversion(
        &self,
        track_ids: &[String],
        profile_id: &str,
        output_path: Option<&str>,
        actor: &str,
    ) -> Result<Vec<String>> {
        if track_ids.is_empty() {
            return Err(Error::InvalidInput("no track ids provided".to_string()));
        }
        let profile = db::profiles::get_conversion_profile(&self.db, profile_id).await?;

        let mut job_ids = Vec::with_capacity(track_ids.len());
        for track_id in track_ids {
            let track = db::tracks::get_track(&self.db, track_id).await?;
            let payload = json!({
                "profile": profile.id,
                "codec": profile.codec,
                "sampleRate": profile.sample_rate,
                "bitDepth": profile.bit_depth,
                "bitrate": profile.bitrate,
                "outputPath": output_path,
            });

            let job = db::jobs::create_job(
                &self.db,
                NewJob {
                    job_type: job_type::CONVERT.to_string(),
                    target_type: "track".to_string(),
                    target_id: track_id.clone(),
                    priority: 0,
                    max_attempts: 3,
                    payload_json: Some(payload.to_string()),
                    scheduled_at: chrono::Utc::now(),
                },
            )
            .await?;

            db::action_logs::create_action_log(
                &self.db,
                "convert",
                "track",
                track_id,
                actor,
                &json!({ "path": track.path }).to_string(),
                &payload.to_string(),
            )
            .await?;

            job_ids.push(job.id);
        }
        Ok(job_ids)
    }
}

fn failed_result(track: &Track, error: Error) -> WriteResult {
    WriteResult {
        track_id: track.id.clone(),
        path: track.path.clone(),
        success: false,
        diffs: Vec::new(),
        action_log_id: None,
        error: Some(error.to_string()),
    }
}

/// Map a bulk `set_field` name onto typed changes.
fn changes_for_field(field: &str, value: &Value) -> Result<TagChanges> {
    let as_string = || -> Result<String> {
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::InvalidInput(format!("field {:?} expects a string", field)))
    };
    let as_int = || -> Result<i32> {
        value
            .as_i64()
            .map(|n| n as i32)
            .ok_or_else(|| Error::InvalidInput(format!("field {:?} expects an integer", field)))
    };

    let mut changes = TagChanges::default();
    match field {
        "title" => changes.title = Some(as_string()?),
        "artist" => changes.artist = Some(as_string()?),
        "album" => changes.album = Some(as_string()?),
        "albumArtist" => changes.album_artist = Some(as_string()?),
        "trackNumber" => changes.track_number = Some(as_int()?),
        "discNumber" => changes.disc_number = Some(as_int()?),
        "year" => changes.year = Some(as_int()?),
        "genre" => changes.genre = Some(as_string()?),
        other => {
            return Err(Error::InvalidInput(format!("unknown field {:?}", other)));
        }
    }
    Ok(changes)
}

/// Per-field diff, recorded only when the post-change value differs from
/// the current one. A null DB field compares as the empty string / zero.
pub fn compute_diffs(track: &Track, changes: &TagChanges) -> Vec<TagDiff> {
    let mut diffs = Vec::new();

    let mut string_field = |field: &str, current: &Option<String>, new: &Option<String>| {
        if let Some(new) = new {
            let current = current.clone().unwrap_or_default();
            if current != *new {
                diffs.push(TagDiff {
                    field: field.to_string(),
                    before: json!(current),
                    after: json!(new),
                });
            }
        }
    };
    string_field("title", &track.title, &changes.title);
    string_field("artist", &track.artist, &changes.artist);
    string_field("album", &track.album, &changes.album);
    string_field("albumArtist", &track.album_artist, &changes.album_artist);
    string_field("genre", &track.genre, &changes.genre);

    let mut int_field = |field: &str, current: &Option<i32>, new: &Option<i32>| {
        if let Some(new) = new {
            let current = current.unwrap_or(0);
            if current != *new {
                diffs.push(TagDiff {
                    field: field.to_string(),
                    before: json!(current),
                    after: json!(new),
                });
            }
        }
    };
    int_field("trackNumber", &track.track_number, &changes.track_number);
    int_field("discNumber", &track.disc_number, &changes.disc_number);
    int_field("year", &track.year, &changes.year);

    diffs
}

fn apply_changes_to_track(track: &mut Track, changes: &TagChanges) {
    if let Some(v) = &changes.title {
        track.title = Some(v.clone());
    }
    if let Some(v) = &changes.artist {
        track.artist = Some(v.clone());
    }
    if let Some(v) = &changes.album {
        track.album = Some(v.clone());
    }
    if let Some(v) = &changes.album_artist {
        track.album_artist = Some(v.clone());
    }
    if let Some(v) = changes.track_number {
        track.track_number = Some(v);
    }
    if let Some(v) = changes.disc_number {
        track.disc_number = Some(v);
    }
    if let Some(v) = changes.year {
        track.year = Some(v);
    }
    if let Some(v) = &changes.genre {
        track.genre = Some(v.clone());
    }
}

/// Muxer tag key=value pairs for the requested changes.
fn metadata_pairs(changes: &TagChanges) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(v) = &changes.title {
        pairs.push(("title".to_string(), v.clone()));
    }
    if let Some(v) = &changes.artist {
        pairs.push(("artist".to_string(), v.clone()));
    }
    if let Some(v) = &changes.album {
        pairs.push(("album".to_string(), v.clone()));
    }
    if let Some(v) = &changes.album_artist {
        pairs.push(("album_artist".to_string(), v.clone()));
    }
    if let Some(v) = changes.track_number {
        pairs.push(("track".to_string(), v.to_string()));
    }
    if let Some(v) = changes.disc_number {
        pairs.push(("disc".to_string(), v.to_string()));
    }
    if let Some(v) = changes.year {
        pairs.push(("date".to_string(), v.to_string()));
    }
    if let Some(v) = &changes.genre {
        pairs.push(("genre".to_string(), v.clone()));
    }
    pairs
}

/// The tag fields present on a track, for action-log snapshots.
fn track_tag_map(track: &Track) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(v) = &track.title {
        map.insert("title".to_string(), json!(v));
    }
    if let Some(v) = &track.artist {
        map.insert("artist".to_string(), json!(v));
    }
    if let Some(v) = &track.album {
        map.insert("album".to_string(), json!(v));
    }
    if let Some(v) = &track.album_artist {
        map.insert("albumArtist".to_string(), json!(v));
    }
    if let Some(v) = track.track_number {
        map.insert("trackNumber".to_string(), json!(v));
    }
    if let Some(v) = track.disc_number {
        map.insert("discNumber".to_string(), json!(v));
    }
    if let Some(v) = track.year {
        map.insert("year".to_string(), json!(v));
    }
    if let Some(v) = &track.genre {
        map.insert("genre".to_string(), json!(v));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_track() -> Track {
        Track {
            id: "t1".to_string(),
            title: Some("Old".to_string()),
            artist: Some("Artist".to_string()),
            track_number: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn diff_only_for_changed_fields() {
        let track = sample_track();
        let changes = TagChanges {
            title: Some("New".to_string()),
            artist: Some("Artist".to_string()), // unchanged
            year: Some(1999),
            ..Default::default()
        };

        let diffs = compute_diffs(&track, &changes);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].field, "title");
        assert_eq!(diffs[0].before, json!("Old"));
        assert_eq!(diffs[0].after, json!("New"));
        assert_eq!(diffs[1].field, "year");
        assert_eq!(diffs[1].before, json!(0));
    }

    #[test]
    fn omitted_fields_produce_no_diffs() {
        let track = sample_track();
        let diffs = compute_diffs(&track, &TagChanges::default());
        assert!(diffs.is_empty());
    }

    #[test]
    fn null_db_field_compares_as_empty_string() {
        let track = sample_track(); // album is None
        let changes = TagChanges {
            album: Some(String::new()),
            ..Default::default()
        };
        assert!(compute_diffs(&track, &changes).is_empty());

        let changes = TagChanges {
            album: Some("Album".to_string()),
            ..Default::default()
        };
        assert_eq!(compute_diffs(&track, &changes).len(), 1);
    }

    #[test]
    fn unknown_set_field_is_invalid_input() {
        let err = changes_for_field("composer", &json!("Bach")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = changes_for_field("year", &json!("not a number")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn known_set_fields_map_to_changes() {
        let changes = changes_for_field("albumArtist", &json!("Various")).unwrap();
        assert_eq!(changes.album_artist.as_deref(), Some("Various"));

        let changes = changes_for_field("trackNumber", &json!(7)).unwrap();
        assert_eq!(changes.track_number, Some(7));
    }

    #[test]
    fn metadata_pairs_cover_requested_fields_only() {
        let changes = TagChanges {
            title: Some("New".to_string()),
            year: Some(2001),
            ..Default::default()
        };
        let pairs = metadata_pairs(&changes);
        assert_eq!(
            pairs,
            vec![
                ("title".to_string(), "New".to_string()),
                ("date".to_string(), "2001".to_string()),
            ]
        );
    }

    #[test]
    fn tag_map_skips_absent_fields() {
        let map = track_tag_map(&sample_track());
        assert_eq!(map["title"], "Old");
        assert_eq!(map["trackNumber"], 3);
        assert!(map.get("album").is_none());
    }

    #[test]
    fn apply_changes_overwrites_only_requested() {
        let mut track = sample_track();
        apply_changes_to_track(
            &mut track,
            &TagChanges {
                title: Some("New".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(track.title.as_deref(), Some("New"));
        assert_eq!(track.artist.as_deref(), Some("Artist"));
        assert_eq!(track.track_number, Some(3));
    }
}
