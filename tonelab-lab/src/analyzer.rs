//! First-pass analyzer: the `analyze` job executor
//!
//! Probes a media file, creates or refreshes its track row, runs the
//! quick summary analyses (volume + BS.1770 loudness), renders waveform
//! and spectrogram evidence, extracts embedded artwork and finally
//! enqueues the deep `audioscan` job. Probe failure marks the media file
//! `failed` and aborts; the supplemental steps degrade gracefully.

use crate::db;
use crate::db::jobs::NewJob;
use crate::models::{
    job_type, lossless, severity, status, AnalysisResult, Artifact, Issue, MediaFile, Track,
};
use crate::probe::{apply_probe_to_track, stderr_tail, Prober};
use crate::tools::CommandRunner;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::{Error, Result};

const ANALYZE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Analyzer {
    db: SqlitePool,
    prober: Prober,
    runner: Arc<dyn CommandRunner>,
    ffmpeg_path: String,
    artifacts_path: PathBuf,
}

impl Analyzer {
    pub fn new(
        db: SqlitePool,
        runner: Arc<dyn CommandRunner>,
        ffprobe_path: String,
        ffmpeg_path: String,
        artifacts_path: PathBuf,
    ) -> Self {
        Self {
            db,
            prober: Prober::new(Arc::clone(&runner), ffprobe_path),
            runner,
            ffmpeg_path,
            artifacts_path,
        }
    }

    /// Process one media file end to end.
    pub async fn analyze_file(&self, media_file_id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut file = db::media_files::get_media_file(&self.db, media_file_id).await?;

        tracing::info!(file_id = %file.id, path = %file.path, "Analyzing file");

        let probe = match self.prober.probe(&file.path, cancel).await {
            Ok(probe) => probe,
            Err(e) => {
                let message = e.to_string();
                file.status = status::FAILED.to_string();
                file.error_msg = Some(message.clone());
                db::media_files::update_media_file(&self.db, &file).await?;
                return Err(e);
            }
        };

        let track = self.upsert_track(&file, &probe).await?;

        let mut result = self.quick_analysis(&track, cancel).await;
        result.track_id = track.id.clone();
        if let Err(e) = db::analysis_results::create_analysis_result(&self.db, &mut result).await {
            return Err(e);
        }

        // Evidence artifacts are best-effort; a missing waveform never
        // fails the job.
        if track.has_artwork {
            if let Err(e) = self.extract_artwork(&track, cancel).await {
                tracing::warn!(track_id = %track.id, error = %e, "Artwork extraction failed");
                // The flag tracks artifact existence, not probe claims
                if !db::artifacts::has_artifact(&self.db, &track.id, "artwork").await? {
                    db::tracks::update_track_artwork_status(&self.db, &track.id, false, None, None)
                        .await?;
                }
            }
        }
        if let Err(e) = self.render_waveform(&track, cancel).await {
            tracing::warn!(track_id = %track.id, error = %e, "Waveform generation failed");
        }
        if let Err(e) = self.render_spectrogram(&track, cancel).await {
            tracing::warn!(track_id = %track.id, error = %e, "Spectrogram generation failed");
        }

        file.status = status::SUCCESS.to_string();
        file.error_msg = None;
        db::media_files::update_media_file(&self.db, &file).await?;

        // Queue the deep five-module pass unless one is already pending.
        if !db::jobs::has_pending_job(&self.db, job_type::AUDIOSCAN, &track.id).await? {
            db::jobs::create_job(&self.db, NewJob::audioscan(&track.id)).await?;
        }

        Ok(())
    }

    async fn upsert_track(&self, file: &MediaFile, probe: &crate::probe::ProbeResult) -> Result<Track> {
        match db::tracks::get_track_by_media_file(&self.db, &file.id).await? {
            Some(mut track) => {
                apply_probe_to_track(&mut track, probe);
                db::tracks::update_track(&self.db, &track).await?;
                Ok(track)
            }
            None => {
                let mut track = Track {
                    media_file_id: file.id.clone(),
                    ..Default::default()
                };
                apply_probe_to_track(&mut track, probe);
                db::tracks::create_track(&self.db, &mut track).await?;
                track.path = file.path.clone();
                track.library_id = file.library_id.clone();
                Ok(track)
            }
        }
    }

    /// Quick summary scalars from volumedetect + ebur128, with the issue
    /// list and lossless verdict derived from them.
    async fn quick_analysis(&self, track: &Track, cancel: &CancellationToken) -> AnalysisResult {
        let mut result = AnalysisResult {
            id: String::new(),
            track_id: track.id.clone(),
            version: 0,
            lossless_score: 100.0,
            lossless_status: lossless::PASS.to_string(),
            integrity_ok: true,
            decode_errors: 0,
            peak_level: 0.0,
            true_peak: 0.0,
            crest_factor: 0.0,
            clipped_samples: 0,
            dc_offset: 0.0,
            integrated_loudness: 0.0,
            loudness_range: 0.0,
            high_freq_cutoff: 0.0,
            spectral_rolloff: 0.0,
            phase_correlation: 0.0,
            issues_json: "[]".to_string(),
            stats_json: "{}".to_string(),
            created_at: chrono::Utc::now(),
        };

        if let Err(e) = self.run_volume_detect(track, &mut result, cancel).await {
            tracing::warn!(track_id = %track.id, error = %e, "Volume detection failed");
        }
        if let Err(e) = self.run_loudness_summary(track, &mut result, cancel).await {
            tracing::warn!(track_id = %track.id, error = %e, "Loudness summary failed");
        }

        let mut issues = Vec::new();
        if result.clipped_samples > 0 {
            issues.push(Issue {
                issue_type: "clipping".to_string(),
                severity: severity::WARNING.to_string(),
                message: format!("Detected {} clipped samples", result.clipped_samples),
                confidence: 0.95,
                artifact_id: None,
            });
        }
        if result.peak_level > 0.0 {
            issues.push(Issue {
                issue_type: "peak_level".to_string(),
                severity: severity::WARNING.to_string(),
                message: format!("Peak level exceeds 0dB ({:.2} dB)", result.peak_level),
                confidence: 1.0,
                artifact_id: None,
            });
        }
        if result.dc_offset.abs() > 0.01 {
            issues.push(Issue {
                issue_type: "dc_offset".to_string(),
                severity: severity::INFO.to_string(),
                message: format!("DC offset detected: {:.4}", result.dc_offset),
                confidence: 0.9,
                artifact_id: None,
            });
        }

        if matches!(track.codec.as_str(), "flac" | "alac" | "wav" | "aiff") {
            let suspicion = lossy_ancestry_suspicion(track, &result);
            if suspicion > 0.5 {
                result.lossless_status = lossless::WARN.to_string();
                result.lossless_score = (1.0 - suspicion) * 100.0;
                issues.push(Issue {
                    issue_type: "lossy_ancestry".to_string(),
                    severity: severity::WARNING.to_string(),
                    message: "This file may have been transcoded from a lossy source".to_string(),
                    confidence: suspicion,
                    artifact_id: None,
                });
            }
            if suspicion > 0.8 {
                result.lossless_status = lossless::FAIL.to_string();
            }
        }

        result.issues_json = db::analysis_results::issues_to_json(&issues);
        result
    }

    async fn run_volume_detect(
        &self,
        track: &Track,
        result: &mut AnalysisResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = vec![
            "-i".to_string(),
            track.path.clone(),
            "-af".to_string(),
            "volumedetect".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self
            .runner
            .run(&self.ffmpeg_path, &args, ANALYZE_TIMEOUT, cancel)
            .await?;

        let mut mean_volume = None;
        for line in output.stderr.lines() {
            if let Some(v) = parse_labeled_db(line, "max_volume:") {
                result.peak_level = v;
            }
            if let Some(v) = parse_labeled_db(line, "mean_volume:") {
                mean_volume = Some(v);
            }
        }
        if let Some(mean) = mean_volume {
            if result.peak_level != 0.0 {
                result.crest_factor = result.peak_level - mean;
            }
        }
        Ok(())
    }

    async fn run_loudness_summary(
        &self,
        track: &Track,
        result: &mut AnalysisResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = vec![
            "-i".to_string(),
            track.path.clone(),
            "-af".to_string(),
            "ebur128=peak=true".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = self
            .runner
            .run(&self.ffmpeg_path, &args, ANALYZE_TIMEOUT, cancel)
            .await?;

        parse_ebur128_summary(&output.stderr, result);
        Ok(())
    }

    /// Extract embedded artwork into the artifact directory and register
    /// it; keeps the track's artwork flag in sync.
    async fn extract_artwork(&self, track: &Track, cancel: &CancellationToken) -> Result<()> {
        let dir = self.ensure_artifact_dir(&track.id)?;
        let output_path = dir.join("artwork.jpg");

        let args = vec![
            "-i".to_string(),
            track.path.clone(),
            "-an".to_string(),
            "-vcodec".to_string(),
            "copy".to_string(),
            "-y".to_string(),
            output_path.to_string_lossy().into_owned(),
        ];
        let output = self
            .runner
            .run(&self.ffmpeg_path, &args, ANALYZE_TIMEOUT, cancel)
            .await?;
        if !output.success() {
            return Err(Error::Tool(format!(
                "artwork extraction exited with {}: {}",
                output.exit_code,
                stderr_tail(&output.stderr)
            )));
        }

        let size = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            let _ = std::fs::remove_file(&output_path);
            return Err(Error::Tool("no artwork extracted".to_string()));
        }

        let mut artifact = Artifact {
            id: String::new(),
            track_id: track.id.clone(),
            kind: "artwork".to_string(),
            path: relative_artifact_path(&track.id, "artwork.jpg"),
            mime_type: "image/jpeg".to_string(),
            width: None,
            height: None,
            created_at: chrono::Utc::now(),
        };
        db::artifacts::create_artifact(&self.db, &mut artifact).await?;
        db::tracks::update_track_artwork_status(&self.db, &track.id, true, None, None).await?;
        Ok(())
    }

    async fn render_waveform(&self, track: &Track, cancel: &CancellationToken) -> Result<()> {
        let dir = self.ensure_artifact_dir(&track.id)?;
        let output_path = dir.join("waveform.png");

        let args = vec![
            "-i".to_string(),
            track.path.clone(),
            "-filter_complex".to_string(),
            "showwavespic=s=1920x240".to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-y".to_string(),
            output_path.to_string_lossy().into_owned(),
        ];
        let output = self
            .runner
            .run(&self.ffmpeg_path, &args, ANALYZE_TIMEOUT, cancel)
            .await?;
        if !output.success() {
            return Err(Error::Tool(format!(
                "waveform generation exited with {}",
                output.exit_code
            )));
        }

        let mut artifact = Artifact {
            id: String::new(),
            track_id: track.id.clone(),
            kind: "waveform".to_string(),
            path: relative_artifact_path(&track.id, "waveform.png"),
            mime_type: "image/png".to_string(),
            width: Some(1920),
            height: Some(240),
            created_at: chrono::Utc::now(),
        };
        db::artifacts::create_artifact(&self.db, &mut artifact).await
    }

    async fn render_spectrogram(&self, track: &Track, cancel: &CancellationToken) -> Result<()> {
        let dir = self.ensure_artifact_dir(&track.id)?;
        let output_path = dir.join("spectrogram.png");

        let args = vec![
            "-i".to_string(),
            track.path.clone(),
            "-lavfi".to_string(),
            "showspectrumpic=s=1920x480:legend=0:color=intensity".to_string(),
            "-y".to_string(),
            output_path.to_string_lossy().into_owned(),
        ];
        let output = self
            .runner
            .run(&self.ffmpeg_path, &args, ANALYZE_TIMEOUT, cancel)
            .await?;
        if !output.success() {
            return Err(Error::Tool(format!(
                "spectrogram generation exited with {}",
                output.exit_code
            )));
        }

        let mut artifact = Artifact {
            id: String::new(),
            track_id: track.id.clone(),
            kind: "spectrogram".to_string(),
            path: relative_artifact_path(&track.id, "spectrogram.png"),
            mime_type: "image/png".to_string(),
            width: Some(1920),
            height: Some(480),
            created_at: chrono::Utc::now(),
        };
        db::artifacts::create_artifact(&self.db, &mut artifact).await
    }

    fn ensure_artifact_dir(&self, track_id: &str) -> Result<PathBuf> {
        let dir = crate::audioscan::manifest::artifact_dir(&self.artifacts_path, track_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Relative artifact path under the artifacts root.
pub fn relative_artifact_path(track_id: &str, filename: &str) -> String {
    let prefix = &track_id[..track_id.len().min(2)];
    Path::new("tracks")
        .join(prefix)
        .join(track_id)
        .join(filename)
        .to_string_lossy()
        .into_owned()
}

/// Heuristic suspicion [0, 1] that a lossless container carries a lossy
/// master, from high-frequency cutoff and spectral rolloff.
pub fn lossy_ancestry_suspicion(track: &Track, result: &AnalysisResult) -> f64 {
    let mut suspicion: f64 = 0.0;

    if track.sample_rate == 44100 && track.bit_depth == 16 {
        if result.high_freq_cutoff > 0.0 && result.high_freq_cutoff < 16000.0 {
            suspicion += 0.4;
        } else if result.high_freq_cutoff > 0.0 && result.high_freq_cutoff < 18000.0 {
            suspicion += 0.2;
        }
    }
    if result.spectral_rolloff > 0.0 && result.spectral_rolloff < 15000.0 {
        suspicion += 0.3;
    }

    suspicion.min(1.0)
}

/// "max_volume: -6.0 dB" → -6.0
fn parse_labeled_db(line: &str, label: &str) -> Option<f64> {
    let idx = line.find(label)?;
    let rest = line[idx + label.len()..].trim();
    rest.split_whitespace().next()?.parse().ok()
}

/// Pull I / LRA / Peak from the ebur128 summary block.
fn parse_ebur128_summary(stderr: &str, result: &mut AnalysisResult) {
    for line in stderr.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        for (i, field) in fields.iter().enumerate() {
            match *field {
                "I:" if line.contains("LUFS") && !line.contains("t:") => {
                    if let Some(v) = fields.get(i + 1).and_then(|v| v.parse().ok()) {
                        result.integrated_loudness = v;
                    }
                }
                "LRA:" if line.contains("LU") && !line.contains("t:") => {
                    if let Some(v) = fields.get(i + 1).and_then(|v| v.parse().ok()) {
                        result.loudness_range = v;
                    }
                }
                "Peak:" => {
                    if let Some(v) = fields.get(i + 1).and_then(|v| v.parse().ok()) {
                        result.true_peak = v;
                    }
                }
                _ => {}
            }
        }
    }
}
