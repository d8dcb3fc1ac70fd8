//! Deep audio analysis pipeline: the `audioscan` job executor
//!
//! Five modules run sequentially per track, each producing a compressed
//! raw series, summary scalars and render hints, registered in a
//! per-track manifest that is written last. A failed or skipped module
//! never aborts the pipeline.

pub mod clipping;
pub mod decimate;
pub mod decode;
pub mod dynamics;
pub mod loudness;
pub mod manifest;
pub mod phase;
pub mod rawdata;
pub mod spectrum;

use crate::db;
use crate::jobs::JobLogger;
use crate::models::Track;
use manifest::{AnalysisManifest, ModuleOutcome, ProbeCache};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tonelab_common::Result;

/// Default analysis window in seconds (0 = entire track).
pub const DEFAULT_MAX_DURATION_SEC: f64 = 60.0;

pub struct AudioScanner {
    db: SqlitePool,
    shim: decode::DecodeShim,
    artifacts_path: PathBuf,
    max_duration: f64,
}

impl AudioScanner {
    pub fn new(
        db: SqlitePool,
        shim: decode::DecodeShim,
        artifacts_path: PathBuf,
        max_duration: f64,
    ) -> Self {
        Self {
            db,
            shim,
            artifacts_path,
            max_duration: if max_duration < 0.0 {
                DEFAULT_MAX_DURATION_SEC
            } else {
                max_duration
            },
        }
    }

    pub fn artifacts_path(&self) -> &Path {
        &self.artifacts_path
    }

    /// Run the full five-module analysis for one track.
    pub async fn scan_track(
        &self,
        track_id: &str,
        log: &dyn JobLogger,
        cancel: &CancellationToken,
    ) -> Result<()> {
        log.info("", "Starting audio scan analysis");

        let track = db::tracks::get_track(&self.db, track_id).await?;
        let title = track.title.clone().unwrap_or_else(|| track.id.clone());
        log.info("", &format!("Track: {}", title));
        log.debug(
            "",
            "Track details",
            &format!(
                "Path: {}, Duration: {:.1}s, Sample Rate: {}Hz, Channels: {}, Codec: {}",
                track.path, track.duration, track.sample_rate, track.channels, track.codec
            ),
        );

        let artifact_dir = manifest::artifact_dir(&self.artifacts_path, track_id);
        std::fs::create_dir_all(&artifact_dir)?;
        log.debug("", "Artifact directory ready", &artifact_dir.to_string_lossy());

        let probe_cache = ProbeCache {
            source: "probe-cache".to_string(),
            sample_rate_hz: track.sample_rate,
            bit_depth: if track.bit_depth > 0 {
                Some(track.bit_depth)
            } else {
                None
            },
            channels: track.channels,
            codec: track.codec.clone(),
            container: container_from_path(&track.path),
            duration_sec: track.duration,
        };
        let mut manifest = AnalysisManifest::new(track_id, probe_cache);

        let duration = self.analysis_window(&track);
        if duration < track.duration {
            log.info(
                "",
                &format!(
                    "Analyzing first {:.0} seconds (of {:.0}s total)",
                    duration, track.duration
                ),
            );
        } else {
            log.info("", &format!("Analyzing full track ({:.1} seconds)", duration));
        }

        log.info("audioscan", "Running spectrum analysis module...");
        let outcome =
            spectrum::run(&self.shim, &track, duration, &artifact_dir, log, cancel).await;
        manifest.record("audioscan", outcome, log);

        log.info("loudness", "Running loudness analysis module...");
        let outcome =
            loudness::run(&self.shim, &track, duration, &artifact_dir, log, cancel).await;
        manifest.record("loudness", outcome, log);

        log.info("clipping", "Running clipping detection module...");
        let outcome =
            clipping::run(&self.shim, &track, duration, &artifact_dir, log, cancel).await;
        manifest.record("clipping", outcome, log);

        log.info("phase", "Running phase correlation module...");
        let outcome = phase::run(&self.shim, &track, duration, &artifact_dir, log, cancel).await;
        manifest.record("phase", outcome, log);

        log.info("dynamics", "Running dynamics analysis module...");
        let outcome =
            dynamics::run(&self.shim, &track, duration, &artifact_dir, log, cancel).await;
        manifest.record("dynamics", outcome, log);

        log.info("", "Saving analysis manifest...");
        manifest.save(&artifact_dir)?;

        // Best-effort: mirror module summaries into the latest analysis
        // result row. The manifest stays the source of truth.
        if let Err(e) = self.update_result_stats(track_id, &manifest).await {
            log.warn("", "Failed to update analysis results", &e.to_string());
        }

        log.info("", "Audio scan analysis complete");
        for (name, module) in &manifest.modules {
            match module.status.as_str() {
                "ok" => log.info(name, &format!("Module {}: OK", name)),
                "skipped" => log.info(name, &format!("Module {}: Skipped", name)),
                other => log.warn(name, &format!("Module {}: {}", name, other), ""),
            }
        }

        Ok(())
    }

    fn analysis_window(&self, track: &Track) -> f64 {
        if self.max_duration > 0.0 && track.duration > self.max_duration {
            self.max_duration
        } else {
            track.duration
        }
    }

    async fn update_result_stats(&self, track_id: &str, manifest: &AnalysisManifest) -> Result<()> {
        let mut stats = HashMap::new();
        for (name, module) in &manifest.modules {
            if module.status == "ok" {
                if let Some(summary) = &module.summary {
                    stats.insert(name.clone(), summary.clone());
                }
            }
        }
        db::analysis_results::merge_latest_stats(&self.db, track_id, &stats).await?;
        Ok(())
    }
}

/// Hash a freshly written series file into its manifest reference.
pub(crate) fn compute_sha256_ref(
    path: &Path,
    filename: &str,
) -> Result<manifest::ArtifactRef> {
    Ok(manifest::ArtifactRef {
        path: filename.to_string(),
        sha256: manifest::compute_sha256(path)?,
        content_type: manifest::SERIES_CONTENT_TYPE.to_string(),
    })
}

/// Container label derived from the file extension.
pub fn container_from_path(path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "m4a" | "mp4" | "aac" => "mp4".to_string(),
        "ogg" | "opus" => "ogg".to_string(),
        "wv" => "wavpack".to_string(),
        "aif" | "aiff" => "aiff".to_string(),
        other => other.to_string(),
    }
}

/// Human channel-count label used in spectrum summaries.
pub fn channels_label(channels: i32) -> String {
    match channels {
        1 => "Mono".to_string(),
        2 => "Stereo".to_string(),
        6 => "5.1 Surround".to_string(),
        8 => "7.1 Surround".to_string(),
        n => format!("{} channels", n),
    }
}

impl AnalysisManifest {
    /// Fold a module run into the manifest, containing failures as
    /// `status: error` entries.
    pub fn record(
        &mut self,
        name: &str,
        outcome: Result<ModuleOutcome>,
        log: &dyn JobLogger,
    ) {
        match outcome {
            Ok(outcome) => self.set_outcome(name, outcome),
            Err(e) => {
                log.warn(name, "Module failed", &e.to_string());
                self.set_error(name, &format!("{} analysis failed", name), &e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_mapping() {
        assert_eq!(container_from_path("/a/b.flac"), "flac");
        assert_eq!(container_from_path("/a/b.m4a"), "mp4");
        assert_eq!(container_from_path("/a/b.opus"), "ogg");
        assert_eq!(container_from_path("/a/b.wv"), "wavpack");
        assert_eq!(container_from_path("/a/b.aif"), "aiff");
        assert_eq!(container_from_path("/a/b.mp3"), "mp3");
    }

    #[test]
    fn channel_labels() {
        assert_eq!(channels_label(1), "Mono");
        assert_eq!(channels_label(2), "Stereo");
        assert_eq!(channels_label(6), "5.1 Surround");
        assert_eq!(channels_label(3), "3 channels");
    }
}
