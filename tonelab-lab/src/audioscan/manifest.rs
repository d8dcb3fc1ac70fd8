//! Analysis manifest (v1)
//!
//! The per-track JSON document binding module summaries, raw artifact
//! references (path + SHA-256 + content type) and render hints for one
//! analysis run. Written atomically, and always last: a manifest on disk
//! implies every artifact it references is durable with a matching hash.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tonelab_common::{Error, Result};

pub const MANIFEST_VERSION: i32 = 1;
pub const MANIFEST_FILENAME: &str = "analysis_manifest_v1.json";
pub const SERIES_CONTENT_TYPE: &str = "application/x-msgpack+zstd";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisManifest {
    pub version: i32,
    #[serde(rename = "trackId")]
    pub track_id: String,
    /// RFC 3339 UTC
    #[serde(rename = "generatedAt")]
    pub generated_at: String,
    #[serde(rename = "probeCache")]
    pub probe_cache: ProbeCache,
    pub modules: BTreeMap<String, ModuleEntry>,
}

/// Cached structural metadata driving analysis parameters and hints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeCache {
    pub source: String,
    #[serde(rename = "sampleRateHz")]
    pub sample_rate_hz: i32,
    #[serde(rename = "bitDepth")]
    pub bit_depth: Option<i32>,
    pub channels: i32,
    pub codec: String,
    pub container: String,
    #[serde(rename = "durationSec")]
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    /// "ok" | "error" | "skipped"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<ArtifactRef>,
    #[serde(rename = "renderHints", skip_serializing_if = "Option::is_none")]
    pub render_hints: Option<RenderHints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ModuleError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Relative to the track's artifact directory
    pub path: String,
    pub sha256: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Axis and scale hints computed from the probe cache, never hard-coded
/// by clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderHints {
    #[serde(rename = "nyquistHz", skip_serializing_if = "Option::is_none")]
    pub nyquist_hz: Option<i32>,
    #[serde(rename = "guideLinesHz", skip_serializing_if = "Option::is_none")]
    pub guide_lines_hz: Option<Vec<i32>>,
    #[serde(rename = "freqScaleLog", skip_serializing_if = "Option::is_none")]
    pub freq_scale_log: Option<bool>,
    #[serde(rename = "minFreqHz", skip_serializing_if = "Option::is_none")]
    pub min_freq_hz: Option<i32>,
    #[serde(rename = "maxFreqHz", skip_serializing_if = "Option::is_none")]
    pub max_freq_hz: Option<i32>,

    #[serde(rename = "minDb", skip_serializing_if = "Option::is_none")]
    pub min_db: Option<f32>,
    #[serde(rename = "maxDb", skip_serializing_if = "Option::is_none")]
    pub max_db: Option<f32>,

    #[serde(rename = "durationSec", skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,

    #[serde(rename = "minLUFS", skip_serializing_if = "Option::is_none")]
    pub min_lufs: Option<f32>,
    #[serde(rename = "maxLUFS", skip_serializing_if = "Option::is_none")]
    pub max_lufs: Option<f32>,

    #[serde(rename = "minCorr", skip_serializing_if = "Option::is_none")]
    pub min_corr: Option<f32>,
    #[serde(rename = "maxCorr", skip_serializing_if = "Option::is_none")]
    pub max_corr: Option<f32>,

    #[serde(rename = "xUnit", skip_serializing_if = "Option::is_none")]
    pub x_unit: Option<String>,
    #[serde(rename = "yUnit", skip_serializing_if = "Option::is_none")]
    pub y_unit: Option<String>,
    #[serde(rename = "y2Unit", skip_serializing_if = "Option::is_none")]
    pub y2_unit: Option<String>,
}

/// The payload a successful module hands back to the orchestrator
#[derive(Debug)]
pub enum ModuleOutcome {
    Ok {
        summary: serde_json::Value,
        raw: ArtifactRef,
        render_hints: RenderHints,
    },
    Skipped {
        reason: String,
    },
}

impl AnalysisManifest {
    pub fn new(track_id: &str, probe_cache: ProbeCache) -> Self {
        Self {
            version: MANIFEST_VERSION,
            track_id: track_id.to_string(),
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            probe_cache,
            modules: BTreeMap::new(),
        }
    }

    pub fn set_outcome(&mut self, name: &str, outcome: ModuleOutcome) {
        let entry = match outcome {
            ModuleOutcome::Ok {
                summary,
                raw,
                render_hints,
            } => ModuleEntry {
                status: "ok".to_string(),
                summary: Some(summary),
                raw: Some(raw),
                render_hints: Some(render_hints),
                error: None,
            },
            ModuleOutcome::Skipped { reason } => ModuleEntry {
                status: "skipped".to_string(),
                summary: None,
                raw: None,
                render_hints: None,
                error: Some(ModuleError {
                    message: reason,
                    detail: None,
                }),
            },
        };
        self.modules.insert(name.to_string(), entry);
    }

    pub fn set_error(&mut self, name: &str, message: &str, detail: &str) {
        self.modules.insert(
            name.to_string(),
            ModuleEntry {
                status: "error".to_string(),
                summary: None,
                raw: None,
                render_hints: None,
                error: Some(ModuleError {
                    message: message.to_string(),
                    detail: if detail.is_empty() {
                        None
                    } else {
                        Some(detail.to_string())
                    },
                }),
            },
        );
    }

    /// Write atomically: serialize to a dot-temp sibling, fsync, rename
    /// over the final name.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Internal(format!("marshal manifest: {}", e)))?;

        let final_path = dir.join(MANIFEST_FILENAME);
        let temp_path = dir.join(format!(".{}.tmp", MANIFEST_FILENAME));

        {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("manifest at {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        serde_json::from_slice(&data).map_err(|e| Error::Parse(format!("manifest: {}", e)))
    }
}

/// `<base>/tracks/<first-two-hex-chars>/<track-id>/`
pub fn artifact_dir(base: &Path, track_id: &str) -> PathBuf {
    let prefix = &track_id[..track_id.len().min(2)];
    base.join("tracks").join(prefix).join(track_id)
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_probe_cache() -> ProbeCache {
        ProbeCache {
            source: "probe-cache".to_string(),
            sample_rate_hz: 44100,
            bit_depth: Some(16),
            channels: 2,
            codec: "flac".to_string(),
            container: "flac".to_string(),
            duration_sec: 183.4,
        }
    }

    #[test]
    fn save_load_roundtrip_with_all_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = AnalysisManifest::new("abcd1234", sample_probe_cache());

        manifest.set_outcome(
            "loudness",
            ModuleOutcome::Ok {
                summary: serde_json::json!({"integratedLUFS": -14.2}),
                raw: ArtifactRef {
                    path: "loudness_series_v1.msgpack.zst".to_string(),
                    sha256: "deadbeef".to_string(),
                    content_type: SERIES_CONTENT_TYPE.to_string(),
                },
                render_hints: RenderHints {
                    min_lufs: Some(-60.0),
                    max_lufs: Some(0.0),
                    x_unit: Some("sec".to_string()),
                    ..Default::default()
                },
            },
        );
        manifest.set_outcome(
            "phase",
            ModuleOutcome::Skipped {
                reason: "Mono track - phase analysis not applicable".to_string(),
            },
        );
        manifest.set_error("dynamics", "Dynamics analysis failed", "ffmpeg exited with 1");

        manifest.save(dir.path()).unwrap();
        // No temp file left behind
        assert!(!dir
            .path()
            .join(format!(".{}.tmp", MANIFEST_FILENAME))
            .exists());

        let loaded = AnalysisManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.track_id, "abcd1234");
        assert_eq!(loaded.modules["loudness"].status, "ok");
        assert_eq!(loaded.modules["phase"].status, "skipped");
        assert_eq!(
            loaded.modules["phase"].error.as_ref().unwrap().message,
            "Mono track - phase analysis not applicable"
        );
        assert_eq!(loaded.modules["dynamics"].status, "error");
    }

    #[test]
    fn manifest_json_uses_wire_field_names() {
        let manifest = AnalysisManifest::new("abcd1234", sample_probe_cache());
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"trackId\""));
        assert!(json.contains("\"generatedAt\""));
        assert!(json.contains("\"probeCache\""));
        assert!(json.contains("\"sampleRateHz\""));
        assert!(json.contains("\"durationSec\""));
    }

    #[test]
    fn artifact_dir_uses_two_char_prefix() {
        assert_eq!(
            artifact_dir(Path::new("/data"), "abcd1234"),
            PathBuf::from("/data/tracks/ab/abcd1234")
        );
    }

    #[test]
    fn sha256_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            compute_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = AnalysisManifest::load(dir.path()).unwrap_err();
        assert!(err.is_not_found());
    }
}
