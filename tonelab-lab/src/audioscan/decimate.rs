//! On-demand series decimation for clients
//!
//! Two downsamplers: LTTB for smooth lines where visual fidelity
//! matters, and a max-envelope for clipping/peak data where losing a
//! spike is unacceptable. Requests carry `max_points` (default 1500,
//! cap 5000) and an optional time window applied before downsampling.

use super::manifest::{AnalysisManifest, RenderHints};
use super::rawdata::{
    load_msgpack_zstd, AudioScanCurve, ClippingSeries, DynamicsSeries, LoudnessSeries,
    PhaseSeries,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tonelab_common::{Error, Result};

pub const DEFAULT_MAX_POINTS: usize = 1500;
pub const MAX_POINTS_CAP: usize = 5000;

/// Decimated series payload for one module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesResponse {
    pub version: i32,
    pub module: String,
    pub units: HashMap<String, String>,
    #[serde(rename = "renderHints")]
    pub render_hints: Option<RenderHints>,
    pub series: HashMap<String, Vec<f64>>,
}

/// Client-supplied windowing and density
#[derive(Debug, Clone, Copy)]
pub struct SeriesQuery {
    pub max_points: usize,
    pub start_sec: f64,
    /// Negative means unbounded
    pub end_sec: f64,
}

impl Default for SeriesQuery {
    fn default() -> Self {
        Self {
            max_points: DEFAULT_MAX_POINTS,
            start_sec: 0.0,
            end_sec: -1.0,
        }
    }
}

impl SeriesQuery {
    fn clamped_points(&self) -> usize {
        if self.max_points == 0 {
            DEFAULT_MAX_POINTS
        } else {
            self.max_points.min(MAX_POINTS_CAP)
        }
    }
}

/// Read-side decimator over the stored raw series
pub struct Decimator {
    artifacts_path: PathBuf,
}

impl Decimator {
    pub fn new(artifacts_path: PathBuf) -> Self {
        Self { artifacts_path }
    }

    fn track_dir(&self, track_id: &str) -> PathBuf {
        super::manifest::artifact_dir(&self.artifacts_path, track_id)
    }

    /// The stored manifest for a track.
    pub fn manifest(&self, track_id: &str) -> Result<AnalysisManifest> {
        AnalysisManifest::load(&self.track_dir(track_id))
    }

    /// Load, window, decimate and package one module's series.
    pub fn series(
        &self,
        track_id: &str,
        module: &str,
        query: SeriesQuery,
    ) -> Result<SeriesResponse> {
        let dir = self.track_dir(track_id);
        let manifest = AnalysisManifest::load(&dir)?;
        let entry = manifest
            .modules
            .get(module)
            .filter(|m| m.status == "ok")
            .ok_or_else(|| {
                Error::NotFound(format!("module {} for track {}", module, track_id))
            })?;
        let hints = entry.render_hints.clone();

        match module {
            "audioscan" => self.audioscan_series(&dir, query, hints),
            "loudness" => self.loudness_series(&dir, query, hints),
            "clipping" => self.clipping_series(&dir, query, hints),
            "phase" => self.phase_series(&dir, query, hints),
            "dynamics" => self.dynamics_series(&dir, query, hints),
            other => Err(Error::InvalidInput(format!("unknown module {:?}", other))),
        }
    }

    fn audioscan_series(
        &self,
        dir: &Path,
        query: SeriesQuery,
        hints: Option<RenderHints>,
    ) -> Result<SeriesResponse> {
        let curve: AudioScanCurve =
            load_msgpack_zstd(&dir.join("audioscan_curve_v1.msgpack.zst"))?;
        let x = to_f64(&curve.curve.freq_hz);
        let y = to_f64(&curve.curve.level_db);

        let (x, y) = lttb(&x, &y, query.clamped_points());

        Ok(SeriesResponse {
            version: 1,
            module: "audioscan".to_string(),
            units: units(&[("x", "Hz"), ("y", "dB")]),
            render_hints: hints,
            series: HashMap::from([("x".to_string(), x), ("y".to_string(), y)]),
        })
    }

    fn loudness_series(
        &self,
        dir: &Path,
        query: SeriesQuery,
        hints: Option<RenderHints>,
    ) -> Result<SeriesResponse> {
        let raw: LoudnessSeries = load_msgpack_zstd(&dir.join("loudness_series_v1.msgpack.zst"))?;
        let t = to_f64(&raw.t_sec);
        let mut channels = vec![
            to_f64(&raw.momentary_lufs),
            to_f64(&raw.short_term_lufs),
            to_f64(&raw.true_peak_dbtp),
        ];
        let t = window_filter(t, &mut channels, query);

        let points = query.clamped_points();
        let (tx, momentary) = lttb(&t, &channels[0], points);
        let (_, short_term) = lttb(&t, &channels[1], points);
        // Peaks survive through the envelope, not LTTB
        let (_, true_peak) = max_envelope(&t, &channels[2], points);

        Ok(SeriesResponse {
            version: 1,
            module: "loudness".to_string(),
            units: units(&[
                ("x", "sec"),
                ("momentary", "LUFS"),
                ("shortTerm", "LUFS"),
                ("truePeak", "dBTP"),
            ]),
            render_hints: hints,
            series: HashMap::from([
                ("x".to_string(), tx),
                ("momentary".to_string(), momentary),
                ("shortTerm".to_string(), short_term),
                ("truePeak".to_string(), true_peak),
            ]),
        })
    }

    fn clipping_series(
        &self,
        dir: &Path,
        query: SeriesQuery,
        hints: Option<RenderHints>,
    ) -> Result<SeriesResponse> {
        let raw: ClippingSeries = load_msgpack_zstd(&dir.join("clipping_series_v1.msgpack.zst"))?;
        let t = to_f64(&raw.t_sec);
        let mut channels = vec![
            raw.clipped_samples.iter().map(|v| *v as f64).collect(),
            raw.overs_count.iter().map(|v| *v as f64).collect(),
        ];
        let t = window_filter(t, &mut channels, query);

        let points = query.clamped_points();
        let (tx, clipped) = max_envelope(&t, &channels[0], points);
        let (_, overs) = max_envelope(&t, &channels[1], points);

        Ok(SeriesResponse {
            version: 1,
            module: "clipping".to_string(),
            units: units(&[("x", "sec"), ("clipped", "samples"), ("overs", "samples")]),
            render_hints: hints,
            series: HashMap::from([
                ("x".to_string(), tx),
                ("clipped".to_string(), clipped),
                ("overs".to_string(), overs),
            ]),
        })
    }

    fn phase_series(
        &self,
        dir: &Path,
        query: SeriesQuery,
        hints: Option<RenderHints>,
    ) -> Result<SeriesResponse> {
        let raw: PhaseSeries = load_msgpack_zstd(&dir.join("phase_series_v1.msgpack.zst"))?;
        let t = to_f64(&raw.t_sec);
        let mut channels = vec![to_f64(&raw.correlation), to_f64(&raw.lr_balance_db)];
        let t = window_filter(t, &mut channels, query);

        let points = query.clamped_points();
        let (tx, correlation) = lttb(&t, &channels[0], points);
        let (_, balance) = lttb(&t, &channels[1], points);

        Ok(SeriesResponse {
            version: 1,
            module: "phase".to_string(),
            units: units(&[("x", "sec"), ("correlation", ""), ("lrBalance", "dB")]),
            render_hints: hints,
            series: HashMap::from([
                ("x".to_string(), tx),
                ("correlation".to_string(), correlation),
                ("lrBalance".to_string(), balance),
            ]),
        })
    }

    fn dynamics_series(
        &self,
        dir: &Path,
        query: SeriesQuery,
        hints: Option<RenderHints>,
    ) -> Result<SeriesResponse> {
        let raw: DynamicsSeries = load_msgpack_zstd(&dir.join("dynamics_series_v1.msgpack.zst"))?;
        let t = to_f64(&raw.t_sec);
        let mut channels = vec![
            to_f64(&raw.crest_factor_db),
            to_f64(&raw.rms_db),
            to_f64(&raw.peak_db),
        ];
        let t = window_filter(t, &mut channels, query);

        let points = query.clamped_points();
        let (tx, crest) = lttb(&t, &channels[0], points);
        let (_, rms) = lttb(&t, &channels[1], points);
        let (_, peak) = max_envelope(&t, &channels[2], points);

        Ok(SeriesResponse {
            version: 1,
            module: "dynamics".to_string(),
            units: units(&[
                ("x", "sec"),
                ("crestFactor", "dB"),
                ("rmsLevel", "dB"),
                ("peakLevel", "dB"),
            ]),
            render_hints: hints,
            series: HashMap::from([
                ("x".to_string(), tx),
                ("crestFactor".to_string(), crest),
                ("rmsLevel".to_string(), rms),
                ("peakLevel".to_string(), peak),
            ]),
        })
    }
}

fn units(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn to_f64(values: &[f32]) -> Vec<f64> {
    values.iter().map(|v| *v as f64).collect()
}

/// Restrict `t` and every parallel channel to `[start_sec, end_sec]`.
/// A negative end means no upper bound was requested.
fn window_filter(t: Vec<f64>, channels: &mut [Vec<f64>], query: SeriesQuery) -> Vec<f64> {
    if query.end_sec < 0.0 && query.start_sec <= 0.0 {
        return t;
    }
    let end = if query.end_sec < 0.0 {
        f64::INFINITY
    } else {
        query.end_sec
    };

    let keep: Vec<usize> = t
        .iter()
        .enumerate()
        .filter(|(_, &v)| v >= query.start_sec && v <= end)
        .map(|(i, _)| i)
        .collect();

    for channel in channels.iter_mut() {
        *channel = keep
            .iter()
            .filter_map(|&i| channel.get(i).copied())
            .collect();
    }
    keep.iter().map(|&i| t[i]).collect()
}

/// Largest-Triangle-Three-Buckets downsampling. Keeps the first and last
/// points; in each interior bucket picks the point maximizing the
/// triangle area against the previous pick and the next bucket's
/// centroid.
pub fn lttb(x: &[f64], y: &[f64], target_points: usize) -> (Vec<f64>, Vec<f64>) {
    let n = x.len().min(y.len());
    if n <= target_points || target_points < 3 {
        return (x[..n].to_vec(), y[..n].to_vec());
    }

    let mut out_x = Vec::with_capacity(target_points);
    let mut out_y = Vec::with_capacity(target_points);
    out_x.push(x[0]);
    out_y.push(y[0]);

    let bucket_size = (n - 2) as f64 / (target_points - 2) as f64;
    let mut prev_x = x[0];
    let mut prev_y = y[0];

    for i in 1..target_points - 1 {
        let bucket_start = ((i - 1) as f64 * bucket_size) as usize + 1;
        let bucket_end = ((i as f64 * bucket_size) as usize + 1).min(n - 1);

        // Next bucket centroid for the third triangle vertex
        let next_start = bucket_end;
        let next_end = (((i + 1) as f64 * bucket_size) as usize + 1).min(n - 1);
        let (mut avg_x, mut avg_y) = (0.0, 0.0);
        let count = next_end.saturating_sub(next_start);
        if count > 0 {
            for j in next_start..next_end {
                avg_x += x[j];
                avg_y += y[j];
            }
            avg_x /= count as f64;
            avg_y /= count as f64;
        }

        let mut max_area = -1.0;
        let mut max_idx = bucket_start;
        for j in bucket_start..bucket_end {
            let area =
                ((prev_x - avg_x) * (y[j] - prev_y) - (prev_x - x[j]) * (avg_y - prev_y)).abs();
            if area > max_area {
                max_area = area;
                max_idx = j;
            }
        }

        out_x.push(x[max_idx]);
        out_y.push(y[max_idx]);
        prev_x = x[max_idx];
        prev_y = y[max_idx];
    }

    out_x.push(x[n - 1]);
    out_y.push(y[n - 1]);
    (out_x, out_y)
}

/// Bucketed max envelope: one point per bucket carrying the bucket's
/// maximum, so spikes always survive.
pub fn max_envelope(x: &[f64], y: &[f64], target_points: usize) -> (Vec<f64>, Vec<f64>) {
    let n = x.len().min(y.len());
    if n <= target_points || target_points == 0 {
        return (x[..n].to_vec(), y[..n].to_vec());
    }

    let bucket_size = n as f64 / target_points as f64;
    let mut out_x = Vec::with_capacity(target_points);
    let mut out_y = Vec::with_capacity(target_points);

    for i in 0..target_points {
        let start = (i as f64 * bucket_size) as usize;
        let end = (((i + 1) as f64 * bucket_size) as usize).min(n);
        if start >= end {
            continue;
        }

        let mut max_idx = start;
        for j in start..end {
            if y[j] > y[max_idx] {
                max_idx = j;
            }
        }
        out_x.push(x[max_idx]);
        out_y.push(y[max_idx]);
    }

    (out_x, out_y)
}
