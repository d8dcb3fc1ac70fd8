//! Dynamics analysis module
//!
//! Per-frame crest factor from astats peak and RMS levels. The DR score
//! is the rounded average crest factor clamped to [1, 20]; higher means
//! more dynamic range survived mastering.

use super::compute_sha256_ref;
use super::decode::{parse_frame_metadata, DecodeShim, FrameMeta};
use super::manifest::{ModuleOutcome, RenderHints};
use super::rawdata::{save_msgpack_zstd, DynamicsSeries, RAW_DATA_VERSION};
use crate::jobs::JobLogger;
use crate::models::Track;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tonelab_common::Result;

const RAW_FILENAME: &str = "dynamics_series_v1.msgpack.zst";

pub async fn run(
    shim: &DecodeShim,
    track: &Track,
    duration: f64,
    dir: &Path,
    log: &dyn JobLogger,
    cancel: &CancellationToken,
) -> Result<ModuleOutcome> {
    log.debug(
        "dynamics",
        "Running dynamic range analysis",
        &format!("Duration: {:.1}s", duration),
    );

    let args = vec![
        "-i".to_string(),
        track.path.clone(),
        "-t".to_string(),
        format!("{:.2}", duration),
        "-af".to_string(),
        "astats=metadata=1:reset=1,ametadata=print:file=-".to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ];
    let output = shim.run_ffmpeg(Path::new(&track.path), &args, cancel).await?;

    let frames = parse_frame_metadata(&output.stdout_str());
    let series = build_series(&frames);

    log.info(
        "dynamics",
        &format!(
            "DR Score: {}, Avg Crest: {:.1} dB, Min Crest: {:.1} dB",
            series.dr_score, series.avg_crest_db, series.min_crest_db
        ),
    );

    let raw_path = dir.join(RAW_FILENAME);
    save_msgpack_zstd(&raw_path, &series)?;
    let raw = compute_sha256_ref(&raw_path, RAW_FILENAME)?;

    let render_hints = RenderHints {
        duration_sec: Some(duration),
        min_db: Some(0.0),
        // Crest factor range
        max_db: Some(25.0),
        x_unit: Some("sec".to_string()),
        y_unit: Some("dB".to_string()),
        ..Default::default()
    };

    let summary = serde_json::json!({
        "drScore": series.dr_score,
        "avgCrestDb": series.avg_crest_db,
        "minCrestDb": series.min_crest_db,
    });

    log.info("dynamics", "Dynamics analysis module complete");
    Ok(ModuleOutcome::Ok {
        summary,
        raw,
        render_hints,
    })
}

fn frame_peak_and_rms(frame: &FrameMeta) -> Option<(f32, f32)> {
    let peak = frame
        .values
        .get("lavfi.astats.Overall.Peak_level")
        .copied()
        .or_else(|| {
            frame
                .values
                .iter()
                .filter(|(k, _)| {
                    k.starts_with("lavfi.astats.") && k.ends_with(".Peak_level")
                })
                .map(|(_, v)| *v)
                .fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.max(v)))
                })
        })?;
    let rms = frame
        .values
        .get("lavfi.astats.Overall.RMS_level")
        .copied()
        .or_else(|| {
            frame
                .values
                .iter()
                .filter(|(k, _)| k.starts_with("lavfi.astats.") && k.ends_with(".RMS_level"))
                .map(|(_, v)| *v)
                .fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.max(v)))
                })
        })?;
    Some((peak as f32, rms as f32))
}

/// Assemble the series; crest factor is floored at zero per frame, and
/// the averages run over the positive values only.
pub fn build_series(frames: &[FrameMeta]) -> DynamicsSeries {
    let mut series = DynamicsSeries {
        version: RAW_DATA_VERSION,
        min_crest_db: 100.0,
        ..Default::default()
    };

    let mut sum = 0.0f32;
    let mut positive = 0usize;
    for frame in frames {
        let Some((peak, rms)) = frame_peak_and_rms(frame) else {
            continue;
        };
        let crest = (peak - rms).max(0.0);

        series.t_sec.push(frame.pts_time as f32);
        series.peak_db.push(peak);
        series.rms_db.push(rms);
        series.crest_factor_db.push(crest);

        if crest > 0.0 {
            sum += crest;
            positive += 1;
            series.min_crest_db = series.min_crest_db.min(crest);
        }
    }

    if positive > 0 {
        series.avg_crest_db = sum / positive as f32;
        series.dr_score = (series.avg_crest_db.round() as i32).clamp(1, 20);
    } else {
        series.min_crest_db = 0.0;
    }

    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn frame(t: f64, peak: f64, rms: f64) -> FrameMeta {
        FrameMeta {
            pts_time: t,
            values: HashMap::from([
                ("lavfi.astats.Overall.Peak_level".to_string(), peak),
                ("lavfi.astats.Overall.RMS_level".to_string(), rms),
            ]),
        }
    }

    #[test]
    fn crest_factor_and_dr_score() {
        let frames = vec![
            frame(0.0, -6.0, -20.0), // crest 14
            frame(0.5, -5.0, -18.0), // crest 13
            frame(1.0, -4.0, -19.0), // crest 15
        ];
        let series = build_series(&frames);

        assert_eq!(series.crest_factor_db, vec![14.0, 13.0, 15.0]);
        assert_eq!(series.avg_crest_db, 14.0);
        assert_eq!(series.min_crest_db, 13.0);
        assert_eq!(series.dr_score, 14);
    }

    #[test]
    fn crest_is_floored_at_zero() {
        // RMS above peak can only happen through measurement windows;
        // the frame contributes a zero, not a negative.
        let frames = vec![frame(0.0, -10.0, -8.0), frame(0.5, -6.0, -20.0)];
        let series = build_series(&frames);
        assert_eq!(series.crest_factor_db[0], 0.0);
        // Averages run over positive values only
        assert_eq!(series.avg_crest_db, 14.0);
        assert_eq!(series.min_crest_db, 14.0);
    }

    #[test]
    fn brickwalled_audio_pins_score_low() {
        let frames: Vec<FrameMeta> =
            (0..10).map(|i| frame(i as f64 * 0.5, -0.2, -0.7)).collect();
        let series = build_series(&frames);
        assert_eq!(series.dr_score, 1);
    }

    #[test]
    fn score_caps_at_twenty() {
        let frames: Vec<FrameMeta> =
            (0..10).map(|i| frame(i as f64 * 0.5, -1.0, -30.0)).collect();
        let series = build_series(&frames);
        assert_eq!(series.dr_score, 20);
    }

    #[test]
    fn per_channel_fallback_when_overall_missing() {
        let frames = vec![FrameMeta {
            pts_time: 0.0,
            values: HashMap::from([
                ("lavfi.astats.1.Peak_level".to_string(), -6.0),
                ("lavfi.astats.2.Peak_level".to_string(), -5.0),
                ("lavfi.astats.1.RMS_level".to_string(), -20.0),
                ("lavfi.astats.2.RMS_level".to_string(), -21.0),
            ]),
        }];
        let series = build_series(&frames);
        assert_eq!(series.peak_db, vec![-5.0]);
        assert_eq!(series.rms_db, vec![-20.0]);
        assert_eq!(series.crest_factor_db, vec![15.0]);
    }
}
