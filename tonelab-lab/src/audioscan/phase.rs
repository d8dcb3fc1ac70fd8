//! Phase correlation module (stereo only)
//!
//! aphasemeter provides the per-frame correlation in [-1, +1]; astats
//! per-channel RMS gives the left/right balance. Mono tracks are
//! reported as skipped, not failed.

use super::compute_sha256_ref;
use super::decode::{parse_frame_metadata, DecodeShim, FrameMeta};
use super::manifest::{ModuleOutcome, RenderHints};
use super::rawdata::{save_msgpack_zstd, PhaseSeries, RAW_DATA_VERSION};
use crate::jobs::JobLogger;
use crate::models::Track;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tonelab_common::Result;

const RAW_FILENAME: &str = "phase_series_v1.msgpack.zst";
pub const MONO_SKIP_REASON: &str = "Mono track - phase analysis not applicable";
/// Fraction of negative-correlation frames that flags a phase issue
const ISSUE_FRACTION: f32 = 0.25;

pub async fn run(
    shim: &DecodeShim,
    track: &Track,
    duration: f64,
    dir: &Path,
    log: &dyn JobLogger,
    cancel: &CancellationToken,
) -> Result<ModuleOutcome> {
    if track.channels < 2 {
        log.info("phase", "Skipping phase analysis (mono track)");
        return Ok(ModuleOutcome::Skipped {
            reason: MONO_SKIP_REASON.to_string(),
        });
    }

    log.debug(
        "phase",
        "Running stereo phase correlation analysis",
        &format!("Duration: {:.1}s", duration),
    );

    let args = vec![
        "-i".to_string(),
        track.path.clone(),
        "-t".to_string(),
        format!("{:.2}", duration),
        "-af".to_string(),
        "aphasemeter=video=0,astats=metadata=1:reset=1,ametadata=print:file=-".to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ];
    let output = shim.run_ffmpeg(Path::new(&track.path), &args, cancel).await?;

    let frames = parse_frame_metadata(&output.stdout_str());
    let series = build_series(&frames);

    log.info(
        "phase",
        &format!(
            "Correlation: Min={:.2}, Avg={:.2}, Max Imbalance={:.1} dB",
            series.min_correlation, series.avg_correlation, series.max_imbalance_db
        ),
    );
    if series.min_correlation < -0.5 || series.avg_correlation < 0.0 {
        log.warn(
            "phase",
            "Potential phase issues detected",
            "Low or negative correlation may indicate phase problems",
        );
    }

    let raw_path = dir.join(RAW_FILENAME);
    save_msgpack_zstd(&raw_path, &series)?;
    let raw = compute_sha256_ref(&raw_path, RAW_FILENAME)?;

    let render_hints = RenderHints {
        duration_sec: Some(duration),
        min_corr: Some(-1.0),
        max_corr: Some(1.0),
        x_unit: Some("sec".to_string()),
        y_unit: Some("correlation".to_string()),
        ..Default::default()
    };

    let phase_issue = phase_issue(&series);
    let summary = serde_json::json!({
        "minCorrelation": series.min_correlation,
        "avgCorrelation": series.avg_correlation,
        "maxImbalanceDb": series.max_imbalance_db,
        "phaseIssue": phase_issue,
    });

    log.info("phase", "Phase analysis module complete");
    Ok(ModuleOutcome::Ok {
        summary,
        raw,
        render_hints,
    })
}

/// Assemble the series from aphasemeter + astats frame metadata.
pub fn build_series(frames: &[FrameMeta]) -> PhaseSeries {
    let mut series = PhaseSeries {
        version: RAW_DATA_VERSION,
        min_correlation: 1.0,
        avg_correlation: 1.0,
        ..Default::default()
    };

    let mut sum = 0.0f32;
    for frame in frames {
        let Some(&correlation) = frame.values.get("lavfi.aphasemeter.phase") else {
            continue;
        };
        let correlation = (correlation as f32).clamp(-1.0, 1.0);

        let rms_left = frame.values.get("lavfi.astats.1.RMS_level").copied();
        let rms_right = frame.values.get("lavfi.astats.2.RMS_level").copied();
        let balance = match (rms_left, rms_right) {
            (Some(l), Some(r)) => (l - r) as f32,
            _ => 0.0,
        };

        series.t_sec.push(frame.pts_time as f32);
        series.correlation.push(correlation);
        series.lr_balance_db.push(balance);

        sum += correlation;
        series.min_correlation = series.min_correlation.min(correlation);
        if balance.abs() > series.max_imbalance_db.abs() {
            series.max_imbalance_db = balance;
        }
    }

    if !series.correlation.is_empty() {
        series.avg_correlation = sum / series.correlation.len() as f32;
    }

    series
}

/// More than a quarter of the frames anti-correlated means something is
/// wrong with the stereo image.
pub fn phase_issue(series: &PhaseSeries) -> bool {
    if series.correlation.is_empty() {
        return false;
    }
    let negative = series.correlation.iter().filter(|c| **c < 0.0).count();
    (negative as f32 / series.correlation.len() as f32) > ISSUE_FRACTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn frame(t: f64, phase: f64, rms: Option<(f64, f64)>) -> FrameMeta {
        let mut values = HashMap::new();
        values.insert("lavfi.aphasemeter.phase".to_string(), phase);
        if let Some((l, r)) = rms {
            values.insert("lavfi.astats.1.RMS_level".to_string(), l);
            values.insert("lavfi.astats.2.RMS_level".to_string(), r);
        }
        FrameMeta {
            pts_time: t,
            values,
        }
    }

    #[test]
    fn well_correlated_stereo() {
        let frames: Vec<FrameMeta> = (0..10)
            .map(|i| frame(i as f64 * 0.1, 0.96, Some((-18.0, -18.5))))
            .collect();
        let series = build_series(&frames);

        assert_eq!(series.correlation.len(), 10);
        assert!(series.avg_correlation > 0.95);
        assert_eq!(series.min_correlation, 0.96);
        assert!((series.max_imbalance_db - 0.5).abs() < 1e-6);
        assert!(!phase_issue(&series));
    }

    #[test]
    fn imbalance_keeps_the_sign_of_the_largest_magnitude() {
        let frames = vec![
            frame(0.0, 0.9, Some((-18.0, -16.0))), // balance -2.0
            frame(0.1, 0.9, Some((-15.0, -16.5))), // balance +1.5
        ];
        let series = build_series(&frames);
        assert_eq!(series.max_imbalance_db, -2.0);
    }

    #[test]
    fn issue_flag_requires_more_than_a_quarter_negative() {
        let mut frames: Vec<FrameMeta> =
            (0..3).map(|i| frame(i as f64, -0.4, None)).collect();
        frames.extend((3..12).map(|i| frame(i as f64, 0.8, None)));
        let series = build_series(&frames);
        // 3 of 12 = exactly 25%, not an issue
        assert!(!phase_issue(&series));

        frames.push(frame(12.0, -0.1, None));
        let series = build_series(&frames);
        // 4 of 13 > 25%
        assert!(phase_issue(&series));
    }

    #[test]
    fn frames_without_phase_are_skipped() {
        let frames = vec![FrameMeta {
            pts_time: 0.0,
            values: HashMap::from([("lavfi.astats.1.RMS_level".to_string(), -20.0)]),
        }];
        let series = build_series(&frames);
        assert!(series.t_sec.is_empty());
        assert_eq!(series.avg_correlation, 1.0);
    }
}
