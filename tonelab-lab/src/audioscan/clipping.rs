//! Clipping detection module
//!
//! Reads per-frame peak levels from the decoder's astats metadata, takes
//! the max across channels per frame, and quantizes to at least 20 ms
//! between retained buckets (merged buckets keep the max). A bucket
//! counts as clipped when its peak reaches the threshold, -0.1 dBFS by
//! default.

use super::compute_sha256_ref;
use super::decode::{parse_frame_metadata, DecodeShim, FrameMeta};
use super::manifest::{ModuleOutcome, RenderHints};
use super::rawdata::{save_msgpack_zstd, ClippingSeries, RAW_DATA_VERSION};
use crate::jobs::JobLogger;
use crate::models::Track;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tonelab_common::Result;

const RAW_FILENAME: &str = "clipping_series_v1.msgpack.zst";
pub const DEFAULT_THRESHOLD_DBFS: f32 = -0.1;
const MIN_BUCKET_SPACING_SEC: f32 = 0.02;

pub async fn run(
    shim: &DecodeShim,
    track: &Track,
    duration: f64,
    dir: &Path,
    log: &dyn JobLogger,
    cancel: &CancellationToken,
) -> Result<ModuleOutcome> {
    log.debug(
        "clipping",
        "Running clipping detection",
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
    let series = build_series(&frames, DEFAULT_THRESHOLD_DBFS);

    if series.total_clipped > 0 {
        log.warn(
            "clipping",
            &format!(
                "Clipping detected: {} clipped buckets, {} overs",
                series.total_clipped, series.total_overs
            ),
            "",
        );
    } else {
        log.info("clipping", "No clipping detected");
    }

    let raw_path = dir.join(RAW_FILENAME);
    save_msgpack_zstd(&raw_path, &series)?;
    let raw = compute_sha256_ref(&raw_path, RAW_FILENAME)?;

    let render_hints = RenderHints {
        duration_sec: Some(duration),
        x_unit: Some("sec".to_string()),
        y_unit: Some("clips".to_string()),
        ..Default::default()
    };

    let summary = serde_json::json!({
        "totalClipped": series.total_clipped,
        "totalOvers": series.total_overs,
        "hasClipping": series.total_clipped > 0,
    });

    log.info("clipping", "Clipping detection module complete");
    Ok(ModuleOutcome::Ok {
        summary,
        raw,
        render_hints,
    })
}

/// Per-frame channel max of astats Peak_level, preferring the explicit
/// per-channel keys and falling back to Overall.
fn frame_peak(frame: &FrameMeta) -> Option<f32> {
    let mut peak: Option<f32> = None;
    for (key, value) in &frame.values {
        let is_channel_peak = key.starts_with("lavfi.astats.")
            && key.ends_with(".Peak_level")
            && !key.contains("Overall");
        if is_channel_peak {
            peak = Some(peak.map_or(*value as f32, |p: f32| p.max(*value as f32)));
        }
    }
    peak.or_else(|| {
        frame
            .values
            .get("lavfi.astats.Overall.Peak_level")
            .map(|v| *v as f32)
    })
}

/// Quantize frame peaks to buckets at least 20 ms apart and flag the
/// clipped ones.
pub fn build_series(frames: &[FrameMeta], threshold_dbfs: f32) -> ClippingSeries {
    let mut series = ClippingSeries {
        version: RAW_DATA_VERSION,
        threshold_dbfs,
        ..Default::default()
    };

    let mut bucket_t: Option<f32> = None;
    let mut bucket_peak = f32::MIN;

    let flush =
        |series: &mut ClippingSeries, t: f32, peak: f32| {
            let clipped = if peak >= threshold_dbfs { 1 } else { 0 };
            series.t_sec.push(t);
            series.clipped_samples.push(clipped);
            series.overs_count.push(0);
            if clipped == 1 {
                series.total_clipped += 1;
            }
        };

    for frame in frames {
        let Some(peak) = frame_peak(frame) else {
            continue;
        };
        let t = frame.pts_time as f32;

        match bucket_t {
            Some(start) if t - start < MIN_BUCKET_SPACING_SEC => {
                bucket_peak = bucket_peak.max(peak);
            }
            Some(start) => {
                flush(&mut series, start, bucket_peak);
                bucket_t = Some(t);
                bucket_peak = peak;
            }
            None => {
                bucket_t = Some(t);
                bucket_peak = peak;
            }
        }
    }
    if let Some(start) = bucket_t {
        flush(&mut series, start, bucket_peak);
    }

    // Worst section: bucket with the highest clip count (first on ties)
    let mut max_clipped = 0;
    for (i, &clipped) in series.clipped_samples.iter().enumerate() {
        if clipped > max_clipped {
            max_clipped = clipped;
            series.worst_section_idx = i as i32;
        }
    }

    series
}
