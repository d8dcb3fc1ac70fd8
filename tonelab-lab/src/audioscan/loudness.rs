//! Loudness analysis module (BS.1770 / EBU R128)
//!
//! Drives the decoder's ebur128 filter in verbose mode and parses the
//! per-frame diagnostic lines: momentary (400 ms) and short-term (3 s)
//! loudness, true peak per channel (max taken per frame), and the final
//! summary block (integrated, LRA, peak). `-inf` values become -120 so
//! lead-in silence stays plottable.

use super::decode::DecodeShim;
use super::manifest::{ModuleOutcome, RenderHints};
use super::rawdata::{save_msgpack_zstd, LoudnessSeries, RAW_DATA_VERSION};
use super::compute_sha256_ref;
use crate::jobs::JobLogger;
use crate::models::Track;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tonelab_common::Result;

const RAW_FILENAME: &str = "loudness_series_v1.msgpack.zst";
const SILENCE_FLOOR: f32 = -120.0;

pub async fn run(
    shim: &DecodeShim,
    track: &Track,
    duration: f64,
    dir: &Path,
    log: &dyn JobLogger,
    cancel: &CancellationToken,
) -> Result<ModuleOutcome> {
    log.debug(
        "loudness",
        "Running EBU R128 loudness analysis",
        &format!("Duration: {:.1}s", duration),
    );

    let args = vec![
        "-loglevel".to_string(),
        "verbose".to_string(),
        "-i".to_string(),
        track.path.clone(),
        "-t".to_string(),
        format!("{:.2}", duration),
        "-af".to_string(),
        "ebur128=peak=true:metadata=1".to_string(),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ];
    let output = shim.run_ffmpeg(Path::new(&track.path), &args, cancel).await?;

    let series = parse_ebur128_output(&output.stderr);
    log.info(
        "loudness",
        &format!(
            "Integrated: {:.1} LUFS, LRA: {:.1} LU, True Peak: {:.1} dBTP",
            series.integrated_lufs, series.lra, series.max_true_peak
        ),
    );

    let raw_path = dir.join(RAW_FILENAME);
    save_msgpack_zstd(&raw_path, &series)?;
    let raw = compute_sha256_ref(&raw_path, RAW_FILENAME)?;

    let render_hints = RenderHints {
        duration_sec: Some(duration),
        min_lufs: Some(-60.0),
        max_lufs: Some(0.0),
        min_db: Some(-60.0),
        // True peak can exceed 0 dBFS
        max_db: Some(3.0),
        x_unit: Some("sec".to_string()),
        y_unit: Some("LUFS".to_string()),
        y2_unit: Some("dBTP".to_string()),
        ..Default::default()
    };

    let summary = serde_json::json!({
        "integratedLUFS": series.integrated_lufs,
        "lra": series.lra,
        "maxTruePeak": series.max_true_peak,
        "maxSamplePeak": series.max_sample_peak,
    });

    log.info("loudness", "Loudness analysis module complete");
    Ok(ModuleOutcome::Ok {
        summary,
        raw,
        render_hints,
    })
}

fn frame_regexes() -> &'static (Regex, Regex, Regex, Regex) {
    static REGEXES: OnceLock<(Regex, Regex, Regex, Regex)> = OnceLock::new();
    REGEXES.get_or_init(|| {
        (
            Regex::new(r"t:\s*([\d.]+)").unwrap(),
            Regex::new(r"M:\s*(-?[\d.]+|-inf)").unwrap(),
            Regex::new(r"S:\s*(-?[\d.]+|-inf)").unwrap(),
            Regex::new(r"TPK:\s*(-?[\d.]+|-inf)\s+(-?[\d.]+|-inf)").unwrap(),
        )
    })
}

fn summary_regexes() -> &'static (Regex, Regex, Regex) {
    static REGEXES: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    REGEXES.get_or_init(|| {
        (
            Regex::new(r"I:\s*(-?[\d.]+)\s*LUFS").unwrap(),
            Regex::new(r"LRA:\s*(-?[\d.]+)").unwrap(),
            Regex::new(r"Peak:\s*(-?[\d.]+)\s*dBFS").unwrap(),
        )
    })
}

fn parse_loudness_value(s: &str) -> f32 {
    if s == "-inf" {
        SILENCE_FLOOR
    } else {
        s.parse().unwrap_or(SILENCE_FLOOR)
    }
}

/// Parse the full verbose ebur128 stderr stream into a series.
pub fn parse_ebur128_output(stderr: &str) -> LoudnessSeries {
    let (time_re, momentary_re, short_term_re, true_peak_re) = frame_regexes();
    let (integrated_re, lra_re, peak_re) = summary_regexes();

    let mut series = LoudnessSeries {
        version: RAW_DATA_VERSION,
        window_sec: 0.1,
        max_true_peak: SILENCE_FLOOR,
        ..Default::default()
    };

    for line in stderr.lines() {
        if line.contains("[Parsed_ebur128") && line.contains("t:") {
            if let Some(m) = time_re.captures(line) {
                if let Ok(t) = m[1].parse::<f32>() {
                    series.t_sec.push(t);
                }
            }
            if let Some(m) = momentary_re.captures(line) {
                series.momentary_lufs.push(parse_loudness_value(&m[1]));
            }
            if let Some(m) = short_term_re.captures(line) {
                series.short_term_lufs.push(parse_loudness_value(&m[1]));
            }
            if let Some(m) = true_peak_re.captures(line) {
                let mut peak = SILENCE_FLOOR;
                for i in 1..=2 {
                    let channel = &m[i];
                    if channel == "-inf" {
                        continue;
                    }
                    if let Ok(v) = channel.parse::<f32>() {
                        peak = peak.max(v);
                    }
                }
                series.true_peak_dbtp.push(peak);
                series.max_true_peak = series.max_true_peak.max(peak);
            }
            continue;
        }

        // Summary block values
        if line.contains("I:") && line.contains("LUFS") {
            if let Some(m) = integrated_re.captures(line) {
                if let Ok(v) = m[1].parse() {
                    series.integrated_lufs = v;
                }
            }
        }
        if line.contains("LRA:") && line.contains("LU") {
            if let Some(m) = lra_re.captures(line) {
                if let Ok(v) = m[1].parse() {
                    series.lra = v;
                }
            }
        }
        if line.contains("Peak:") && line.contains("dBFS") {
            if let Some(m) = peak_re.captures(line) {
                if let Ok(v) = m[1].parse::<f32>() {
                    series.max_true_peak = series.max_true_peak.max(v);
                }
            }
        }
    }

    if series.max_true_peak == SILENCE_FLOOR {
        series.max_true_peak = 0.0;
    }

    // The sample-peak series mirrors true peak; a second decode pass for
    // exact sample peaks is not worth the I/O on network mounts.
    series.sample_peak_dbfs = series.true_peak_dbtp.clone();
    series.max_sample_peak = series.max_true_peak;

    series
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_STDERR: &str = "\
[Parsed_ebur128_0 @ 0x55] t: 0.0999773  TARGET:-23 LUFS    M: -inf S: -inf     I: -70.0 LUFS       LRA:   0.0 LU   FTPK: -12.1 -13.0 dBFS  TPK: -12.1 -13.0 dBFS
[Parsed_ebur128_0 @ 0x55] t: 0.199977   TARGET:-23 LUFS    M:-14.7 S: -inf     I: -15.2 LUFS       LRA:   0.0 LU   FTPK: -6.2 -5.9 dBFS  TPK: -6.2 -5.9 dBFS
[Parsed_ebur128_0 @ 0x55] t: 0.299977   TARGET:-23 LUFS    M:-14.1 S:-14.4     I: -14.6 LUFS       LRA:   0.3 LU   FTPK: -5.8 -6.1 dBFS  TPK: -5.8 -5.7 dBFS
[Parsed_ebur128_0 @ 0x55] Summary:

  Integrated loudness:
    I:         -14.2 LUFS
    Threshold: -24.6 LUFS

  Loudness range:
    LRA:         6.4 LU
    Threshold: -34.6 LUFS

  True peak:
    Peak:       -0.5 dBFS
";

    #[test]
    fn per_frame_series_parse() {
        let series = parse_ebur128_output(SAMPLE_STDERR);

        assert_eq!(series.t_sec.len(), 3);
        assert_eq!(series.momentary_lufs.len(), 3);
        assert_eq!(series.short_term_lufs.len(), 3);
        assert_eq!(series.true_peak_dbtp.len(), 3);

        // -inf maps to the floor
        assert_eq!(series.momentary_lufs[0], -120.0);
        assert_eq!(series.short_term_lufs[1], -120.0);
        assert_eq!(series.momentary_lufs[1], -14.7);

        // Per-frame true peak takes the channel max
        assert_eq!(series.true_peak_dbtp[0], -12.1);
        assert_eq!(series.true_peak_dbtp[2], -5.7);

        // Sample peak mirrors true peak
        assert_eq!(series.sample_peak_dbfs, series.true_peak_dbtp);
    }

    #[test]
    fn summary_scalars_parse() {
        let series = parse_ebur128_output(SAMPLE_STDERR);
        assert_eq!(series.integrated_lufs, -14.2);
        assert_eq!(series.lra, 6.4);
        // Summary peak (-0.5) dominates the per-frame maxima
        assert_eq!(series.max_true_peak, -0.5);
        assert_eq!(series.max_sample_peak, -0.5);
    }

    #[test]
    fn empty_output_yields_empty_series() {
        let series = parse_ebur128_output("");
        assert!(series.t_sec.is_empty());
        assert_eq!(series.integrated_lufs, 0.0);
        assert_eq!(series.max_true_peak, 0.0);
    }
}
