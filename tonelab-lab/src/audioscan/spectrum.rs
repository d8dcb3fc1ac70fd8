//! Spectrum analysis module (`audioscan`)
//!
//! Decodes a mono downmix to f32 PCM and computes the long-term average
//! spectrum with a real FFT: 4096-point Hann windows, 1024-sample hop,
//! power averaged across frames, then smoothed over 0.25-octave bands.
//! Bandwidth detection walks the curve down from Nyquist; the quality
//! classification compares detected bandwidth against what the probe
//! metadata promises.

use super::decode::DecodeShim;
use super::manifest::{ModuleOutcome, RenderHints};
use super::rawdata::{save_msgpack_zstd, AudioScanCurve, RAW_DATA_VERSION};
use super::{channels_label, compute_sha256_ref};
use crate::jobs::JobLogger;
use crate::models::Track;
use rustfft::{num_complex::Complex32, FftPlanner};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tonelab_common::{Error, Result};

pub const FFT_SIZE: usize = 4096;
pub const HOP_SIZE: usize = FFT_SIZE / 4;
pub const SMOOTHING_OCTAVES: f64 = 0.25;
const LEVEL_FLOOR_DB: f32 = -120.0;
const DC_FLAG_THRESHOLD: f32 = 0.001;

const RAW_FILENAME: &str = "audioscan_curve_v1.msgpack.zst";

pub async fn run(
    shim: &DecodeShim,
    track: &Track,
    duration: f64,
    dir: &Path,
    log: &dyn JobLogger,
    cancel: &CancellationToken,
) -> Result<ModuleOutcome> {
    let sample_rate = track.sample_rate;
    if sample_rate <= 0 {
        return Err(Error::InvalidInput(format!(
            "track {} has no sample rate",
            track.id
        )));
    }
    let nyquist = sample_rate / 2;

    log.debug(
        "audioscan",
        "FFT parameters configured",
        &format!(
            "FFT size: {}, Hop size: {}, Nyquist: {}Hz",
            FFT_SIZE, HOP_SIZE, nyquist
        ),
    );

    let channel_mode = if track.channels == 1 {
        "mono"
    } else {
        "stereo-downmix"
    };
    log.debug(
        "audioscan",
        "Decoding PCM for spectrum analysis",
        &format!("Duration: {:.1}s, Mode: {}", duration, channel_mode),
    );

    let samples = decode_mono_f32(shim, track, duration, cancel).await?;
    if samples.is_empty() {
        return Err(Error::Parse("decoder produced no samples".to_string()));
    }
    log.debug(
        "audioscan",
        "PCM decode complete",
        &format!("{} samples", samples.len()),
    );

    let (freq_hz, level_db, frames) = power_spectrum(&samples, sample_rate);
    let level_db = smooth_octave_fraction(&freq_hz, &level_db, SMOOTHING_OCTAVES);

    let dc_mean = samples.iter().copied().sum::<f32>() / samples.len() as f32;
    let dc_flag = dc_mean.abs() > DC_FLAG_THRESHOLD;

    let bandwidth_hz = calculate_bandwidth(&freq_hz, &level_db);
    log.info(
        "audioscan",
        &format!("Detected bandwidth: {} Hz", bandwidth_hz),
    );
    if dc_flag {
        log.warn(
            "audioscan",
            "DC offset detected in audio",
            &format!("DC Mean: {:.4}", dc_mean),
        );
    }

    let mut guides = vec![nyquist];
    for reference in [20000, 16000, 12000] {
        if reference < nyquist {
            guides.push(reference);
        }
    }

    let mut curve = AudioScanCurve {
        version: RAW_DATA_VERSION,
        sample_rate_hz: sample_rate,
        nyquist_hz: nyquist,
        ..Default::default()
    };
    curve.analyzed.start_sec = 0.0;
    curve.analyzed.duration_sec = duration;
    curve.analyzed.channel_mode = channel_mode.to_string();
    curve.analyzed.decode_format = "f32le".to_string();
    curve.fft.fft_size = FFT_SIZE as i32;
    curve.fft.hop_size = HOP_SIZE as i32;
    curve.fft.window = "hann".to_string();
    curve.fft.frames = frames as i32;
    curve.fft.smoothing_octaves = SMOOTHING_OCTAVES;
    curve.curve.freq_hz = freq_hz;
    curve.curve.level_db = level_db;
    curve.metrics.bandwidth_hz = bandwidth_hz;
    curve.metrics.dc_mean = dc_mean;
    curve.metrics.dc_flag = dc_flag;
    curve.guides.vertical_lines_hz = guides.clone();

    let raw_path = dir.join(RAW_FILENAME);
    save_msgpack_zstd(&raw_path, &curve)?;
    let raw = compute_sha256_ref(&raw_path, RAW_FILENAME)?;

    let expected_quality = derive_expected_quality(
        if track.bit_depth > 0 {
            Some(track.bit_depth)
        } else {
            None
        },
        sample_rate,
        &track.codec,
    );
    let (detected_quality, quality_reason) = classify_detected_quality(bandwidth_hz, nyquist);
    log.info(
        "audioscan",
        &format!(
            "Quality: Expected={}, Detected={}",
            expected_quality, detected_quality
        ),
    );
    log.debug("audioscan", "Quality reason", &quality_reason);

    let render_hints = RenderHints {
        nyquist_hz: Some(nyquist),
        guide_lines_hz: Some(guides),
        freq_scale_log: Some(true),
        // Lossy cutoffs live above 10 kHz; start the view there
        min_freq_hz: Some(10000),
        max_freq_hz: Some(nyquist),
        min_db: Some(-80.0),
        max_db: Some(0.0),
        x_unit: Some("Hz".to_string()),
        y_unit: Some("dB".to_string()),
        ..Default::default()
    };

    let summary = serde_json::json!({
        "expectedQuality": expected_quality,
        "detectedQuality": detected_quality,
        "qualityReason": quality_reason,
        "bandwidthHz": bandwidth_hz,
        "dcIssues": if dc_flag { 1 } else { 0 },
        "channelsLabel": channels_label(track.channels),
    });

    log.info("audioscan", "Spectrum analysis module complete");
    Ok(ModuleOutcome::Ok {
        summary,
        raw,
        render_hints,
    })
}

/// Decode a mono f32le downmix of the analysis window.
async fn decode_mono_f32(
    shim: &DecodeShim,
    track: &Track,
    duration: f64,
    cancel: &CancellationToken,
) -> Result<Vec<f32>> {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-i".to_string(),
        track.path.clone(),
        "-t".to_string(),
        format!("{:.2}", duration),
        "-af".to_string(),
        "aformat=sample_fmts=flt:channel_layouts=mono".to_string(),
        "-f".to_string(),
        "f32le".to_string(),
        "-".to_string(),
    ];
    let output = shim.run_ffmpeg(Path::new(&track.path), &args, cancel).await?;

    let bytes = output.stdout;
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(samples)
}

/// Long-term average spectrum: Hann-windowed frames, power averaged,
/// amplitude-normalized to dBFS. Returns ascending frequency bins, their
/// levels and the frame count.
pub fn power_spectrum(samples: &[f32], sample_rate: i32) -> (Vec<f32>, Vec<f32>, usize) {
    let bins = FFT_SIZE / 2;
    let window: Vec<f32> = (0..FFT_SIZE)
        .map(|n| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (FFT_SIZE as f32 - 1.0)).cos())
        })
        .collect();
    let window_sum: f32 = window.iter().sum();

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_SIZE);

    let mut power = vec![0.0f64; bins];
    let mut frames = 0usize;
    let mut buffer = vec![Complex32::new(0.0, 0.0); FFT_SIZE];

    let mut offset = 0;
    while offset + FFT_SIZE <= samples.len() {
        for (i, sample) in samples[offset..offset + FFT_SIZE].iter().enumerate() {
            buffer[i] = Complex32::new(sample * window[i], 0.0);
        }
        fft.process(&mut buffer);
        for (i, value) in buffer.iter().take(bins).enumerate() {
            power[i] += value.norm_sqr() as f64;
        }
        frames += 1;
        offset += HOP_SIZE;
    }

    // Short inputs: analyze one zero-padded frame
    if frames == 0 {
        for (i, sample) in samples.iter().take(FFT_SIZE).enumerate() {
            buffer[i] = Complex32::new(sample * window[i], 0.0);
        }
        for slot in buffer.iter_mut().skip(samples.len().min(FFT_SIZE)) {
            *slot = Complex32::new(0.0, 0.0);
        }
        fft.process(&mut buffer);
        for (i, value) in buffer.iter().take(bins).enumerate() {
            power[i] += value.norm_sqr() as f64;
        }
        frames = 1;
    }

    let freq_hz: Vec<f32> = (0..bins)
        .map(|i| i as f32 * sample_rate as f32 / FFT_SIZE as f32)
        .collect();

    // Full-scale sine normalization: |X_peak| = A * window_sum / 2
    let level_db: Vec<f32> = power
        .iter()
        .map(|p| {
            let avg = (p / frames as f64).sqrt() as f32;
            let amplitude = 2.0 * avg / window_sum;
            if amplitude <= 0.0 {
                LEVEL_FLOOR_DB
            } else {
                (20.0 * amplitude.log10()).max(LEVEL_FLOOR_DB)
            }
        })
        .collect();

    (freq_hz, level_db, frames)
}

/// Average each bin's level over its `fraction`-octave neighborhood
/// (dB domain).
pub fn smooth_octave_fraction(freq_hz: &[f32], level_db: &[f32], fraction: f64) -> Vec<f32> {
    let half = (2.0f64).powf(fraction / 2.0) as f32;
    let mut out = Vec::with_capacity(level_db.len());

    let mut lo = 0usize;
    let mut hi = 0usize;
    for (i, &f) in freq_hz.iter().enumerate() {
        if f <= 0.0 {
            out.push(level_db[i]);
            continue;
        }
        let f_lo = f / half;
        let f_hi = f * half;
        while lo < freq_hz.len() && freq_hz[lo] < f_lo {
            lo += 1;
        }
        if hi < lo {
            hi = lo;
        }
        while hi < freq_hz.len() && freq_hz[hi] <= f_hi {
            hi += 1;
        }
        let slice = &level_db[lo..hi.max(lo + 1).min(level_db.len())];
        let avg = slice.iter().copied().sum::<f32>() / slice.len() as f32;
        out.push(avg);
    }
    out
}

/// Highest frequency still within 60 dB of the peak level (DC excluded).
/// 0 means the curve never drops off ("full").
pub fn calculate_bandwidth(freq_hz: &[f32], level_db: &[f32]) -> i32 {
    if freq_hz.is_empty() || level_db.is_empty() {
        return 0;
    }

    let mut peak_level = f32::MIN;
    for &level in level_db.iter().skip(1) {
        if level > peak_level {
            peak_level = level;
        }
    }

    let threshold = peak_level - 60.0;
    for i in (0..level_db.len()).rev() {
        if level_db[i] > threshold {
            return freq_hz.get(i).map(|f| *f as i32).unwrap_or(0);
        }
    }
    0
}

/// Quality tier promised by the container/probe metadata alone.
pub fn derive_expected_quality(bit_depth: Option<i32>, sample_rate: i32, codec: &str) -> String {
    match bit_depth {
        Some(depth) if depth >= 24 && sample_rate >= 88200 => {
            "Hi-Res (24-bit/88kHz+)".to_string()
        }
        Some(depth) if depth >= 24 => "Studio (24-bit)".to_string(),
        Some(16) if sample_rate >= 44100 => "CD Quality (16-bit/44.1kHz)".to_string(),
        _ => {
            if matches!(codec, "mp3" | "aac" | "opus" | "vorbis") {
                "Lossy".to_string()
            } else {
                "Lossless".to_string()
            }
        }
    }
}

/// Quality tier the measured spectrum actually supports.
pub fn classify_detected_quality(bandwidth_hz: i32, nyquist_hz: i32) -> (String, String) {
    if bandwidth_hz == 0 || bandwidth_hz >= nyquist_hz - 1000 {
        return (
            "Full Bandwidth".to_string(),
            "Spectrum extends to Nyquist limit".to_string(),
        );
    }
    if bandwidth_hz < 16000 {
        return (
            "Possible Transcode".to_string(),
            format!(
                "Bandwidth limited to {} Hz (possible lossy source)",
                bandwidth_hz
            ),
        );
    }
    if bandwidth_hz < 20000 {
        return (
            "Bandwidth Limited".to_string(),
            format!("Bandwidth {} Hz (may indicate compression)", bandwidth_hz),
        );
    }
    ("Good".to_string(), format!("Bandwidth {} Hz", bandwidth_hz))
}
