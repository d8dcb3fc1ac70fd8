//! Raw series encoding
//!
//! Every module's time/frequency series is serialized as MessagePack
//! (named fields, so readers in other languages address fields by tag)
//! and compressed with Zstd at the default level. File names carry the
//! schema version: `<kind>_series_v1.msgpack.zst`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tonelab_common::{Error, Result};

pub const RAW_DATA_VERSION: i32 = 1;

/// Spectrum analysis raw data (v1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioScanCurve {
    #[serde(rename = "version")]
    pub version: i32,
    #[serde(rename = "sampleRateHz")]
    pub sample_rate_hz: i32,
    #[serde(rename = "nyquistHz")]
    pub nyquist_hz: i32,
    #[serde(rename = "analyzed")]
    pub analyzed: AnalyzedWindow,
    #[serde(rename = "fft")]
    pub fft: FftParams,
    #[serde(rename = "curve")]
    pub curve: Curve,
    #[serde(rename = "metrics")]
    pub metrics: SpectrumMetrics,
    #[serde(rename = "guides")]
    pub guides: Guides,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzedWindow {
    #[serde(rename = "startSec")]
    pub start_sec: f64,
    #[serde(rename = "durationSec")]
    pub duration_sec: f64,
    /// "mono" or "stereo-downmix"
    #[serde(rename = "channelMode")]
    pub channel_mode: String,
    #[serde(rename = "decodeFormat")]
    pub decode_format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FftParams {
    #[serde(rename = "fftSize")]
    pub fft_size: i32,
    #[serde(rename = "hopSize")]
    pub hop_size: i32,
    #[serde(rename = "window")]
    pub window: String,
    #[serde(rename = "frames")]
    pub frames: i32,
    #[serde(rename = "smoothingOctaves")]
    pub smoothing_octaves: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Curve {
    /// Ascending frequency bins
    #[serde(rename = "freqHz")]
    pub freq_hz: Vec<f32>,
    /// Corresponding dB levels
    #[serde(rename = "levelDb")]
    pub level_db: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpectrumMetrics {
    #[serde(rename = "bandwidthHz")]
    pub bandwidth_hz: i32,
    #[serde(rename = "dcMean")]
    pub dc_mean: f32,
    #[serde(rename = "dcFlag")]
    pub dc_flag: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guides {
    #[serde(rename = "verticalLinesHz")]
    pub vertical_lines_hz: Vec<i32>,
}

/// Loudness over time raw data (v1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoudnessSeries {
    #[serde(rename = "version")]
    pub version: i32,
    #[serde(rename = "windowSec")]
    pub window_sec: f64,
    #[serde(rename = "tSec")]
    pub t_sec: Vec<f32>,
    /// 400 ms integration
    #[serde(rename = "momentaryLUFS")]
    pub momentary_lufs: Vec<f32>,
    /// 3 s integration
    #[serde(rename = "shortTermLUFS")]
    pub short_term_lufs: Vec<f32>,
    /// Max across channels per frame
    #[serde(rename = "truePeakDbTP")]
    pub true_peak_dbtp: Vec<f32>,
    #[serde(rename = "samplePeakDbFS")]
    pub sample_peak_dbfs: Vec<f32>,
    #[serde(rename = "integratedLUFS")]
    pub integrated_lufs: f32,
    #[serde(rename = "lra")]
    pub lra: f32,
    #[serde(rename = "maxTruePeak")]
    pub max_true_peak: f32,
    #[serde(rename = "maxSamplePeak")]
    pub max_sample_peak: f32,
}

/// Clipping detection raw data (v1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClippingSeries {
    #[serde(rename = "version")]
    pub version: i32,
    #[serde(rename = "tSec")]
    pub t_sec: Vec<f32>,
    /// 0/1 per retained bucket
    #[serde(rename = "clippedSamples")]
    pub clipped_samples: Vec<i32>,
    /// Placeholder for true-peak overs
    #[serde(rename = "oversCount")]
    pub overs_count: Vec<i32>,
    #[serde(rename = "thresholdDbFS")]
    pub threshold_dbfs: f32,
    #[serde(rename = "totalClipped")]
    pub total_clipped: i32,
    #[serde(rename = "totalOvers")]
    pub total_overs: i32,
    #[serde(rename = "worstSectionIdx")]
    pub worst_section_idx: i32,
}

/// Phase correlation raw data (v1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseSeries {
    #[serde(rename = "version")]
    pub version: i32,
    #[serde(rename = "tSec")]
    pub t_sec: Vec<f32>,
    /// -1 .. +1
    #[serde(rename = "correlation")]
    pub correlation: Vec<f32>,
    #[serde(rename = "lrBalanceDb")]
    pub lr_balance_db: Vec<f32>,
    #[serde(rename = "minCorrelation")]
    pub min_correlation: f32,
    #[serde(rename = "avgCorrelation")]
    pub avg_correlation: f32,
    /// Signed, maximum |L-R| imbalance
    #[serde(rename = "maxImbalanceDb")]
    pub max_imbalance_db: f32,
}

/// Dynamics raw data (v1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicsSeries {
    #[serde(rename = "version")]
    pub version: i32,
    #[serde(rename = "tSec")]
    pub t_sec: Vec<f32>,
    #[serde(rename = "crestFactorDb")]
    pub crest_factor_db: Vec<f32>,
    #[serde(rename = "rmsDb")]
    pub rms_db: Vec<f32>,
    #[serde(rename = "peakDb")]
    pub peak_db: Vec<f32>,
    #[serde(rename = "drScore")]
    pub dr_score: i32,
    #[serde(rename = "avgCrestDb")]
    pub avg_crest_db: f32,
    #[serde(rename = "minCrestDb")]
    pub min_crest_db: f32,
}

/// Serialize to MessagePack, compress with Zstd, write to `path` and
/// fsync so the manifest only ever references durable bytes.
pub fn save_msgpack_zstd<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let encoded = rmp_serde::to_vec_named(data)
        .map_err(|e| Error::Internal(format!("msgpack encode: {}", e)))?;
    let compressed = zstd::encode_all(encoded.as_slice(), 0)
        .map_err(|e| Error::Internal(format!("zstd encode: {}", e)))?;

    let mut file = std::fs::File::create(path)?;
    file.write_all(&compressed)?;
    file.sync_all()?;
    Ok(())
}

/// Inverse of [`save_msgpack_zstd`].
pub fn load_msgpack_zstd<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let compressed = std::fs::read(path)?;
    let decoded = zstd::decode_all(compressed.as_slice())
        .map_err(|e| Error::Parse(format!("zstd decode: {}", e)))?;
    rmp_serde::from_slice(&decoded).map_err(|e| Error::Parse(format!("msgpack decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loudness_series_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loudness_series_v1.msgpack.zst");

        let series = LoudnessSeries {
            version: RAW_DATA_VERSION,
            window_sec: 0.1,
            t_sec: vec![0.0, 0.1, 0.2],
            momentary_lufs: vec![-120.0, -14.5, -13.9],
            short_term_lufs: vec![-120.0, -14.8, -14.1],
            true_peak_dbtp: vec![-120.0, -1.2, -0.8],
            sample_peak_dbfs: vec![-120.0, -1.2, -0.8],
            integrated_lufs: -14.2,
            lra: 6.1,
            max_true_peak: -0.8,
            max_sample_peak: -0.8,
        };
        save_msgpack_zstd(&path, &series).unwrap();

        let loaded: LoudnessSeries = load_msgpack_zstd(&path).unwrap();
        assert_eq!(loaded.t_sec, series.t_sec);
        assert_eq!(loaded.integrated_lufs, -14.2);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn named_fields_survive_in_the_wire_format() {
        let curve = AudioScanCurve {
            version: RAW_DATA_VERSION,
            sample_rate_hz: 44100,
            nyquist_hz: 22050,
            ..Default::default()
        };
        let bytes = rmp_serde::to_vec_named(&curve).unwrap();
        // Field tags are part of the encoding, not positional
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("sampleRateHz"));
        assert!(text.contains("nyquistHz"));
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.msgpack.zst");
        std::fs::write(&path, b"definitely not zstd").unwrap();

        let err = load_msgpack_zstd::<LoudnessSeries>(&path).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
