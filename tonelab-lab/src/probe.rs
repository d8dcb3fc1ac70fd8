//! Media probing
//!
//! Runs the external prober (ffprobe) and derives track fields from its
//! JSON output. Field policy:
//! - bit depth: bits_per_sample, then bits_per_raw_sample, then
//!   bits_per_coded_sample; flac/alac default to 16 when all are absent
//! - tags are matched case-insensitively with the lowercase form
//!   preferred; track/disc numbers keep the numerator of "n/total";
//!   year is the leading 4-digit integer of date/DATE/year
//! - artwork is present iff a video stream carries attached_pic

use crate::models::Track;
use crate::tools::CommandRunner;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProbeResult {
    #[serde(default)]
    pub format: ProbeFormat,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProbeFormat {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub format_name: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub bit_rate: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProbeStream {
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub codec_type: String,
    #[serde(default)]
    pub codec_name: String,
    #[serde(default)]
    pub sample_rate: String,
    #[serde(default)]
    pub channels: i32,
    #[serde(default)]
    pub bits_per_sample: i32,
    #[serde(default)]
    pub bits_per_raw_sample: String,
    #[serde(default)]
    pub bits_per_coded_sample: i32,
    #[serde(default)]
    pub bit_rate: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub disposition: HashMap<String, i32>,
}

impl ProbeResult {
    pub fn audio_stream(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|s| s.codec_type == "audio")
    }

    pub fn has_attached_pic(&self) -> bool {
        self.streams
            .iter()
            .filter(|s| s.codec_type == "video")
            .any(|s| s.disposition.get("attached_pic") == Some(&1))
    }
}

/// ffprobe client
pub struct Prober {
    runner: std::sync::Arc<dyn CommandRunner>,
    ffprobe_path: String,
}

impl Prober {
    pub fn new(runner: std::sync::Arc<dyn CommandRunner>, ffprobe_path: String) -> Self {
        Self {
            runner,
            ffprobe_path,
        }
    }

    /// Probe `path`. A non-zero exit or unparseable JSON is an error the
    /// caller persists against the media file.
    pub async fn probe(&self, path: &str, cancel: &CancellationToken) -> Result<ProbeResult> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            path.to_string(),
        ];

        let output = self
            .runner
            .run(&self.ffprobe_path, &args, PROBE_TIMEOUT, cancel)
            .await?;

        if !output.success() {
            return Err(Error::Tool(format!(
                "ffprobe exited with {}: {}",
                output.exit_code,
                stderr_tail(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Parse(format!("ffprobe output: {}", e)))
    }
}

/// Apply probe output to a track's structural and tag fields.
pub fn apply_probe_to_track(track: &mut Track, probe: &ProbeResult) {
    if let Some(stream) = probe.audio_stream() {
        track.codec = stream.codec_name.clone();
        if let Ok(rate) = stream.sample_rate.parse() {
            track.sample_rate = rate;
        }
        track.channels = stream.channels;
        track.bit_depth = derive_bit_depth(stream);
        if let Ok(bitrate) = stream.bit_rate.parse() {
            track.bitrate = bitrate;
        }
        if let Ok(duration) = stream.duration.parse() {
            track.duration = duration;
        }
    }

    if track.duration == 0.0 {
        if let Ok(duration) = probe.format.duration.parse() {
            track.duration = duration;
        }
    }
    if track.bitrate == 0 {
        if let Ok(bitrate) = probe.format.bit_rate.parse() {
            track.bitrate = bitrate;
        }
    }

    apply_tags(track, &probe.format.tags);
    track.has_artwork = probe.has_attached_pic();
}

fn derive_bit_depth(stream: &ProbeStream) -> i32 {
    if stream.bits_per_sample > 0 {
        return stream.bits_per_sample;
    }
    if let Ok(raw) = stream.bits_per_raw_sample.parse::<i32>() {
        if raw > 0 {
            return raw;
        }
    }
    if stream.bits_per_coded_sample > 0 {
        return stream.bits_per_coded_sample;
    }
    if stream.codec_name == "flac" || stream.codec_name == "alac" {
        return 16;
    }
    0
}

fn apply_tags(track: &mut Track, tags: &HashMap<String, String>) {
    if let Some(v) = tag_value(tags, "title") {
        track.title = Some(v);
    }
    if let Some(v) = tag_value(tags, "artist") {
        track.artist = Some(v);
    }
    if let Some(v) = tag_value(tags, "album") {
        track.album = Some(v);
    }
    if let Some(v) = tag_value(tags, "album_artist").or_else(|| tag_value(tags, "albumartist")) {
        track.album_artist = Some(v);
    }
    if let Some(v) = tag_value(tags, "genre") {
        track.genre = Some(v);
    }

    if let Some(v) = tag_value(tags, "track").or_else(|| tag_value(tags, "tracknumber")) {
        if let Some(n) = parse_numerator(&v) {
            track.track_number = Some(n);
        }
    }
    if let Some(v) = tag_value(tags, "disc").or_else(|| tag_value(tags, "discnumber")) {
        if let Some(n) = parse_numerator(&v) {
            track.disc_number = Some(n);
        }
    }
    if let Some(v) = tag_value(tags, "date").or_else(|| tag_value(tags, "year")) {
        if let Some(y) = parse_year(&v) {
            track.year = Some(y);
        }
    }
}

/// Case-insensitive tag lookup, preferring the exact lowercase key.
fn tag_value(tags: &HashMap<String, String>, key: &str) -> Option<String> {
    if let Some(v) = tags.get(key) {
        if !v.is_empty() {
            return Some(v.clone());
        }
    }
    tags.iter()
        .find(|(k, v)| k.to_lowercase() == key && !v.is_empty())
        .map(|(_, v)| v.clone())
}

/// "3/12" → 3; "7" → 7
fn parse_numerator(s: &str) -> Option<i32> {
    let s = s.trim();
    let head = s.split('/').next().unwrap_or(s);
    head.parse().ok().filter(|n| *n > 0)
}

/// Leading 4-digit integer: "1994-05-02" → 1994
fn parse_year(s: &str) -> Option<i32> {
    let s = s.trim();
    if s.len() < 4 {
        return None;
    }
    s[..4].parse().ok().filter(|y| *y > 0)
}

/// Last few lines of a stderr blob for error messages.
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_json() -> &'static str {
        r#"{
            "format": {
                "filename": "/music/a.flac",
                "format_name": "flac",
                "duration": "183.4",
                "size": "20000000",
                "bit_rate": "872000",
                "tags": {
                    "TITLE": "Uppercase Title",
                    "artist": "Artist",
                    "album": "Album",
                    "ALBUMARTIST": "Various",
                    "track": "3/12",
                    "disc": "1/2",
                    "date": "1994-05-02",
                    "genre": "Jazz"
                }
            },
            "streams": [
                {
                    "index": 0,
                    "codec_type": "audio",
                    "codec_name": "flac",
                    "sample_rate": "44100",
                    "channels": 2,
                    "bits_per_raw_sample": "16",
                    "duration": "183.4"
                },
                {
                    "index": 1,
                    "codec_type": "video",
                    "codec_name": "mjpeg",
                    "disposition": {"attached_pic": 1}
                }
            ]
        }"#
    }

    #[test]
    fn parses_probe_json_and_derives_fields() {
        let probe: ProbeResult = serde_json::from_str(probe_json()).unwrap();
        let mut track = Track::default();
        apply_probe_to_track(&mut track, &probe);

        assert_eq!(track.codec, "flac");
        assert_eq!(track.sample_rate, 44100);
        assert_eq!(track.channels, 2);
        assert_eq!(track.bit_depth, 16);
        assert!((track.duration - 183.4).abs() < 1e-9);
        assert_eq!(track.bitrate, 872_000);
        assert_eq!(track.title.as_deref(), Some("Uppercase Title"));
        assert_eq!(track.album_artist.as_deref(), Some("Various"));
        assert_eq!(track.track_number, Some(3));
        assert_eq!(track.disc_number, Some(1));
        assert_eq!(track.year, Some(1994));
        assert_eq!(track.genre.as_deref(), Some("Jazz"));
        assert!(track.has_artwork);
    }

    #[test]
    fn bit_depth_preference_chain() {
        let mut stream = ProbeStream {
            codec_name: "pcm_s24le".to_string(),
            bits_per_sample: 24,
            bits_per_raw_sample: "16".to_string(),
            bits_per_coded_sample: 8,
            ..Default::default()
        };
        assert_eq!(derive_bit_depth(&stream), 24);

        stream.bits_per_sample = 0;
        assert_eq!(derive_bit_depth(&stream), 16);

        stream.bits_per_raw_sample = String::new();
        assert_eq!(derive_bit_depth(&stream), 8);

        stream.bits_per_coded_sample = 0;
        assert_eq!(derive_bit_depth(&stream), 0);

        stream.codec_name = "alac".to_string();
        assert_eq!(derive_bit_depth(&stream), 16);
    }

    #[test]
    fn lossy_codec_without_bit_depth_stays_zero() {
        let stream = ProbeStream {
            codec_name: "mp3".to_string(),
            ..Default::default()
        };
        assert_eq!(derive_bit_depth(&stream), 0);
    }

    #[test]
    fn lowercase_tags_win_over_uppercase() {
        let mut tags = HashMap::new();
        tags.insert("title".to_string(), "lower".to_string());
        tags.insert("TITLE".to_string(), "UPPER".to_string());
        assert_eq!(tag_value(&tags, "title").as_deref(), Some("lower"));
    }

    #[test]
    fn numerators_and_years() {
        assert_eq!(parse_numerator("3/12"), Some(3));
        assert_eq!(parse_numerator(" 7 "), Some(7));
        assert_eq!(parse_numerator("0"), None);
        assert_eq!(parse_numerator("x"), None);

        assert_eq!(parse_year("1994-05-02"), Some(1994));
        assert_eq!(parse_year("2003"), Some(2003));
        assert_eq!(parse_year("94"), None);
        assert_eq!(parse_year("abcd"), None);
    }

    #[test]
    fn no_attached_pic_means_no_artwork() {
        let probe = ProbeResult {
            streams: vec![ProbeStream {
                codec_type: "video".to_string(),
                disposition: HashMap::from([("attached_pic".to_string(), 0)]),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!probe.has_attached_pic());
    }
}
