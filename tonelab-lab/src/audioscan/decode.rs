//! Decode shim: retry-capable external decoder invocation
//!
//! Network filesystems drop out mid-read. Every decoder call checks that
//! the input is still stat-able, runs through the [`CommandRunner`]
//! capability, and retries on the known-transient stderr patterns with
//! doubling backoff (1 s initial, 16 s cap, 5 attempts).
//!
//! Also hosts the per-frame metadata parser shared by the astats and
//! aphasemeter based modules.

use crate::tools::{CommandRunner, ToolOutput};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::{Error, Result};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(16);
const DECODE_TIMEOUT: Duration = Duration::from_secs(600);

/// stderr fragments that indicate a transient filesystem or network
/// condition worth retrying.
pub const RETRYABLE_STDERR_PATTERNS: &[&str] = &[
    "No such file or directory",
    "Input/output error",
    "Stale file handle",
    "Resource temporarily unavailable",
    "Connection timed out",
    "Transport endpoint is not connected",
    "Network is unreachable",
    "Permission denied",
];

pub fn is_retryable_stderr(stderr: &str) -> bool {
    RETRYABLE_STDERR_PATTERNS
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

pub struct DecodeShim {
    runner: Arc<dyn CommandRunner>,
    ffmpeg_path: String,
}

impl DecodeShim {
    pub fn new(runner: Arc<dyn CommandRunner>, ffmpeg_path: String) -> Self {
        Self { runner, ffmpeg_path }
    }

    /// Run ffmpeg with `args` against `input`, retrying transient
    /// failures. A persistent non-zero exit surfaces as `Tool` with the
    /// stderr tail attached.
    pub async fn run_ffmpeg(
        &self,
        input: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(Error::Tool("decode cancelled".to_string()));
            }

            // The input may briefly vanish while an NFS mount re-attaches.
            if std::fs::metadata(input).is_err() {
                last_error = format!("input not stat-able: {}", input.display());
                tracing::warn!(
                    input = %input.display(),
                    attempt,
                    "Input not stat-able, waiting before retry"
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                continue;
            }

            match self
                .runner
                .run(&self.ffmpeg_path, args, DECODE_TIMEOUT, cancel)
                .await
            {
                Ok(output) if output.success() => return Ok(output),
                Ok(output) => {
                    let retryable = is_retryable_stderr(&output.stderr);
                    last_error = format!(
                        "ffmpeg exited with {}: {}",
                        output.exit_code,
                        crate::probe::stderr_tail(&output.stderr)
                    );
                    if !retryable || attempt == MAX_ATTEMPTS {
                        return Err(Error::Tool(last_error));
                    }
                    tracing::warn!(
                        input = %input.display(),
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        "Transient decode failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(e) => {
                    // Spawn/timeout/cancel errors from the runner are not
                    // pattern-matchable; treat as terminal.
                    return Err(e);
                }
            }
        }

        Err(Error::Tool(format!(
            "decode failed after {} attempts: {}",
            MAX_ATTEMPTS, last_error
        )))
    }
}

/// One per-frame metadata block from `ametadata=print:file=-`
#[derive(Debug, Clone, Default)]
pub struct FrameMeta {
    pub pts_time: f64,
    pub values: HashMap<String, f64>,
}

/// Parse the `ametadata=print` stream:
///
/// ```text
/// frame:12   pts:12288   pts_time:0.278639
/// lavfi.astats.1.Peak_level=-6.020600
/// lavfi.astats.2.Peak_level=-6.020600
/// ```
///
/// `-inf` values map to -120 so silence stays plottable.
pub fn parse_frame_metadata(stdout: &str) -> Vec<FrameMeta> {
    let mut frames = Vec::new();
    let mut current: Option<FrameMeta> = None;

    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with("frame:") {
            if let Some(frame) = current.take() {
                frames.push(frame);
            }
            let pts_time = line
                .split_whitespace()
                .find_map(|field| field.strip_prefix("pts_time:"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0);
            current = Some(FrameMeta {
                pts_time,
                values: HashMap::new(),
            });
        } else if let Some((key, value)) = line.split_once('=') {
            if let Some(frame) = current.as_mut() {
                let parsed = match value.trim() {
                    "-inf" => Some(-120.0),
                    "inf" | "nan" | "-nan" => None,
                    v => v.parse().ok(),
                };
                if let Some(v) = parsed {
                    frame.values.insert(key.to_string(), v);
                }
            }
        }
    }
    if let Some(frame) = current.take() {
        frames.push(frame);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retryable_patterns_match() {
        assert!(is_retryable_stderr("read error: Stale file handle"));
        assert!(is_retryable_stderr("/mnt/nas/a.flac: Input/output error"));
        assert!(is_retryable_stderr("Connection timed out"));
        assert!(!is_retryable_stderr("Invalid data found when processing input"));
    }

    #[test]
    fn frame_metadata_parses_blocks() {
        let stdout = "\
frame:0    pts:0       pts_time:0
lavfi.astats.1.Peak_level=-6.0206
lavfi.astats.2.Peak_level=-7.5
frame:1    pts:1024    pts_time:0.023220
lavfi.astats.1.Peak_level=-inf
lavfi.astats.2.Peak_level=-5.1
lavfi.aphasemeter.phase=0.930000
";
        let frames = parse_frame_metadata(stdout);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].pts_time, 0.0);
        assert_eq!(frames[0].values["lavfi.astats.1.Peak_level"], -6.0206);
        assert!((frames[1].pts_time - 0.02322).abs() < 1e-6);
        // -inf mapped to -120
        assert_eq!(frames[1].values["lavfi.astats.1.Peak_level"], -120.0);
        assert_eq!(frames[1].values["lavfi.aphasemeter.phase"], 0.93);
    }

    struct FlakyRunner {
        calls: AtomicU32,
        fail_times: u32,
        stderr: &'static str,
    }

    #[async_trait]
    impl CommandRunner for FlakyRunner {
        async fn run(
            &self,
            _program: &str,
            _args: &[String],
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<ToolOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Ok(ToolOutput {
                    exit_code: 1,
                    stdout: Vec::new(),
                    stderr: self.stderr.to_string(),
                })
            } else {
                Ok(ToolOutput {
                    exit_code: 0,
                    stdout: b"ok".to_vec(),
                    stderr: String::new(),
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_stderr_then_succeeds() {
        let runner = Arc::new(FlakyRunner {
            calls: AtomicU32::new(0),
            fail_times: 2,
            stderr: "av_read_frame: Stale file handle",
        });
        let shim = DecodeShim::new(runner.clone(), "ffmpeg".to_string());

        // Use a path that definitely exists for the stat check
        let output = shim
            .run_ffmpeg(Path::new("/"), &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_surfaces_immediately() {
        let runner = Arc::new(FlakyRunner {
            calls: AtomicU32::new(0),
            fail_times: u32::MAX,
            stderr: "Invalid data found when processing input",
        });
        let shim = DecodeShim::new(runner.clone(), "ffmpeg".to_string());

        let err = shim
            .run_ffmpeg(Path::new("/"), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with 1"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_exhausts_attempts() {
        let runner = Arc::new(FlakyRunner {
            calls: AtomicU32::new(0),
            fail_times: u32::MAX,
            stderr: "Input/output error",
        });
        let shim = DecodeShim::new(runner.clone(), "ffmpeg".to_string());

        let err = shim
            .run_ffmpeg(Path::new("/"), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Input/output error"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 5);
    }
}
