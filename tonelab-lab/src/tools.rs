//! External tool invocation
//!
//! Every ffprobe/ffmpeg call goes through the [`CommandRunner`]
//! capability. It is the single chokepoint that deals with external
//! processes, so tests swap in a scripted implementation to inject exit
//! codes, stderr patterns and delays without any real decoding.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::{Error, Result};

/// Captured output of one tool invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Replaceable process-spawning capability
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing stdout and stderr. The call
    /// is aborted (process killed) when `cancel` fires or `timeout`
    /// elapses. A non-zero exit is NOT an error at this layer; callers
    /// inspect [`ToolOutput::exit_code`].
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput>;
}

/// Spawns real processes via tokio
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        tracing::debug!(program, ?args, "Running external tool");

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tool(format!("spawn {}: {}", program, e)))?;

        let wait = async {
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| Error::Tool(format!("wait {}: {}", program, e)))?;
            Ok::<_, Error>(ToolOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        };

        tokio::select! {
            result = wait => result,
            _ = cancel.cancelled() => {
                Err(Error::Tool(format!("{} cancelled", program)))
            }
            _ = tokio::time::sleep(timeout) => {
                Err(Error::Tool(format!(
                    "{} timed out after {}s",
                    program,
                    timeout.as_secs()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = SystemRunner;
        let output = runner
            .run(
                "sh",
                &["-c".to_string(), "echo hello; exit 3".to_string()],
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stdout_str().trim(), "hello");
    }

    #[tokio::test]
    async fn missing_binary_is_a_tool_error() {
        let runner = SystemRunner;
        let err = runner
            .run(
                "definitely-not-a-real-binary",
                &[],
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let runner = SystemRunner;
        let err = runner
            .run(
                "sh",
                &["-c".to_string(), "sleep 30".to_string()],
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_call() {
        let runner = SystemRunner;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner
            .run(
                "sh",
                &["-c".to_string(), "sleep 30".to_string()],
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
