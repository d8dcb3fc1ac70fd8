//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::Result;
use tonelab_lab::db;
use tonelab_lab::db::libraries::NewLibrary;
use tonelab_lab::models::Track;
use tonelab_lab::tools::{CommandRunner, ToolOutput};

/// Handler inspects (program, args) and either claims the invocation or
/// passes.
pub type Handler =
    Box<dyn Fn(&str, &[String]) -> Option<Result<ToolOutput>> + Send + Sync>;

/// Scripted command runner: the decode-wrapper mock seam. Handlers are
/// tried in order; an unhandled invocation fails the test loudly.
pub struct FakeRunner {
    handlers: Vec<Handler>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn handle(
        mut self,
        handler: impl Fn(&str, &[String]) -> Option<Result<ToolOutput>> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn into_arc(self) -> Arc<dyn CommandRunner> {
        Arc::new(self)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        for handler in &self.handlers {
            if let Some(result) = handler(program, args) {
                return result;
            }
        }
        panic!("unhandled tool invocation: {} {:?}", program, args);
    }
}

pub fn ok_output(stdout: Vec<u8>, stderr: &str) -> Result<ToolOutput> {
    Ok(ToolOutput {
        exit_code: 0,
        stdout,
        stderr: stderr.to_string(),
    })
}

pub fn failed_output(exit_code: i32, stderr: &str) -> Result<ToolOutput> {
    Ok(ToolOutput {
        exit_code,
        stdout: Vec::new(),
        stderr: stderr.to_string(),
    })
}

/// True when the invocation's filter argument contains `needle`.
pub fn args_contain(args: &[String], needle: &str) -> bool {
    args.iter().any(|a| a.contains(needle))
}

pub async fn test_library(pool: &SqlitePool, root_path: &str) -> String {
    db::libraries::create_library(
        pool,
        NewLibrary {
            name: "Test Library".to_string(),
            root_path: root_path.to_string(),
            scan_interval: "15m".to_string(),
            read_only: true,
            output_path: None,
            allowed_formats: None,
        },
    )
    .await
    .unwrap()
    .id
}

/// Library + media file + track rows pointing at `path` on disk.
pub async fn seed_track(pool: &SqlitePool, path: &str, channels: i32) -> Track {
    let parent = std::path::Path::new(path)
        .parent()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let library_id = test_library(pool, &parent).await;
    let file = db::media_files::create_media_file(pool, &library_id, path, 1_000_000, Utc::now())
        .await
        .unwrap();

    let mut track = Track {
        media_file_id: file.id,
        duration: 10.0,
        codec: "flac".to_string(),
        sample_rate: 44100,
        bit_depth: 16,
        channels,
        bitrate: 900_000,
        title: Some("Old".to_string()),
        artist: Some("Artist".to_string()),
        album: Some("Album".to_string()),
        ..Default::default()
    };
    db::tracks::create_track(pool, &mut track).await.unwrap();
    db::tracks::get_track(pool, &track.id).await.unwrap()
}
