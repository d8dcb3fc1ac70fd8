//! tonelab-lab - music-library quality laboratory
//!
//! Wires the store, scheduler, scanner and worker pool together and runs
//! until interrupted. The HTTP frontend is an external collaborator; it
//! talks to the typed operations this crate exposes.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonelab_common::config::Config;
use tonelab_lab::audioscan::decode::DecodeShim;
use tonelab_lab::audioscan::AudioScanner;
use tonelab_lab::analyzer::Analyzer;
use tonelab_lab::jobs::{JobLogBuffer, LabDispatcher, WorkerPool};
use tonelab_lab::scanner::Scanner;
use tonelab_lab::scheduler::Scheduler;
use tonelab_lab::tools::SystemRunner;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tonelab-lab", about = "Music-library quality laboratory")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    info!("Starting tonelab-lab");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database.dsn);
    info!("Artifacts: {}", config.storage.artifacts_path.display());

    let pool = tonelab_lab::db::connect(&config.database.dsn).await?;
    std::fs::create_dir_all(&config.storage.artifacts_path)?;
    std::fs::create_dir_all(&config.storage.temp_path)?;

    let runner = Arc::new(SystemRunner);
    let analyzer = Arc::new(Analyzer::new(
        pool.clone(),
        runner.clone() as Arc<dyn tonelab_lab::tools::CommandRunner>,
        config.tools.ffprobe_path.clone(),
        config.tools.ffmpeg_path.clone(),
        config.storage.artifacts_path.clone(),
    ));
    let audioscan = Arc::new(AudioScanner::new(
        pool.clone(),
        DecodeShim::new(
            runner.clone() as Arc<dyn tonelab_lab::tools::CommandRunner>,
            config.tools.ffmpeg_path.clone(),
        ),
        config.storage.artifacts_path.clone(),
        config.analysis.max_duration_sec,
    ));

    let dispatcher = Arc::new(LabDispatcher::new(analyzer, audioscan));
    let log_buffer = Arc::new(JobLogBuffer::new(100));
    let worker_pool = WorkerPool::new(
        pool.clone(),
        dispatcher,
        log_buffer,
        config.scanner.worker_count,
    );

    let scanner = Arc::new(Scanner::new(pool.clone()));
    let scheduler = Scheduler::new(pool.clone(), scanner);

    let shutdown = CancellationToken::new();

    let scheduler_token = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_token).await;
    });

    let pool_token = shutdown.clone();
    let pool_handle = tokio::spawn(async move {
        worker_pool.run(pool_token).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining workers");
    shutdown.cancel();

    let _ = scheduler_handle.await;
    let _ = pool_handle.await;

    info!("tonelab-lab stopped");
    Ok(())
}
