//! Worker pool
//!
//! N workers poll the durable queue on a fixed interval, claim at most
//! one job each, dispatch by job type and drive the retry ladder:
//! `min(2^attempts minutes, 1 hour)` between attempts, terminal `failed`
//! once `max_attempts` is reached.

use crate::db;
use crate::jobs::logger::JobLogBuffer;
use crate::models::{job_type, status, Job};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::Result;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_UNIT_SECS: u64 = 60;
const BACKOFF_CAP_SECS: u64 = 3600;

/// Executes one claimed job. Implementations receive the buffer so they
/// can bind a per-job logger for verbose module output.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn execute(
        &self,
        job: &Job,
        log_buffer: &Arc<JobLogBuffer>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

pub struct WorkerPool {
    db: SqlitePool,
    dispatcher: Arc<dyn JobDispatcher>,
    log_buffer: Arc<JobLogBuffer>,
    worker_count: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        db: SqlitePool,
        dispatcher: Arc<dyn JobDispatcher>,
        log_buffer: Arc<JobLogBuffer>,
        worker_count: usize,
    ) -> Self {
        Self {
            db,
            dispatcher,
            log_buffer,
            worker_count: worker_count.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Shorten the poll interval; used by tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn log_buffer(&self) -> Arc<JobLogBuffer> {
        Arc::clone(&self.log_buffer)
    }

    /// Reset jobs stranded in `running` by a previous crash, then spawn
    /// the workers and wait for all of them to stop after `cancel` fires.
    /// No new jobs are claimed after the stop signal; in-flight jobs run
    /// to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        match db::jobs::reset_stranded_jobs(&self.db).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(count = n, "Requeued jobs stranded by previous shutdown"),
            Err(e) => tracing::error!(error = %e, "Failed to reap stranded jobs"),
        }

        tracing::info!(workers = self.worker_count, "Starting job workers");

        let mut handles = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let db = self.db.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let log_buffer = Arc::clone(&self.log_buffer);
            let cancel = cancel.clone();
            let poll_interval = self.poll_interval;

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, db, dispatcher, log_buffer, cancel, poll_interval).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Job workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    db: SqlitePool,
    dispatcher: Arc<dyn JobDispatcher>,
    log_buffer: Arc<JobLogBuffer>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    tracing::debug!(worker_id, "Worker started");
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(worker_id, "Worker stopping");
                return;
            }
            _ = ticker.tick() => {
                // Drain everything currently due before sleeping again.
                while process_next_job(worker_id, &db, &dispatcher, &log_buffer, &cancel).await {
                    if cancel.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }
}

/// Claim and process one job. Returns true when a job was processed.
async fn process_next_job(
    worker_id: usize,
    db: &SqlitePool,
    dispatcher: &Arc<dyn JobDispatcher>,
    log_buffer: &Arc<JobLogBuffer>,
    cancel: &CancellationToken,
) -> bool {
    let mut job = None;
    for claim_type in [job_type::ANALYZE, job_type::AUDIOSCAN] {
        match db::jobs::claim_next_job(db, claim_type).await {
            Ok(Some(claimed)) => {
                job = Some(claimed);
                break;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Failed to claim next job");
                return false;
            }
        }
    }
    let Some(mut job) = job else {
        return false;
    };

    tracing::info!(
        worker_id,
        job_id = %job.id,
        job_type = %job.job_type,
        target = %job.target_id,
        attempt = job.attempts + 1,
        "Processing job"
    );
    log_buffer.start_job(&job.id, &job.target_id);

    let result = dispatcher.execute(&job, log_buffer, cancel).await;

    job.attempts += 1;
    match result {
        Ok(()) => {
            job.status = status::SUCCESS.to_string();
            job.finished_at = Some(Utc::now());
            log_buffer.end_job(&job.id, true, "");
            tracing::info!(job_id = %job.id, "Job completed");
        }
        Err(e) => {
            let message = e.to_string();
            job.last_error = Some(message.clone());
            log_buffer.end_job(&job.id, false, &message);

            if job.attempts >= job.max_attempts {
                job.status = status::FAILED.to_string();
                job.finished_at = Some(Utc::now());
                tracing::error!(job_id = %job.id, error = %message, "Job failed permanently");
            } else {
                let backoff = retry_backoff(job.attempts);
                job.status = status::QUEUED.to_string();
                job.scheduled_at = Utc::now()
                    + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::hours(1));
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %message,
                    "Job failed, scheduled for retry"
                );
            }
        }
    }

    if let Err(e) = db::jobs::update_job(db, &job).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to persist job state");
    }
    true
}

/// Production dispatcher: routes `analyze` to the first-pass analyzer
/// and `audioscan` to the deep pipeline with a buffer-bound logger.
/// `convert` jobs are not claimed by this pool; their executor is an
/// external collaborator.
pub struct LabDispatcher {
    analyzer: Arc<crate::analyzer::Analyzer>,
    audioscan: Arc<crate::audioscan::AudioScanner>,
}

impl LabDispatcher {
    pub fn new(
        analyzer: Arc<crate::analyzer::Analyzer>,
        audioscan: Arc<crate::audioscan::AudioScanner>,
    ) -> Self {
        Self {
            analyzer,
            audioscan,
        }
    }
}

#[async_trait]
impl JobDispatcher for LabDispatcher {
    async fn execute(
        &self,
        job: &Job,
        log_buffer: &Arc<JobLogBuffer>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match job.job_type.as_str() {
            job_type::ANALYZE => self.analyzer.analyze_file(&job.target_id, cancel).await,
            job_type::AUDIOSCAN => {
                let logger =
                    crate::jobs::BufferLogger::new(Arc::clone(log_buffer), job.id.clone());
                self.audioscan
                    .scan_track(&job.target_id, &logger, cancel)
                    .await
            }
            other => Err(tonelab_common::Error::InvalidInput(format!(
                "unknown job type {:?}",
                other
            ))),
        }
    }
}

/// Backoff before retry `attempts + 1`: doubles per attempt, capped at
/// one hour. The cap also guards the shift against overflow.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exp = attempts.clamp(0, 20) as u32;
    let secs = BACKOFF_UNIT_SECS
        .saturating_mul(1u64 << exp)
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}
