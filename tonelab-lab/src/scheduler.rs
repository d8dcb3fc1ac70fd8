//! Scan scheduler
//!
//! Polls the library set once per minute and fires a scan for every
//! library whose interval has elapsed. Libraries that never scanned get
//! their first pass one minute after creation.

use crate::db;
use crate::models::status;
use crate::scanner::Scanner;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonelab_common::duration::parse_duration;

const POLL_INTERVAL: Duration = Duration::from_secs(60);
const FALLBACK_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub struct Scheduler {
    db: SqlitePool,
    scanner: Arc<Scanner>,
}

impl Scheduler {
    pub fn new(db: SqlitePool, scanner: Arc<Scanner>) -> Self {
        Self { db, scanner }
    }

    /// Run the scheduling loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("Scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_libraries(&cancel).await;
                }
            }
        }
    }

    async fn check_libraries(&self, cancel: &CancellationToken) {
        let libraries = match db::libraries::list_libraries(&self.db).await {
            Ok(libraries) => libraries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list libraries for scheduling");
                return;
            }
        };

        let now = Utc::now();
        for library in libraries {
            if library.status == status::RUNNING || self.scanner.is_running() {
                continue;
            }

            let interval = parse_duration(&library.scan_interval)
                .unwrap_or(FALLBACK_INTERVAL);
            let interval = ChronoDuration::from_std(interval)
                .unwrap_or_else(|_| ChronoDuration::minutes(15));

            let next_scan = match library.last_scan_at {
                Some(last) => last + interval,
                None => library.created_at + ChronoDuration::minutes(1),
            };

            if now >= next_scan {
                tracing::info!(library = %library.name, "Triggering scheduled scan");
                match self.scanner.scan(&library.id, cancel).await {
                    Ok(outcome) => {
                        tracing::debug!(
                            library = %library.name,
                            new_jobs = outcome.new_job_ids.len(),
                            "Scheduled scan finished"
                        );
                    }
                    Err(e) if matches!(e, tonelab_common::Error::Conflict(_)) => {
                        tracing::debug!(library = %library.name, "Scan already running, skipping");
                    }
                    Err(e) => {
                        tracing::error!(library = %library.name, error = %e, "Scheduled scan failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_interval_is_fifteen_minutes() {
        assert_eq!(FALLBACK_INTERVAL, Duration::from_secs(900));
        // Unparseable intervals fall back rather than erroring the loop
        assert!(parse_duration("every other tuesday").is_err());
    }
}
