//! In-memory per-job log buffer
//!
//! The pool records one ring of timestamped entries per job, bounded by
//! the number of retained jobs (FIFO eviction by start order). Clients
//! poll with `get_since` and only receive entries past their cursor;
//! an evicted or unknown job is reported as absent, distinguishable
//! from an empty tail.
//!
//! Readers copy slices under a read lock; writers append under a write
//! lock. Critical sections stay short on both sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

const DEFAULT_MAX_JOBS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// info | warn | error | debug
    pub level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_id: String,
    /// running | completed | failed
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub entries: Vec<LogEntry>,
}

#[derive(Default)]
struct Inner {
    logs: HashMap<String, JobLog>,
    order: VecDeque<String>,
}

/// Thread-safe map from job id to its log entries
pub struct JobLogBuffer {
    inner: RwLock<Inner>,
    max_jobs: usize,
}

impl JobLogBuffer {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_jobs: if max_jobs == 0 {
                DEFAULT_MAX_JOBS
            } else {
                max_jobs
            },
        }
    }

    /// Begin logging for a job, evicting the oldest retained jobs when
    /// the cap is reached. Eviction is immediate: their entries are gone.
    pub fn start_job(&self, job_id: &str, target_id: &str) {
        let mut inner = self.inner.write().unwrap();

        while inner.order.len() >= self.max_jobs {
            if let Some(old_id) = inner.order.pop_front() {
                inner.logs.remove(&old_id);
            }
        }

        inner.logs.insert(
            job_id.to_string(),
            JobLog {
                job_id: job_id.to_string(),
                target_id: target_id.to_string(),
                status: "running".to_string(),
                started_at: Utc::now(),
                ended_at: None,
                entries: Vec::new(),
            },
        );
        inner.order.push_back(job_id.to_string());
        drop(inner);

        self.log(job_id, "info", "", "Job started", "");
    }

    pub fn end_job(&self, job_id: &str, success: bool, error_msg: &str) {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(log) = inner.logs.get_mut(job_id) {
                log.ended_at = Some(Utc::now());
                log.status = if success { "completed" } else { "failed" }.to_string();
            } else {
                return;
            }
        }
        if success {
            self.log(job_id, "info", "", "Job completed successfully", "");
        } else {
            self.log(job_id, "error", "", "Job failed", error_msg);
        }
    }

    pub fn log(&self, job_id: &str, level: &str, module: &str, message: &str, details: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(log) = inner.logs.get_mut(job_id) {
            log.entries.push(LogEntry {
                timestamp: Utc::now(),
                level: level.to_string(),
                module: module.to_string(),
                message: message.to_string(),
                details: details.to_string(),
            });
        }
    }

    /// Full snapshot of one job's log.
    pub fn get_log(&self, job_id: &str) -> Option<JobLog> {
        self.inner.read().unwrap().logs.get(job_id).cloned()
    }

    /// Entries strictly after `since_index`, plus the next cursor and the
    /// job's status. `None` means the job is unknown or was evicted.
    pub fn get_since(
        &self,
        job_id: &str,
        since_index: usize,
    ) -> Option<(Vec<LogEntry>, usize, String)> {
        let inner = self.inner.read().unwrap();
        let log = inner.logs.get(job_id)?;

        let next_index = log.entries.len();
        let entries = if since_index >= next_index {
            Vec::new()
        } else {
            log.entries[since_index..].to_vec()
        };
        Some((entries, next_index, log.status.clone()))
    }

    /// Most recent jobs, newest first, without their entries.
    pub fn recent_jobs(&self, limit: usize) -> Vec<JobLog> {
        let inner = self.inner.read().unwrap();
        inner
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.logs.get(id))
            .map(|log| JobLog {
                entries: Vec::new(),
                ..log.clone()
            })
            .collect()
    }
}

/// Logging capability handed to analysis modules, bound to one job.
/// A no-op implementation serves direct test harnesses.
pub trait JobLogger: Send + Sync {
    fn info(&self, module: &str, message: &str);
    fn debug(&self, module: &str, message: &str, details: &str);
    fn warn(&self, module: &str, message: &str, details: &str);
    fn error(&self, module: &str, message: &str, details: &str);
}

/// Discards everything.
pub struct NoopLogger;

impl JobLogger for NoopLogger {
    fn info(&self, _module: &str, _message: &str) {}
    fn debug(&self, _module: &str, _message: &str, _details: &str) {}
    fn warn(&self, _module: &str, _message: &str, _details: &str) {}
    fn error(&self, _module: &str, _message: &str, _details: &str) {}
}

/// Writes into a [`JobLogBuffer`] under a fixed job id.
pub struct BufferLogger {
    buffer: Arc<JobLogBuffer>,
    job_id: String,
}

impl BufferLogger {
    pub fn new(buffer: Arc<JobLogBuffer>, job_id: String) -> Self {
        Self { buffer, job_id }
    }
}

impl JobLogger for BufferLogger {
    fn info(&self, module: &str, message: &str) {
        self.buffer.log(&self.job_id, "info", module, message, "");
    }
    fn debug(&self, module: &str, message: &str, details: &str) {
        self.buffer.log(&self.job_id, "debug", module, message, details);
    }
    fn warn(&self, module: &str, message: &str, details: &str) {
        self.buffer.log(&self.job_id, "warn", module, message, details);
    }
    fn error(&self, module: &str, message: &str, details: &str) {
        self.buffer.log(&self.job_id, "error", module, message, details);
    }
}
