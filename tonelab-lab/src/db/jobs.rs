//! Job queue persistence
//!
//! Claiming is a single UPDATE with a nested SELECT, so concurrent
//! claimants always receive distinct jobs: at most one worker ever
//! observes a given job as `running`.

use crate::models::{status, Job};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tonelab_common::{Error, Result};
use uuid::Uuid;

/// Fields supplied when enqueueing work
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub target_type: String,
    pub target_id: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub payload_json: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

impl NewJob {
    pub fn analyze(media_file_id: &str) -> Self {
        Self {
            job_type: crate::models::job_type::ANALYZE.to_string(),
            target_type: "media_file".to_string(),
            target_id: media_file_id.to_string(),
            priority: 0,
            max_attempts: 3,
            payload_json: None,
            scheduled_at: Utc::now(),
        }
    }

    pub fn audioscan(track_id: &str) -> Self {
        Self {
            job_type: crate::models::job_type::AUDIOSCAN.to_string(),
            target_type: "track".to_string(),
            target_id: track_id.to_string(),
            priority: 0,
            max_attempts: 3,
            payload_json: None,
            scheduled_at: Utc::now(),
        }
    }
}

pub async fn create_job(pool: &SqlitePool, new: NewJob) -> Result<Job> {
    let job = Job {
        id: Uuid::new_v4().to_string(),
        job_type: new.job_type,
        target_type: new.target_type,
        target_id: new.target_id,
        status: status::QUEUED.to_string(),
        priority: new.priority,
        attempts: 0,
        max_attempts: new.max_attempts,
        last_error: None,
        payload_json: new.payload_json,
        scheduled_at: new.scheduled_at,
        started_at: None,
        finished_at: None,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO jobs
         (id, job_type, target_type, target_id, status, priority, attempts, max_attempts,
          payload_json, scheduled_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.id)
    .bind(&job.job_type)
    .bind(&job.target_type)
    .bind(&job.target_id)
    .bind(&job.status)
    .bind(job.priority)
    .bind(job.attempts)
    .bind(job.max_attempts)
    .bind(&job.payload_json)
    .bind(job.scheduled_at)
    .bind(job.created_at)
    .execute(pool)
    .await?;

    Ok(job)
}

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Job> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", id)))
}

/// Atomically claim the next due job of `job_type`: highest priority
/// first, oldest schedule first. Returns `None` when nothing is due.
pub async fn claim_next_job(pool: &SqlitePool, job_type: &str) -> Result<Option<Job>> {
    let now = Utc::now();
    let job = sqlx::query_as::<_, Job>(
        "UPDATE jobs SET status = 'running', started_at = ?
         WHERE id = (
             SELECT id FROM jobs
             WHERE job_type = ? AND status = 'queued' AND scheduled_at <= ?
             ORDER BY priority DESC, scheduled_at ASC
             LIMIT 1
         ) AND status = 'queued'
         RETURNING *",
    )
    .bind(now)
    .bind(job_type)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(job)
}

/// Persist a job's mutable state after processing. Worker updates race
/// scanner writes for the single SQLite writer, so lock errors retry.
pub async fn update_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    crate::db::retry::retry_on_lock("job update", 5000, || async {
        let result = sqlx::query(
            "UPDATE jobs SET
                 status = ?, attempts = ?, last_error = ?, scheduled_at = ?, started_at = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(&job.status)
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    })
    .await
}

pub async fn list_jobs(
    pool: &SqlitePool,
    status_filter: Option<&str>,
    limit: i64,
) -> Result<Vec<Job>> {
    let jobs = match status_filter {
        Some(s) => {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(s)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(jobs)
}

/// True when a queued or running job of `job_type` already targets the
/// entity, so the scanner does not enqueue duplicates.
pub async fn has_pending_job(pool: &SqlitePool, job_type: &str, target_id: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs
         WHERE job_type = ? AND target_id = ? AND status IN ('queued', 'running')",
    )
    .bind(job_type)
    .bind(target_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Startup reaper: jobs stranded in `running` by a crash go back to
/// `queued` for immediate re-claim.
pub async fn reset_stranded_jobs(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs SET status = 'queued', started_at = NULL, scheduled_at = ?
         WHERE status = 'running'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::models::job_type;

    #[tokio::test]
    async fn claim_takes_highest_priority_then_oldest() {
        let pool = connect_in_memory().await.unwrap();

        let old = Utc::now() - chrono::Duration::minutes(10);
        let mut low = NewJob::analyze("file-low");
        low.scheduled_at = old;
        create_job(&pool, low).await.unwrap();

        let mut high = NewJob::analyze("file-high");
        high.priority = 5;
        create_job(&pool, high).await.unwrap();

        let first = claim_next_job(&pool, job_type::ANALYZE).await.unwrap().unwrap();
        assert_eq!(first.target_id, "file-high");
        assert_eq!(first.status, status::RUNNING);
        assert!(first.started_at.is_some());

        let second = claim_next_job(&pool, job_type::ANALYZE).await.unwrap().unwrap();
        assert_eq!(second.target_id, "file-low");

        assert!(claim_next_job(&pool, job_type::ANALYZE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_future_scheduled_jobs() {
        let pool = connect_in_memory().await.unwrap();

        let mut job = NewJob::analyze("file-later");
        job.scheduled_at = Utc::now() + chrono::Duration::minutes(5);
        create_job(&pool, job).await.unwrap();

        assert!(claim_next_job(&pool, job_type::ANALYZE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_filters_by_type() {
        let pool = connect_in_memory().await.unwrap();
        create_job(&pool, NewJob::audioscan("track-1")).await.unwrap();

        assert!(claim_next_job(&pool, job_type::ANALYZE).await.unwrap().is_none());
        assert!(claim_next_job(&pool, job_type::AUDIOSCAN)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn pending_job_dedup() {
        let pool = connect_in_memory().await.unwrap();
        create_job(&pool, NewJob::analyze("file-1")).await.unwrap();

        assert!(has_pending_job(&pool, job_type::ANALYZE, "file-1").await.unwrap());
        assert!(!has_pending_job(&pool, job_type::ANALYZE, "file-2").await.unwrap());

        // Still pending while running
        claim_next_job(&pool, job_type::ANALYZE).await.unwrap().unwrap();
        assert!(has_pending_job(&pool, job_type::ANALYZE, "file-1").await.unwrap());
    }

    #[tokio::test]
    async fn reaper_requeues_running_jobs() {
        let pool = connect_in_memory().await.unwrap();
        create_job(&pool, NewJob::analyze("file-1")).await.unwrap();
        claim_next_job(&pool, job_type::ANALYZE).await.unwrap().unwrap();

        let reset = reset_stranded_jobs(&pool).await.unwrap();
        assert_eq!(reset, 1);

        let job = claim_next_job(&pool, job_type::ANALYZE).await.unwrap().unwrap();
        assert_eq!(job.target_id, "file-1");
    }
}
