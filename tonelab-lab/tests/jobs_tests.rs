//! Queue claiming under real concurrency

mod common;

use chrono::Utc;
use std::collections::HashSet;
use tonelab_lab::db;
use tonelab_lab::db::jobs::{claim_next_job, create_job, NewJob};
use tonelab_lab::models::{job_type, status};

/// Concurrent claimants over a shared file-backed pool must each receive
/// distinct jobs: no job is ever observed `running` by two workers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_out_distinct_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let dsn = dir.path().join("queue.db").to_string_lossy().into_owned();
    let pool = db::connect(&dsn).await.unwrap();

    const JOB_COUNT: usize = 24;
    for i in 0..JOB_COUNT {
        create_job(&pool, NewJob::analyze(&format!("file-{}", i)))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match claim_next_job(&pool, job_type::ANALYZE).await {
                    Ok(Some(job)) => claimed.push(job.id),
                    Ok(None) => break,
                    Err(e) => panic!("claim failed: {}", e),
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.unwrap());
    }

    assert_eq!(all_claimed.len(), JOB_COUNT);
    let distinct: HashSet<_> = all_claimed.iter().collect();
    assert_eq!(distinct.len(), JOB_COUNT, "a job was claimed twice");

    // Everything is now running; nothing is left to claim
    let jobs = db::jobs::list_jobs(&pool, Some(status::RUNNING), 100).await.unwrap();
    assert_eq!(jobs.len(), JOB_COUNT);
    assert!(jobs.iter().all(|j| j.started_at.is_some()));
}

#[tokio::test]
async fn scheduled_ordering_prefers_priority_then_age() {
    let pool = db::connect_in_memory().await.unwrap();

    let base = Utc::now() - chrono::Duration::minutes(30);
    for (target, priority, offset_min) in [
        ("old-low", 0, 0),
        ("new-low", 0, 20),
        ("old-high", 5, 5),
        ("new-high", 5, 25),
    ] {
        let mut job = NewJob::analyze(target);
        job.priority = priority;
        job.scheduled_at = base + chrono::Duration::minutes(offset_min);
        create_job(&pool, job).await.unwrap();
    }

    let order: Vec<String> = {
        let mut order = Vec::new();
        while let Some(job) = claim_next_job(&pool, job_type::ANALYZE).await.unwrap() {
            order.push(job.target_id);
        }
        order
    };
    assert_eq!(order, vec!["old-high", "new-high", "old-low", "new-low"]);
}
