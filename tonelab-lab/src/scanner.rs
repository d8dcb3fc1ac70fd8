//! Incremental library scanner
//!
//! Reconciles a library's on-disk tree with the media-file index and
//! enqueues analyze jobs for new and changed files. Built for network
//! filesystems that drop change events: every pass is a full walk, and
//! deletion reconciliation only happens after the walk completes so a
//! partial traversal never marks live files deleted.

use crate::db;
use crate::db::jobs::NewJob;
use crate::models::{job_type, status, MediaFile, ScanRun};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonelab_common::{Error, Result};
use walkdir::WalkDir;

/// Lower-cased extensions the scanner accepts (without the dot).
const SUPPORTED_EXTENSIONS: &[&str] = &[
    "flac", "alac", "wav", "aiff", "aif", "mp3", "m4a", "aac", "ogg", "opus", "wma", "ape",
    "wv", "dsf", "dff",
];

/// Outcome of one scan pass
#[derive(Debug)]
pub struct ScanOutcome {
    pub run: ScanRun,
    pub new_job_ids: Vec<String>,
    pub errors: Vec<String>,
}

/// Library scanner. One scan at a time across the whole process; the
/// `running` flag is the authoritative guard the scheduler honors.
pub struct Scanner {
    db: SqlitePool,
    running: Mutex<bool>,
}

impl Scanner {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            running: Mutex::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    /// Scan `library_id`, reconciling disk state against the store.
    ///
    /// Returns `Conflict` when a scan is already in progress. Walk errors
    /// are collected, counted in `files_failed`, and do not abort the run.
    pub async fn scan(
        &self,
        library_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome> {
        {
            let mut running = self.running.lock().unwrap();
            if *running {
                return Err(Error::Conflict("scan already in progress".to_string()));
            }
            *running = true;
        }

        let result = self.scan_inner(library_id, cancel).await;

        *self.running.lock().unwrap() = false;
        result
    }

    async fn scan_inner(
        &self,
        library_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome> {
        let mut library = db::libraries::get_library(&self.db, library_id).await?;
        let mut run = db::scan_runs::create_scan_run(&self.db, library_id).await?;

        tracing::info!(
            library_id = %library_id,
            root_path = %library.root_path,
            "Starting library scan"
        );

        let mut existing: HashMap<String, MediaFile> =
            db::media_files::list_media_files(&self.db, library_id)
                .await?
                .into_iter()
                .map(|f| (f.path.clone(), f))
                .collect();

        let mut found_paths: HashSet<String> = HashSet::new();
        let mut errors: Vec<String> = Vec::new();
        let mut new_job_ids: Vec<String> = Vec::new();

        let walker = WalkDir::new(&library.root_path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                // Skip dot-directories entirely (the root itself is
                // exempt); dot-files fall out of the extension filter
                // below.
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && e.file_name().to_string_lossy().starts_with('.'))
            });

        for entry in walker {
            if cancel.is_cancelled() {
                tracing::warn!(library_id = %library_id, "Scan cancelled, flushing partial run");
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    errors.push(format!("walk error: {}", e));
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase())
            else {
                continue;
            };
            if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }

            let path_str = path.to_string_lossy().into_owned();
            run.files_found += 1;
            found_paths.insert(path_str.clone());

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    errors.push(format!("stat error at {}: {}", path_str, e));
                    continue;
                }
            };
            let size = metadata.len() as i64;
            let mtime = mtime_utc(&metadata);

            match existing.get_mut(&path_str) {
                Some(file) => {
                    // Second-precision mtime comparison: network filesystems
                    // round differently across protocols.
                    if file.size == size && file.mtime.timestamp() == mtime.timestamp() {
                        continue;
                    }

                    run.files_changed += 1;
                    file.size = size;
                    file.mtime = mtime;
                    file.status = status::PENDING.to_string();
                    file.quick_hash = None;
                    if let Err(e) = db::media_files::update_media_file(&self.db, file).await {
                        errors.push(format!("update error at {}: {}", path_str, e));
                        continue;
                    }

                    // A changed file is re-analyzed, but never with a
                    // duplicate queued job.
                    match db::jobs::has_pending_job(&self.db, job_type::ANALYZE, &file.id).await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            match db::jobs::create_job(&self.db, NewJob::analyze(&file.id)).await
                            {
                                Ok(job) => new_job_ids.push(job.id),
                                Err(e) => errors.push(format!("job create error: {}", e)),
                            }
                        }
                        Err(e) => errors.push(format!("job lookup error: {}", e)),
                    }
                }
                None => {
                    run.files_new += 1;
                    match db::media_files::create_media_file(
                        &self.db, library_id, &path_str, size, mtime,
                    )
                    .await
                    {
                        Ok(file) => {
                            match db::jobs::create_job(&self.db, NewJob::analyze(&file.id)).await
                            {
                                Ok(job) => new_job_ids.push(job.id),
                                Err(e) => errors.push(format!("job create error: {}", e)),
                            }
                        }
                        Err(e) => errors.push(format!("create error at {}: {}", path_str, e)),
                    }
                }
            }
        }

        // Deletion reconciliation happens strictly after the walk, and is
        // skipped entirely on cancellation so a partial walk never marks
        // live files deleted.
        if !cancel.is_cancelled() {
            for (path, file) in existing.iter() {
                if found_paths.contains(path) || file.status == status::DELETED {
                    continue;
                }
                run.files_deleted += 1;
                if let Err(e) = db::media_files::set_media_file_status(
                    &self.db,
                    &file.id,
                    status::DELETED,
                    None,
                )
                .await
                {
                    errors.push(format!("delete-mark error at {}: {}", path, e));
                }
            }
        }

        run.files_failed = errors.len() as i32;
        run.status = if errors.is_empty() {
            status::SUCCESS.to_string()
        } else {
            status::FAILED.to_string()
        };
        run.error_msg = errors.first().cloned();
        run.finished_at = Some(Utc::now());
        db::scan_runs::update_scan_run(&self.db, &run).await?;

        library.last_scan_at = Some(Utc::now());
        library.status = status::SUCCESS.to_string();
        db::libraries::update_library(&self.db, &library).await?;

        tracing::info!(
            library_id = %library_id,
            found = run.files_found,
            new = run.files_new,
            changed = run.files_changed,
            deleted = run.files_deleted,
            failed = run.files_failed,
            "Scan completed"
        );

        Ok(ScanOutcome {
            run,
            new_job_ids,
            errors,
        })
    }
}

fn mtime_utc(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|d| Utc.timestamp_opt(d.as_secs() as i64, d.subsec_nanos()).single())
        .unwrap_or_else(Utc::now)
}

/// True when `path` has a supported audio extension.
pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_string_lossy().to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter() {
        assert!(is_supported_extension(Path::new("/a/b.flac")));
        assert!(is_supported_extension(Path::new("/a/b.FLAC")));
        assert!(is_supported_extension(Path::new("/a/b.dsf")));
        assert!(!is_supported_extension(Path::new("/a/b.txt")));
        assert!(!is_supported_extension(Path::new("/a/b")));
        assert!(!is_supported_extension(Path::new("/a/cover.jpg")));
    }
}
