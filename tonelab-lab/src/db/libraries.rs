//! Library persistence

use crate::db::map_constraint;
use crate::models::{status, Library};
use chrono::Utc;
use sqlx::SqlitePool;
use tonelab_common::{Error, Result};
use uuid::Uuid;

/// Fields an operator supplies when registering a library
#[derive(Debug, Clone)]
pub struct NewLibrary {
    pub name: String,
    pub root_path: String,
    pub scan_interval: String,
    pub read_only: bool,
    pub output_path: Option<String>,
    pub allowed_formats: Option<String>,
}

pub async fn create_library(pool: &SqlitePool, new: NewLibrary) -> Result<Library> {
    if new.name.trim().is_empty() {
        return Err(Error::InvalidInput("library name must not be empty".to_string()));
    }
    if new.root_path.trim().is_empty() {
        return Err(Error::InvalidInput("library root path must not be empty".to_string()));
    }

    let now = Utc::now();
    let library = Library {
        id: Uuid::new_v4().to_string(),
        name: new.name,
        root_path: new.root_path,
        scan_interval: new.scan_interval,
        read_only: new.read_only,
        output_path: new.output_path,
        allowed_formats: new.allowed_formats,
        last_scan_at: None,
        status: status::PENDING.to_string(),
        created_at: now,
        updated_at: now,
        track_count: 0,
        total_size: 0,
    };

    sqlx::query(
        "INSERT INTO libraries
         (id, name, root_path, scan_interval, read_only, output_path, allowed_formats, status, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&library.id)
    .bind(&library.name)
    .bind(&library.root_path)
    .bind(&library.scan_interval)
    .bind(library.read_only)
    .bind(&library.output_path)
    .bind(&library.allowed_formats)
    .bind(&library.status)
    .bind(library.created_at)
    .bind(library.updated_at)
    .execute(pool)
    .await
    .map_err(|e| map_constraint(e, "library root path"))?;

    Ok(library)
}

pub async fn get_library(pool: &SqlitePool, id: &str) -> Result<Library> {
    sqlx::query_as::<_, Library>("SELECT * FROM libraries WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("library {}", id)))
}

/// List libraries with track count and total size aggregates.
pub async fn list_libraries(pool: &SqlitePool) -> Result<Vec<Library>> {
    let libraries = sqlx::query_as::<_, Library>(
        "SELECT l.*,
                COALESCE((SELECT COUNT(*) FROM tracks t
                          JOIN media_files m ON t.media_file_id = m.id
                          WHERE m.library_id = l.id), 0) AS track_count,
                COALESCE((SELECT SUM(m.size) FROM media_files m
                          WHERE m.library_id = l.id AND m.status != 'deleted'), 0) AS total_size
         FROM libraries l
         ORDER BY l.name",
    )
    .fetch_all(pool)
    .await?;
    Ok(libraries)
}

pub async fn update_library(pool: &SqlitePool, library: &Library) -> Result<()> {
    let result = sqlx::query(
        "UPDATE libraries SET
             name = ?, root_path = ?, scan_interval = ?, read_only = ?,
             output_path = ?, allowed_formats = ?, status = ?, last_scan_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&library.name)
    .bind(&library.root_path)
    .bind(&library.scan_interval)
    .bind(library.read_only)
    .bind(&library.output_path)
    .bind(&library.allowed_formats)
    .bind(&library.status)
    .bind(library.last_scan_at)
    .bind(Utc::now())
    .bind(&library.id)
    .execute(pool)
    .await
    .map_err(|e| map_constraint(e, "library root path"))?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("library {}", library.id)));
    }
    Ok(())
}

/// Delete a library. Media files, tracks, runs and downstream rows cascade.
pub async fn delete_library(pool: &SqlitePool, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM libraries WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("library {}", id)));
    }
    Ok(())
}
