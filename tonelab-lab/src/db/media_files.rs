//! Media file persistence
//!
//! One row per file ever observed under a library root. Rows outlive the
//! file on disk: deletion flips the status to `deleted`.

use crate::db::map_constraint;
use crate::models::{status, MediaFile};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use tonelab_common::{Error, Result};
use uuid::Uuid;

pub async fn create_media_file(
    pool: &SqlitePool,
    library_id: &str,
    path: &str,
    size: i64,
    mtime: DateTime<Utc>,
) -> Result<MediaFile> {
    let p = Path::new(path);
    let filename = p
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = p
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    let now = Utc::now();
    let file = MediaFile {
        id: Uuid::new_v4().to_string(),
        library_id: library_id.to_string(),
        path: path.to_string(),
        filename,
        extension,
        size,
        mtime,
        quick_hash: None,
        full_hash: None,
        status: status::PENDING.to_string(),
        error_msg: None,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO media_files
         (id, library_id, path, filename, extension, size, mtime, quick_hash, full_hash, status, error_msg, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&file.id)
    .bind(&file.library_id)
    .bind(&file.path)
    .bind(&file.filename)
    .bind(&file.extension)
    .bind(file.size)
    .bind(file.mtime)
    .bind(&file.quick_hash)
    .bind(&file.full_hash)
    .bind(&file.status)
    .bind(&file.error_msg)
    .bind(file.created_at)
    .bind(file.updated_at)
    .execute(pool)
    .await
    .map_err(|e| map_constraint(e, "media file path"))?;

    Ok(file)
}

pub async fn get_media_file(pool: &SqlitePool, id: &str) -> Result<MediaFile> {
    sqlx::query_as::<_, MediaFile>("SELECT * FROM media_files WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("media file {}", id)))
}

pub async fn get_media_file_by_path(
    pool: &SqlitePool,
    library_id: &str,
    path: &str,
) -> Result<Option<MediaFile>> {
    let file = sqlx::query_as::<_, MediaFile>(
        "SELECT * FROM media_files WHERE library_id = ? AND path = ?",
    )
    .bind(library_id)
    .bind(path)
    .fetch_optional(pool)
    .await?;
    Ok(file)
}

/// Load every row for a library, including `deleted` ones, ordered by path.
pub async fn list_media_files(pool: &SqlitePool, library_id: &str) -> Result<Vec<MediaFile>> {
    let files = sqlx::query_as::<_, MediaFile>(
        "SELECT * FROM media_files WHERE library_id = ? ORDER BY path",
    )
    .bind(library_id)
    .fetch_all(pool)
    .await?;
    Ok(files)
}

/// Persist the mutable fields of a media file row. Scanner refreshes
/// race worker status updates for the single writer, so lock errors
/// retry.
pub async fn update_media_file(pool: &SqlitePool, file: &MediaFile) -> Result<()> {
    crate::db::retry::retry_on_lock("media file update", 5000, || async {
        let result = sqlx::query(
            "UPDATE media_files SET
                 size = ?, mtime = ?, quick_hash = ?, full_hash = ?, status = ?, error_msg = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(file.size)
        .bind(file.mtime)
        .bind(&file.quick_hash)
        .bind(&file.full_hash)
        .bind(&file.status)
        .bind(&file.error_msg)
        .bind(Utc::now())
        .bind(&file.id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("media file {}", file.id)));
        }
        Ok(())
    })
    .await
}

pub async fn set_media_file_status(
    pool: &SqlitePool,
    id: &str,
    new_status: &str,
    error_msg: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE media_files SET status = ?, error_msg = ?, updated_at = ? WHERE id = ?",
    )
    .bind(new_status)
    .bind(error_msg)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("media file {}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::libraries::{create_library, NewLibrary};

    async fn setup() -> (SqlitePool, String) {
        let pool = connect_in_memory().await.unwrap();
        let library = create_library(
            &pool,
            NewLibrary {
                name: "Main".to_string(),
                root_path: "/music".to_string(),
                scan_interval: "15m".to_string(),
                read_only: true,
                output_path: None,
                allowed_formats: None,
            },
        )
        .await
        .unwrap();
        (pool, library.id)
    }

    #[tokio::test]
    async fn create_derives_filename_and_extension() {
        let (pool, library_id) = setup().await;
        let file = create_media_file(&pool, &library_id, "/music/Album/01 Song.FLAC", 2048, Utc::now())
            .await
            .unwrap();

        assert_eq!(file.filename, "01 Song.FLAC");
        assert_eq!(file.extension, ".flac");
        assert_eq!(file.status, status::PENDING);
    }

    #[tokio::test]
    async fn duplicate_path_within_library_is_conflict() {
        let (pool, library_id) = setup().await;
        create_media_file(&pool, &library_id, "/music/a.flac", 1, Utc::now())
            .await
            .unwrap();

        let err = create_media_file(&pool, &library_id, "/music/a.flac", 1, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn status_transitions_persist() {
        let (pool, library_id) = setup().await;
        let file = create_media_file(&pool, &library_id, "/music/a.flac", 1, Utc::now())
            .await
            .unwrap();

        set_media_file_status(&pool, &file.id, status::FAILED, Some("probe failed"))
            .await
            .unwrap();

        let loaded = get_media_file(&pool, &file.id).await.unwrap();
        assert_eq!(loaded.status, status::FAILED);
        assert_eq!(loaded.error_msg.as_deref(), Some("probe failed"));
    }
}
