//! Artifact registry
//!
//! Rows reference files under the artifacts root by relative path; the
//! pipeline fsyncs artifacts before the manifest references them.

use crate::models::Artifact;
use chrono::Utc;
use sqlx::SqlitePool;
use tonelab_common::Result;
use uuid::Uuid;

pub async fn create_artifact(pool: &SqlitePool, artifact: &mut Artifact) -> Result<()> {
    artifact.id = Uuid::new_v4().to_string();
    artifact.created_at = Utc::now();

    sqlx::query(
        "INSERT INTO artifacts (id, track_id, kind, path, mime_type, width, height, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&artifact.id)
    .bind(&artifact.track_id)
    .bind(&artifact.kind)
    .bind(&artifact.path)
    .bind(&artifact.mime_type)
    .bind(artifact.width)
    .bind(artifact.height)
    .bind(artifact.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_artifacts(pool: &SqlitePool, track_id: &str) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts WHERE track_id = ? ORDER BY kind",
    )
    .bind(track_id)
    .fetch_all(pool)
    .await?;
    Ok(artifacts)
}

/// True when the track has at least one artifact of `kind`.
pub async fn has_artifact(pool: &SqlitePool, track_id: &str, kind: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE track_id = ? AND kind = ?")
            .bind(track_id)
            .bind(kind)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::libraries::{create_library, NewLibrary};
    use crate::db::media_files::create_media_file;
    use crate::db::tracks::create_track;
    use crate::models::Track;

    #[tokio::test]
    async fn artifact_roundtrip() {
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
        let file = create_media_file(&pool, &library.id, "/music/a.flac", 1, Utc::now())
            .await
            .unwrap();
        let mut track = Track {
            media_file_id: file.id,
            ..Default::default()
        };
        create_track(&pool, &mut track).await.unwrap();

        let mut artifact = Artifact {
            id: String::new(),
            track_id: track.id.clone(),
            kind: "artwork".to_string(),
            path: format!("tracks/{}/{}/artwork.jpg", &track.id[..2], track.id),
            mime_type: "image/jpeg".to_string(),
            width: Some(600),
            height: Some(600),
            created_at: Utc::now(),
        };
        create_artifact(&pool, &mut artifact).await.unwrap();

        assert!(has_artifact(&pool, &track.id, "artwork").await.unwrap());
        assert!(!has_artifact(&pool, &track.id, "waveform").await.unwrap());

        let listed = list_artifacts(&pool, &track.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].mime_type, "image/jpeg");
    }
}
