//! Conversion profile lookups
//!
//! Built-in profiles are seeded at migration time; `convert` jobs carry a
//! profile id in their payload. The conversion executor itself lives
//! outside this service.

use crate::models::ConversionProfile;
use sqlx::SqlitePool;
use tonelab_common::{Error, Result};

pub async fn list_conversion_profiles(pool: &SqlitePool) -> Result<Vec<ConversionProfile>> {
    let profiles = sqlx::query_as::<_, ConversionProfile>(
        "SELECT * FROM conversion_profiles ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    Ok(profiles)
}

pub async fn get_conversion_profile(pool: &SqlitePool, id: &str) -> Result<ConversionProfile> {
    sqlx::query_as::<_, ConversionProfile>("SELECT * FROM conversion_profiles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("conversion profile {}", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn builtins_are_seeded() {
        let pool = connect_in_memory().await.unwrap();
        let profiles = list_conversion_profiles(&pool).await.unwrap();
        assert!(profiles.len() >= 3);
        assert!(profiles.iter().all(|p| p.is_builtin));

        let redbook = get_conversion_profile(&pool, "redbook").await.unwrap();
        assert_eq!(redbook.codec, "flac");
        assert_eq!(redbook.sample_rate, 44100);
    }

    #[tokio::test]
    async fn unknown_profile_is_not_found() {
        let pool = connect_in_memory().await.unwrap();
        let err = get_conversion_profile(&pool, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
