//! Settings persistence: upsert key/value pairs with type discriminators

use crate::models::Setting;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tonelab_common::Result;

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<Setting>> {
    let setting = sqlx::query_as::<_, Setting>("SELECT * FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(setting)
}

pub async fn set_setting(
    pool: &SqlitePool,
    key: &str,
    value: &str,
    value_type: &str,
    category: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, value_type, category, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(value_type)
    .bind(category)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_settings(pool: &SqlitePool, category: Option<&str>) -> Result<Vec<Setting>> {
    let settings = match category {
        Some(c) => {
            sqlx::query_as::<_, Setting>(
                "SELECT * FROM settings WHERE category = ? ORDER BY category, key",
            )
            .bind(c)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Setting>("SELECT * FROM settings ORDER BY category, key")
                .fetch_all(pool)
                .await?
        }
    };
    Ok(settings)
}

/// All settings as a flat key → value map.
pub async fn get_all_settings(pool: &SqlitePool) -> Result<HashMap<String, String>> {
    let settings = list_settings(pool, None).await?;
    Ok(settings.into_iter().map(|s| (s.key, s.value)).collect())
}

/// Typed integer accessor with a default for missing or unparseable values.
pub async fn get_int_setting(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    Ok(get_setting(pool, key)
        .await?
        .and_then(|s| s.value.parse().ok())
        .unwrap_or(default))
}
