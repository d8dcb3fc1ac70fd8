//! Action log persistence: immutable audit trail for operator mutations

use crate::models::ActionLog;
use chrono::Utc;
use sqlx::SqlitePool;
use tonelab_common::Result;
use uuid::Uuid;

pub async fn create_action_log(
    pool: &SqlitePool,
    action_type: &str,
    target_type: &str,
    target_id: &str,
    actor: &str,
    before_json: &str,
    after_json: &str,
) -> Result<ActionLog> {
    let log = ActionLog {
        id: Uuid::new_v4().to_string(),
        action_type: action_type.to_string(),
        target_type: target_type.to_string(),
        target_id: target_id.to_string(),
        actor: actor.to_string(),
        before_json: before_json.to_string(),
        after_json: after_json.to_string(),
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO action_logs
         (id, action_type, target_type, target_id, actor, before_json, after_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&log.id)
    .bind(&log.action_type)
    .bind(&log.target_type)
    .bind(&log.target_id)
    .bind(&log.actor)
    .bind(&log.before_json)
    .bind(&log.after_json)
    .bind(log.created_at)
    .execute(pool)
    .await?;

    Ok(log)
}

pub async fn list_action_logs(
    pool: &SqlitePool,
    target_type: Option<&str>,
    target_id: Option<&str>,
    limit: i64,
) -> Result<Vec<ActionLog>> {
    let mut sql = String::from("SELECT * FROM action_logs WHERE 1=1");
    if target_type.is_some() {
        sql.push_str(" AND target_type = ?");
    }
    if target_id.is_some() {
        sql.push_str(" AND target_id = ?");
    }
    sql.push_str(" ORDER BY created_at DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, ActionLog>(&sql);
    if let Some(t) = target_type {
        query = query.bind(t);
    }
    if let Some(id) = target_id {
        query = query.bind(id);
    }
    let logs = query.bind(limit).fetch_all(pool).await?;
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn create_and_filter() {
        let pool = connect_in_memory().await.unwrap();

        create_action_log(
            &pool,
            "tag_edit",
            "track",
            "t1",
            "operator",
            r#"{"title":"Old"}"#,
            r#"{"title":"New"}"#,
        )
        .await
        .unwrap();
        create_action_log(&pool, "convert", "track", "t2", "system", "{}", "{}")
            .await
            .unwrap();

        let all = list_action_logs(&pool, None, None, 50).await.unwrap();
        assert_eq!(all.len(), 2);

        let t1 = list_action_logs(&pool, Some("track"), Some("t1"), 50)
            .await
            .unwrap();
        assert_eq!(t1.len(), 1);
        assert_eq!(t1[0].action_type, "tag_edit");
        assert!(t1[0].before_json.contains("Old"));
    }
}
