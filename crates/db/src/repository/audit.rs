//! Audit log writes and reads.

use sqlx::PgPool;

use crate::{models::AuditRow, DbError};

pub async fn insert_audit(pool: &PgPool, row: &AuditRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (id, event, actor, error, body, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(row.id)
    .bind(&row.event)
    .bind(row.actor)
    .bind(&row.error)
    .bind(&row.body)
    .bind(row.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent entries first.
pub async fn list_recent(pool: &PgPool, limit: i64) -> Result<Vec<AuditRow>, DbError> {
    let rows = sqlx::query_as::<_, AuditRow>(
        r#"
        SELECT id, event, actor, error, body, created_at
        FROM audit_log
        ORDER BY created_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
