//! Pipeline CRUD operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::PipelineRow, DbError};

/// Insert a new pipeline row.
pub async fn insert_pipeline(pool: &PgPool, row: &PipelineRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO pipelines (id, name, application_id, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(row.id)
    .bind(&row.name)
    .bind(row.application_id)
    .bind(row.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a single pipeline by its primary key.
pub async fn get_pipeline(pool: &PgPool, id: Uuid) -> Result<Option<PipelineRow>, DbError> {
    let row = sqlx::query_as::<_, PipelineRow>(
        r#"SELECT id, name, application_id, created_at FROM pipelines WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Permanently delete a pipeline. Its stages go with it (`ON DELETE CASCADE`).
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_pipeline(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("pipeline", id));
    }

    Ok(())
}
