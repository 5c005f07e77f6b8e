//! Snapshot operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::SnapshotRow, DbError};

const SNAPSHOT_COLUMNS: &str = "id, name, description, owner_type, owner_id, user_id, \
                                settings, flows, credential_secret, created_at";

pub async fn insert_snapshot(pool: &PgPool, row: &SnapshotRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO snapshots
            (id, name, description, owner_type, owner_id, user_id, settings, flows, credential_secret, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(row.id)
    .bind(&row.name)
    .bind(&row.description)
    .bind(&row.owner_type)
    .bind(row.owner_id)
    .bind(row.user_id)
    .bind(&row.settings)
    .bind(&row.flows)
    .bind(&row.credential_secret)
    .bind(row.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_snapshot(pool: &PgPool, id: Uuid) -> Result<Option<SnapshotRow>, DbError> {
    let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = $1");
    let row = sqlx::query_as::<_, SnapshotRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Snapshots of one owner, newest first. `limit` of `None` returns all.
pub async fn list_owner_snapshots(
    pool: &PgPool,
    owner_type: &str,
    owner_id: Uuid,
    limit: Option<i64>,
) -> Result<Vec<SnapshotRow>, DbError> {
    let sql = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots \
         WHERE owner_type = $1 AND owner_id = $2 \
         ORDER BY created_at DESC \
         LIMIT $3"
    );
    let rows = sqlx::query_as::<_, SnapshotRow>(&sql)
        .bind(owner_type)
        .bind(owner_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// Permanently delete a snapshot. Device and instance pointers at it are
/// nulled by their foreign keys.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_snapshot(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM snapshots WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("snapshot", id));
    }

    Ok(())
}
