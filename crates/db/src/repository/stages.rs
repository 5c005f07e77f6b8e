//! Pipeline stage operations.
//!
//! Writes take a `&mut PgConnection` so callers can group a stage insert or
//! delete with the link update of its neighbour in one transaction.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    models::{StageRow, StageTargetRow},
    DbError,
};

/// All stage rows of a pipeline, in no particular order.
pub async fn list_stage_rows(pool: &PgPool, pipeline_id: Uuid) -> Result<Vec<StageRow>, DbError> {
    let rows = sqlx::query_as::<_, StageRow>(
        r#"
        SELECT id, pipeline_id, name, action, next_stage_id
        FROM pipeline_stages
        WHERE pipeline_id = $1
        "#,
    )
    .bind(pipeline_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn get_stage_row(pool: &PgPool, id: Uuid) -> Result<Option<StageRow>, DbError> {
    let row = sqlx::query_as::<_, StageRow>(
        r#"SELECT id, pipeline_id, name, action, next_stage_id FROM pipeline_stages WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Instances bound to any of `stage_ids`.
pub async fn list_stage_instances(
    pool: &PgPool,
    stage_ids: &[Uuid],
) -> Result<Vec<StageTargetRow>, DbError> {
    let rows = sqlx::query_as::<_, StageTargetRow>(
        r#"
        SELECT stage_id, instance_id AS target_id
        FROM stage_instances
        WHERE stage_id = ANY($1)
        "#,
    )
    .bind(stage_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Devices bound to any of `stage_ids`.
pub async fn list_stage_devices(
    pool: &PgPool,
    stage_ids: &[Uuid],
) -> Result<Vec<StageTargetRow>, DbError> {
    let rows = sqlx::query_as::<_, StageTargetRow>(
        r#"
        SELECT stage_id, device_id AS target_id
        FROM stage_devices
        WHERE stage_id = ANY($1)
        "#,
    )
    .bind(stage_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn insert_stage_row(conn: &mut PgConnection, row: &StageRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO pipeline_stages (id, pipeline_id, name, action, next_stage_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(row.id)
    .bind(row.pipeline_id)
    .bind(&row.name)
    .bind(&row.action)
    .bind(row.next_stage_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Overwrite name and action. The link is left alone.
pub async fn update_stage_row(conn: &mut PgConnection, row: &StageRow) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE pipeline_stages SET name = $1, action = $2 WHERE id = $3")
        .bind(&row.name)
        .bind(&row.action)
        .bind(row.id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("stage", row.id));
    }

    Ok(())
}

/// Point `stage_id` at `next_stage_id`, provided it still points at
/// `expected_next`.
///
/// Returns `DbError::NotFound` if `stage_id` does not exist and
/// `DbError::Conflict` if its link has moved.
pub async fn set_next_stage(
    conn: &mut PgConnection,
    stage_id: Uuid,
    expected_next: Option<Uuid>,
    next_stage_id: Option<Uuid>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE pipeline_stages SET next_stage_id = $1
        WHERE id = $2 AND next_stage_id IS NOT DISTINCT FROM $3
        "#,
    )
    .bind(next_stage_id)
    .bind(stage_id)
    .bind(expected_next)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM pipeline_stages WHERE id = $1")
                .bind(stage_id)
                .fetch_optional(&mut *conn)
                .await?;
        return Err(match exists {
            Some(_) => DbError::Conflict(format!("stage {stage_id} was relinked")),
            None => DbError::not_found("stage", stage_id),
        });
    }

    Ok(())
}

/// Lock a pipeline row until the transaction ends, serialising chain writes.
pub async fn lock_pipeline(conn: &mut PgConnection, pipeline_id: Uuid) -> Result<(), DbError> {
    let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM pipelines WHERE id = $1 FOR UPDATE")
        .bind(pipeline_id)
        .fetch_optional(&mut *conn)
        .await?;

    match locked {
        Some(_) => Ok(()),
        None => Err(DbError::not_found("pipeline", pipeline_id)),
    }
}

pub async fn count_stages(conn: &mut PgConnection, pipeline_id: Uuid) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pipeline_stages WHERE pipeline_id = $1")
        .bind(pipeline_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}

/// Replace every bound instance and device of a stage.
pub async fn replace_stage_targets(
    conn: &mut PgConnection,
    stage_id: Uuid,
    instances: &[Uuid],
    devices: &[Uuid],
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM stage_instances WHERE stage_id = $1")
        .bind(stage_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM stage_devices WHERE stage_id = $1")
        .bind(stage_id)
        .execute(&mut *conn)
        .await?;

    for instance in instances {
        sqlx::query("INSERT INTO stage_instances (stage_id, instance_id) VALUES ($1, $2)")
            .bind(stage_id)
            .bind(instance)
            .execute(&mut *conn)
            .await?;
    }
    for device in devices {
        sqlx::query("INSERT INTO stage_devices (stage_id, device_id) VALUES ($1, $2)")
            .bind(stage_id)
            .bind(device)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// Delete a stage row; its target rows cascade and any link at it is nulled.
///
/// Returns `DbError::NotFound` if no row was deleted.
pub async fn delete_stage_row(conn: &mut PgConnection, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM pipeline_stages WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("stage", id));
    }

    Ok(())
}
