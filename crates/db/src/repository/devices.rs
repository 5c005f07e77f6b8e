//! Device operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::DeviceRow, DbError};

pub async fn get_device(pool: &PgPool, id: Uuid) -> Result<Option<DeviceRow>, DbError> {
    let row = sqlx::query_as::<_, DeviceRow>(
        r#"
        SELECT id, name, device_type, credential_secret, target_snapshot_id, active_snapshot_id,
               team_id, application_id, instance_id
        FROM devices
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Returns `DbError::NotFound` if the device does not exist.
pub async fn set_target_snapshot(
    pool: &PgPool,
    id: Uuid,
    snapshot_id: Option<Uuid>,
) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE devices SET target_snapshot_id = $1 WHERE id = $2")
        .bind(snapshot_id)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("device", id));
    }

    Ok(())
}

/// Returns `DbError::NotFound` if the device does not exist.
pub async fn set_credential_secret(pool: &PgPool, id: Uuid, secret: &str) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE devices SET credential_secret = $1 WHERE id = $2")
        .bind(secret)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("device", id));
    }

    Ok(())
}
