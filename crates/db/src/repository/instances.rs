//! Instance and instance storage operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    models::{InstanceRow, InstanceStorageRow},
    DbError,
};

pub async fn get_instance(pool: &PgPool, id: Uuid) -> Result<Option<InstanceRow>, DbError> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT id, name, state, credential_secret, team_id, application_id, device_target_snapshot_id
        FROM instances
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Live configuration of an instance, if it has ever been written.
pub async fn get_storage(pool: &PgPool, instance_id: Uuid) -> Result<Option<InstanceStorageRow>, DbError> {
    let row = sqlx::query_as::<_, InstanceStorageRow>(
        r#"
        SELECT instance_id, flows, credentials, settings, env, modules, credential_secret
        FROM instance_storage
        WHERE instance_id = $1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Replace the live flows, credentials and settings of an instance.
///
/// The derived credential secret is kept.
pub async fn upsert_storage(pool: &PgPool, row: &InstanceStorageRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO instance_storage (instance_id, flows, credentials, settings, env, modules, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, now())
        ON CONFLICT (instance_id) DO UPDATE
        SET flows = EXCLUDED.flows,
            credentials = EXCLUDED.credentials,
            settings = EXCLUDED.settings,
            env = EXCLUDED.env,
            modules = EXCLUDED.modules,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(row.instance_id)
    .bind(&row.flows)
    .bind(&row.credentials)
    .bind(&row.settings)
    .bind(&row.env)
    .bind(&row.modules)
    .execute(pool)
    .await?;

    Ok(())
}

/// Returns `DbError::NotFound` if the instance does not exist.
pub async fn set_device_target(
    pool: &PgPool,
    id: Uuid,
    snapshot_id: Option<Uuid>,
) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE instances SET device_target_snapshot_id = $1 WHERE id = $2")
        .bind(snapshot_id)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("instance", id));
    }

    Ok(())
}
