//! Team lookups.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::TeamRow, DbError};

pub async fn get_team(pool: &PgPool, id: Uuid) -> Result<Option<TeamRow>, DbError> {
    let row = sqlx::query_as::<_, TeamRow>(r#"SELECT id, name FROM teams WHERE id = $1"#)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}
