//! Typed error type for the db crate.

use ports::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A JSON column could not be encoded or decoded.
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),

    /// A conditional write found the row changed underneath it.
    #[error("conflicting change: {0}")]
    Conflict(String),

    /// A stored value does not map onto the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl DbError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound { entity, id } => StoreError::NotFound { entity, id },
            DbError::Conflict(message) => StoreError::Conflict(message),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
