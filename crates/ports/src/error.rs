//! Collaborator-level error type.

use thiserror::Error;

/// Errors returned by store, dispatch and runtime collaborators.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The entity a write refers to does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A conditional write lost against a concurrent change.
    #[error("conflicting change: {0}")]
    Conflict(String),

    /// A runtime or device operation failed.
    #[error("runtime operation failed: {0}")]
    Runtime(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}
