//! Engine-level error types.

use credentials::CredentialError;
use ports::{InstanceId, StoreError};
use queue::QueueError;
use thiserror::Error;

/// Errors produced by stage management, validation, snapshot handling and
/// deploys.
///
/// Every variant maps to a stable [`code`](Self::code) and an HTTP-equivalent
/// [`status`](Self::status).
#[derive(Debug, Error)]
pub enum PipelineError {
    // ------ Lookup and validation ------

    #[error("{0}")]
    NotFound(String),

    /// The stage graph or a stage pair is unusable for the request. The
    /// status differs per check (400, 403 or 404).
    #[error("{message}")]
    InvalidStage { message: String, status: u16 },

    #[error("{0}")]
    InvalidArgument(String),

    // ------ Source snapshot resolution ------

    #[error("{0}")]
    InvalidSourceInstance(String),

    #[error("{0}")]
    InvalidSourceDevice(String),

    #[error("{message}")]
    InvalidSourceSnapshot { message: String, status: u16 },

    #[error("{0}")]
    InvalidSourceAction(String),

    #[error("{0}")]
    InvalidAction(String),

    // ------ Snapshot import/export ------

    #[error("Missing credentialSecret")]
    MissingCredentialSecret,

    // ------ Deploy ------

    #[error("a deploy to instance '{0}' is already in progress")]
    DeployInProgress(InstanceId),

    /// The stage chain changed between planning and writing a link.
    #[error("{0}")]
    StageConflict(String),

    /// A deploy failed after validation passed.
    #[error("Error during deploy: {source}")]
    Unexpected {
        #[source]
        source: Box<PipelineError>,
    },

    // ------ Collaborators ------

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Credentials(CredentialError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    pub(crate) fn invalid_stage(message: impl Into<String>, status: u16) -> Self {
        Self::InvalidStage { message: message.into(), status }
    }

    pub(crate) fn invalid_snapshot(message: impl Into<String>, status: u16) -> Self {
        Self::InvalidSourceSnapshot { message: message.into(), status }
    }

    /// Wrap a failure of a deploy body.
    pub fn unexpected(cause: PipelineError) -> Self {
        match cause {
            already @ Self::Unexpected { .. } => already,
            other => Self::Unexpected { source: Box::new(other) },
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_)                   => "not_found",
            Self::InvalidStage { .. }           => "invalid_stage",
            Self::InvalidArgument(_)            => "invalid_argument",
            Self::InvalidSourceInstance(_)      => "invalid_source_instance",
            Self::InvalidSourceDevice(_)        => "invalid_source_device",
            Self::InvalidSourceSnapshot { .. }  => "invalid_source_snapshot",
            Self::InvalidSourceAction(_)        => "invalid_source_action",
            Self::InvalidAction(_)              => "invalid_action",
            Self::MissingCredentialSecret       => "missing_credential_secret",
            Self::DeployInProgress(_)           => "deploy_in_progress",
            Self::StageConflict(_)              => "stage_conflict",
            Self::Unexpected { .. }
            | Self::Store(_)
            | Self::Credentials(_)
            | Self::Queue(_)                    => "unexpected_error",
        }
    }

    /// HTTP-equivalent status.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidStage { status, .. } | Self::InvalidSourceSnapshot { status, .. } => *status,
            Self::InvalidArgument(_)
            | Self::InvalidSourceInstance(_)
            | Self::InvalidSourceDevice(_)
            | Self::InvalidSourceAction(_)
            | Self::InvalidAction(_)
            | Self::MissingCredentialSecret => 400,
            Self::DeployInProgress(_) | Self::StageConflict(_) => 409,
            Self::Unexpected { .. } | Self::Store(_) | Self::Credentials(_) | Self::Queue(_) => 500,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Self::StageConflict(message),
            other => Self::Store(other),
        }
    }
}

impl From<CredentialError> for PipelineError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::MissingSecret => Self::MissingCredentialSecret,
            other => Self::Credentials(other),
        }
    }
}
