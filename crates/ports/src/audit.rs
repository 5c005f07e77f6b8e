//! Structured audit events emitted by the pipeline core.

use serde::Serialize;
use serde_json::Value;

use crate::ids::{ApplicationId, DeviceId, InstanceId, SnapshotId, TeamId, UserId};
use crate::models::SnapshotOwner;

/// One changed field of an entity, recorded as `old -> new`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldUpdate {
    pub key: String,
    pub old: Value,
    pub new: Value,
}

impl FieldUpdate {
    pub fn new(key: impl Into<String>, old: impl Serialize, new: impl Serialize) -> Self {
        Self {
            key: key.into(),
            old: serde_json::to_value(old).unwrap_or(Value::Null),
            new: serde_json::to_value(new).unwrap_or(Value::Null),
        }
    }
}

/// An auditable action. The actor is always a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum AuditEvent {
    /// A snapshot was imported into an instance by a deploy.
    ProjectImported {
        actor: UserId,
        error: Option<String>,
        instance: InstanceId,
        source_instance: Option<InstanceId>,
        source_device: Option<DeviceId>,
    },
    /// Result of a deploy import; `snapshot` is `None` when it failed.
    ProjectSnapshotImported {
        actor: UserId,
        error: Option<String>,
        instance: InstanceId,
        source_instance: Option<InstanceId>,
        source_device: Option<DeviceId>,
        snapshot: Option<SnapshotId>,
    },
    ProjectSnapshotCreated {
        actor: UserId,
        error: Option<String>,
        instance: InstanceId,
        snapshot: SnapshotId,
    },
    ProjectSnapshotDeleted {
        actor: UserId,
        error: Option<String>,
        owner: SnapshotOwner,
        snapshot: SnapshotId,
    },
    DeviceTargetSet {
        actor: UserId,
        error: Option<String>,
        application: Option<ApplicationId>,
        device: DeviceId,
        snapshot: SnapshotId,
    },
    DeviceUpdated {
        actor: UserId,
        error: Option<String>,
        team: Option<TeamId>,
        device: DeviceId,
        updates: Vec<FieldUpdate>,
    },
}

impl AuditEvent {
    /// Stable event name as stored in the audit log.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProjectImported { .. }         => "project.imported",
            Self::ProjectSnapshotImported { .. } => "project.snapshot.imported",
            Self::ProjectSnapshotCreated { .. }  => "project.snapshot.created",
            Self::ProjectSnapshotDeleted { .. }  => "project.snapshot.deleted",
            Self::DeviceTargetSet { .. }         => "application.device.snapshot.device-target-set",
            Self::DeviceUpdated { .. }           => "team.device.updated",
        }
    }

    pub fn actor(&self) -> UserId {
        match self {
            Self::ProjectImported { actor, .. }
            | Self::ProjectSnapshotImported { actor, .. }
            | Self::ProjectSnapshotCreated { actor, .. }
            | Self::ProjectSnapshotDeleted { actor, .. }
            | Self::DeviceTargetSet { actor, .. }
            | Self::DeviceUpdated { actor, .. } => *actor,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::ProjectImported { error, .. }
            | Self::ProjectSnapshotImported { error, .. }
            | Self::ProjectSnapshotCreated { error, .. }
            | Self::ProjectSnapshotDeleted { error, .. }
            | Self::DeviceTargetSet { error, .. }
            | Self::DeviceUpdated { error, .. } => error.as_deref(),
        }
    }

    /// JSON body stored alongside the event name.
    pub fn body(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
