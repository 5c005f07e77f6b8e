//! Conversions between row structs and the `ports` domain models.

use std::collections::BTreeMap;

use ports::{
    AuditEvent, Device, Instance, InstanceConfig, InstanceState, Pipeline, PipelineStage,
    Snapshot, SnapshotFlows, SnapshotOwner, SnapshotSettings, StageAction, Team,
};
use uuid::Uuid;

use crate::models::{
    AuditRow, DeviceRow, InstanceRow, InstanceStorageRow, PipelineRow, SnapshotRow, StageRow,
    StageTargetRow, TeamRow,
};
use crate::DbError;

const OWNER_INSTANCE: &str = "instance";
const OWNER_DEVICE: &str = "device";

/// `(owner_type, owner_id)` column values of a snapshot owner.
pub fn owner_columns(owner: SnapshotOwner) -> (&'static str, Uuid) {
    match owner {
        SnapshotOwner::Instance(id) => (OWNER_INSTANCE, id.as_uuid()),
        SnapshotOwner::Device(id) => (OWNER_DEVICE, id.as_uuid()),
    }
}

fn owner_from_columns(owner_type: &str, owner_id: Uuid) -> Result<SnapshotOwner, DbError> {
    match owner_type {
        OWNER_INSTANCE => Ok(SnapshotOwner::Instance(owner_id.into())),
        OWNER_DEVICE => Ok(SnapshotOwner::Device(owner_id.into())),
        other => Err(DbError::Corrupt(format!("unknown snapshot owner type '{other}'"))),
    }
}

impl From<PipelineRow> for Pipeline {
    fn from(row: PipelineRow) -> Self {
        Pipeline {
            id: row.id.into(),
            name: row.name,
            application_id: row.application_id.into(),
            created_at: row.created_at,
        }
    }
}

/// Assemble a stage from its row and the target rows bound to it.
///
/// Target rows of other stages are ignored.
pub fn stage_from_rows(
    row: StageRow,
    instances: &[StageTargetRow],
    devices: &[StageTargetRow],
) -> PipelineStage {
    let bound = |targets: &[StageTargetRow]| -> Vec<Uuid> {
        targets.iter().filter(|t| t.stage_id == row.id).map(|t| t.target_id).collect()
    };
    PipelineStage {
        id: row.id.into(),
        pipeline_id: row.pipeline_id.into(),
        name: row.name.clone(),
        action: StageAction::from(row.action.clone()),
        next_stage_id: row.next_stage_id.map(Into::into),
        instances: bound(instances).into_iter().map(Into::into).collect(),
        devices: bound(devices).into_iter().map(Into::into).collect(),
    }
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = DbError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let settings: SnapshotSettings = serde_json::from_value(row.settings)?;
        let flows: SnapshotFlows = serde_json::from_value(row.flows)?;
        Ok(Snapshot {
            id: row.id.into(),
            name: row.name,
            description: row.description,
            owner: owner_from_columns(&row.owner_type, row.owner_id)?,
            user_id: row.user_id.map(Into::into),
            settings,
            flows,
            credential_secret: row.credential_secret,
            created_at: row.created_at,
        })
    }
}

impl SnapshotRow {
    /// Row for a snapshot about to be inserted.
    ///
    /// Plaintext credentials are refused; only the encrypted envelope is
    /// ever written.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, DbError> {
        if !snapshot.flows.credentials.is_encrypted() && !snapshot.flows.credentials.is_empty() {
            return Err(DbError::Corrupt(format!(
                "snapshot {} carries plaintext credentials",
                snapshot.id
            )));
        }
        let (owner_type, owner_id) = owner_columns(snapshot.owner);
        Ok(Self {
            id: snapshot.id.as_uuid(),
            name: snapshot.name.clone(),
            description: snapshot.description.clone(),
            owner_type: owner_type.to_string(),
            owner_id,
            user_id: snapshot.user_id.map(|u| u.as_uuid()),
            settings: serde_json::to_value(&snapshot.settings)?,
            flows: serde_json::to_value(&snapshot.flows)?,
            credential_secret: snapshot.credential_secret.clone(),
            created_at: snapshot.created_at,
        })
    }
}

impl From<InstanceRow> for Instance {
    fn from(row: InstanceRow) -> Self {
        Instance {
            id: row.id.into(),
            name: row.name,
            state: InstanceState::from(row.state),
            credential_secret: row.credential_secret,
            team_id: row.team_id.map(Into::into),
            application_id: row.application_id.map(Into::into),
            device_target_snapshot_id: row.device_target_snapshot_id.map(Into::into),
        }
    }
}

impl TryFrom<InstanceStorageRow> for InstanceConfig {
    type Error = DbError;

    fn try_from(row: InstanceStorageRow) -> Result<Self, Self::Error> {
        let env: BTreeMap<String, String> = serde_json::from_value(row.env)?;
        Ok(InstanceConfig {
            flows: row.flows,
            credentials: serde_json::from_value(row.credentials)?,
            settings: row.settings,
            env,
            modules: row.modules,
        })
    }
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.id.into(),
            name: row.name,
            device_type: row.device_type,
            credential_secret: row.credential_secret,
            target_snapshot_id: row.target_snapshot_id.map(Into::into),
            active_snapshot_id: row.active_snapshot_id.map(Into::into),
            team_id: row.team_id.map(Into::into),
            application_id: row.application_id.map(Into::into),
            instance_id: row.instance_id.map(Into::into),
        }
    }
}

impl From<TeamRow> for Team {
    fn from(row: TeamRow) -> Self {
        Team { id: row.id.into(), name: row.name }
    }
}

impl AuditRow {
    pub fn from_event(event: &AuditEvent) -> Result<Self, DbError> {
        Ok(Self {
            id: Uuid::new_v4(),
            event: event.name().to_string(),
            actor: event.actor().as_uuid(),
            error: event.error().map(str::to_string),
            body: serde_json::to_value(event)?,
            created_at: chrono::Utc::now(),
        })
    }
}
