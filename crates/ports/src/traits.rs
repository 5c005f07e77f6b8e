//! Collaborator contracts of the pipeline core.
//!
//! Defined here (not in the engine) so the `db` crate can implement the store
//! traits without depending on the engine.

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    AuditEvent, Device, DeviceId, Instance, InstanceConfig, InstanceId, NewSnapshot, Pipeline,
    PipelineId, PipelineStage, Snapshot, SnapshotId, SnapshotOwner, StageId, StoreError, Team,
    TeamId,
};

/// Sets `stage_id.next_stage_id` as part of a stage insert or removal.
///
/// The write only applies while `stage_id` still points at `expected_next`;
/// otherwise the store fails with [`StoreError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLink {
    pub stage_id: StageId,
    pub expected_next: Option<StageId>,
    pub next_stage_id: Option<StageId>,
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Pipelines and their stages.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError>;

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>, StoreError>;

    /// Delete a pipeline together with all of its stages.
    async fn delete_pipeline(&self, id: PipelineId) -> Result<(), StoreError>;

    async fn list_stages(&self, pipeline_id: PipelineId) -> Result<Vec<PipelineStage>, StoreError>;

    async fn get_stage(&self, id: StageId) -> Result<Option<PipelineStage>, StoreError>;

    /// Insert `stage` and apply `link` in the same atomic step.
    ///
    /// A `link` of `None` claims the head of an empty pipeline; it fails with
    /// [`StoreError::Conflict`] if the pipeline already has stages.
    async fn insert_stage(
        &self,
        stage: &PipelineStage,
        link: Option<StageLink>,
    ) -> Result<(), StoreError>;

    /// Overwrite name, action and bound targets of an existing stage.
    async fn update_stage(&self, stage: &PipelineStage) -> Result<(), StoreError>;

    /// Delete stage `id` and apply `rewire` in the same atomic step.
    ///
    /// Fails with [`StoreError::Conflict`] if `rewire` no longer matches.
    async fn remove_stage(&self, id: StageId, rewire: Option<StageLink>) -> Result<(), StoreError>;
}

/// Snapshot rows.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn find_by_id(&self, id: SnapshotId) -> Result<Option<Snapshot>, StoreError>;

    async fn create(&self, snapshot: NewSnapshot) -> Result<Snapshot, StoreError>;

    /// Delete a snapshot. Device target/active pointers at it are cleared.
    async fn destroy(&self, id: SnapshotId) -> Result<(), StoreError>;

    /// Most recently created snapshot of `owner`.
    async fn latest_for_owner(&self, owner: SnapshotOwner) -> Result<Option<Snapshot>, StoreError>;

    /// All snapshots of `owner`, newest first.
    async fn list_for_owner(&self, owner: SnapshotOwner) -> Result<Vec<Snapshot>, StoreError>;
}

/// Managed instances, as far as the pipeline needs them.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>, StoreError>;

    /// Secret derived by the platform for instances without a stored one.
    async fn derived_credential_secret(&self, id: InstanceId) -> Result<Option<String>, StoreError>;

    /// Live flows, credentials and settings of the instance.
    async fn current_config(&self, id: InstanceId) -> Result<InstanceConfig, StoreError>;

    /// Replace the instance's live configuration with `snapshot`.
    async fn import_snapshot(&self, id: InstanceId, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Set the snapshot the instance's devices should run.
    async fn set_device_target(
        &self,
        id: InstanceId,
        snapshot: Option<SnapshotId>,
    ) -> Result<(), StoreError>;
}

/// Edge devices, as far as the pipeline needs them.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>, StoreError>;

    async fn set_target_snapshot(
        &self,
        id: DeviceId,
        snapshot: Option<SnapshotId>,
    ) -> Result<(), StoreError>;

    async fn set_credential_secret(&self, id: DeviceId, secret: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TeamDirectory: Send + Sync {
    async fn find_team(&self, id: TeamId) -> Result<Option<Team>, StoreError>;
}

// ---------------------------------------------------------------------------
// Runtime collaborators
// ---------------------------------------------------------------------------

/// Commands understood by device agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Update,
    Restart,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Restart => "restart",
        }
    }
}

/// Fire-and-forget command bus to devices. Delivery is not guaranteed.
#[async_trait]
pub trait DeviceCommands: Send + Sync {
    async fn send_command(
        &self,
        team: TeamId,
        device: &Device,
        command: DeviceCommand,
        payload: Value,
    ) -> Result<(), StoreError>;

    /// Send to every device assigned to `instance`.
    async fn send_to_instance_devices(
        &self,
        team: TeamId,
        instance: InstanceId,
        command: DeviceCommand,
        payload: Value,
    ) -> Result<(), StoreError>;
}

/// The Node-RED runtime of an instance.
#[async_trait]
pub trait FlowRuntime: Send + Sync {
    async fn restart_flows(&self, instance: &Instance) -> Result<(), StoreError>;
}

/// Audit log write side.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError>;
}
