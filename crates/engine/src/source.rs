//! Resolution of the snapshot a source stage deploys.
//!
//! What is allowed depends on both the stage action and the kind of source:
//!
//! | action                | instance source        | device source          |
//! |-----------------------|------------------------|------------------------|
//! | `create_snapshot`     | snapshot of live state | rejected               |
//! | `use_latest_snapshot` | newest owned snapshot  | newest owned snapshot  |
//! | `prompt`              | caller-chosen snapshot | caller-chosen snapshot |
//! | `use_active_snapshot` | rejected               | device's active one    |

use chrono::Utc;
use ports::{
    Device, Instance, Pipeline, PipelineStage, Snapshot, SnapshotId, SnapshotOwner, StageAction,
    UserId,
};
use tracing::debug;

use crate::snapshots::{capture_instance_snapshot, deploy_snapshot_description, deploy_snapshot_name};
use crate::{EngineContext, PipelineError};

/// Deploy context used to name snapshots created on the fly.
#[derive(Debug, Clone, Copy)]
pub struct SourceMeta<'a> {
    pub pipeline: &'a Pipeline,
    pub target_stage: &'a PipelineStage,
    pub user: UserId,
}

/// The caller-chosen snapshot of a `prompt` stage. It must belong to `owner`.
async fn prompted_snapshot(
    ctx: &EngineContext,
    snapshot_id: Option<SnapshotId>,
    owner: SnapshotOwner,
) -> Result<Snapshot, PipelineError> {
    let id = snapshot_id.ok_or_else(|| {
        PipelineError::invalid_snapshot(
            "Source snapshot is required as deploy action is set to prompt for snapshot",
            400,
        )
    })?;
    let snapshot = ctx
        .snapshots
        .find_by_id(id)
        .await?
        .ok_or_else(|| PipelineError::invalid_snapshot("Source snapshot not found", 404))?;
    if snapshot.owner != owner {
        return Err(PipelineError::invalid_snapshot(
            format!("Source snapshot not associated with source {}", owner.kind()),
            400,
        ));
    }
    Ok(snapshot)
}

pub async fn get_or_create_snapshot_for_source_instance(
    ctx: &EngineContext,
    source_stage: &PipelineStage,
    instance: &Instance,
    snapshot_id: Option<SnapshotId>,
    meta: SourceMeta<'_>,
) -> Result<Snapshot, PipelineError> {
    let owner = SnapshotOwner::Instance(instance.id);
    debug!(stage_id = %source_stage.id, action = %source_stage.action, "resolving instance source snapshot");

    match &source_stage.action {
        StageAction::UseLatestSnapshot => ctx.snapshots.latest_for_owner(owner).await?.ok_or_else(|| {
            PipelineError::InvalidSourceInstance(
                "No snapshots found for source stages instance but deploy action is set to use latest snapshot".into(),
            )
        }),
        StageAction::CreateSnapshot => {
            let name = deploy_snapshot_name(&ctx.config, None, Utc::now());
            let description =
                deploy_snapshot_description(source_stage, meta.target_stage, meta.pipeline, None);
            capture_instance_snapshot(ctx, instance, meta.user, name, description).await
        }
        StageAction::Prompt => prompted_snapshot(ctx, snapshot_id, owner).await,
        StageAction::UseActiveSnapshot => Err(PipelineError::InvalidSourceAction(
            "When using an instance as a source, use active snapshot is not supported".into(),
        )),
        StageAction::Unknown(action) => Err(PipelineError::InvalidAction(format!(
            "Unsupported pipeline deploy action for instances: {action}"
        ))),
    }
}

pub async fn get_or_create_snapshot_for_source_device(
    ctx: &EngineContext,
    source_stage: &PipelineStage,
    device: &Device,
    snapshot_id: Option<SnapshotId>,
) -> Result<Snapshot, PipelineError> {
    let owner = SnapshotOwner::Device(device.id);
    debug!(stage_id = %source_stage.id, action = %source_stage.action, "resolving device source snapshot");

    match &source_stage.action {
        StageAction::UseLatestSnapshot => ctx.snapshots.latest_for_owner(owner).await?.ok_or_else(|| {
            PipelineError::InvalidSourceDevice(
                "No snapshots found for source stages device but deploy action is set to use latest snapshot".into(),
            )
        }),
        StageAction::CreateSnapshot => Err(PipelineError::InvalidSourceAction(
            "When using a device as a source, create snapshot is not supported".into(),
        )),
        StageAction::Prompt => prompted_snapshot(ctx, snapshot_id, owner).await,
        StageAction::UseActiveSnapshot => {
            let missing = || {
                PipelineError::InvalidSourceDevice(
                    "No active snapshot found for source stages device but deploy action is set to use active snapshot".into(),
                )
            };
            let active = device.active_snapshot_id.ok_or_else(missing)?;
            ctx.snapshots.find_by_id(active).await?.ok_or_else(missing)
        }
        StageAction::Unknown(action) => Err(PipelineError::InvalidAction(format!(
            "Unsupported pipeline deploy action for devices: {action}"
        ))),
    }
}
