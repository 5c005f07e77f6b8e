//! Deploy orchestration.
//!
//! A deploy to an instance is split in two:
//! 1. [`begin_instance_deploy`] marks the target in flight and fails fast if
//!    another deploy already holds it.
//! 2. [`PendingDeploy::run`] does the heavy work: copy and import the
//!    snapshot, restart flows, write the audit trail.
//!
//! [`deploy_snapshot_to_instance`] connects the two through the task queue
//! and hands back a [`DeployHandle`]. Deploys to devices only re-point the
//! device and run inline.

use chrono::Utc;
use ports::{
    AuditEvent, Device, DeviceCommand, DeviceId, FieldUpdate, Instance, InstanceId,
    InstanceState, Pipeline, PipelineId, PipelineStage, Snapshot, SnapshotId, StageId, UserId,
};
use queue::{JobHandle, TaskQueue};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::inflight::InflightGuard;
use crate::snapshots::{copy_snapshot, deploy_snapshot_description, deploy_snapshot_name, CopyOptions};
use crate::source::{
    get_or_create_snapshot_for_source_device, get_or_create_snapshot_for_source_instance,
    SourceMeta,
};
use crate::stages::load_pipeline;
use crate::validate::validate_source_stage_for_deploy;
use crate::{EngineContext, PipelineError};

// ---------------------------------------------------------------------------
// Deploy to instance
// ---------------------------------------------------------------------------

/// Everything a deploy to an instance needs.
///
/// The pipeline, stages and source ids are only used for naming and
/// auditing.
#[derive(Debug, Clone)]
pub struct InstanceDeployRequest {
    pub pipeline: Pipeline,
    pub source_stage: PipelineStage,
    pub target_stage: PipelineStage,
    pub source_snapshot: Snapshot,
    pub target_instance: Instance,
    pub source_instance: Option<InstanceId>,
    pub source_device: Option<DeviceId>,
    pub user: UserId,
}

/// Result of a queued deploy to an instance.
pub type DeployHandle = JobHandle<Result<Snapshot, PipelineError>>;

/// A deploy whose target is marked in flight but whose work has not run.
///
/// Dropping it without calling [`run`](Self::run) clears the marker.
#[derive(Debug)]
pub struct PendingDeploy {
    ctx: EngineContext,
    request: InstanceDeployRequest,
    restart_after_import: bool,
    guard: InflightGuard,
}

/// Mark the target instance in flight.
///
/// # Errors
/// [`PipelineError::DeployInProgress`] when a deploy to the same instance
/// has not finished yet.
pub fn begin_instance_deploy(
    ctx: &EngineContext,
    request: InstanceDeployRequest,
) -> Result<PendingDeploy, PipelineError> {
    let guard = ctx.inflight.try_begin(request.target_instance.id)?;
    let restart_after_import = request.target_instance.state == InstanceState::Running;

    info!(
        instance_id = %request.target_instance.id,
        snapshot_id = %request.source_snapshot.id,
        restart_after_import,
        "deploy to instance started"
    );

    Ok(PendingDeploy { ctx: ctx.clone(), request, restart_after_import, guard })
}

impl PendingDeploy {
    pub fn instance_id(&self) -> InstanceId {
        self.guard.instance()
    }

    /// `true` when the target was running before the deploy began.
    pub fn restarts_target(&self) -> bool {
        self.restart_after_import
    }

    /// Copy the source snapshot into the target, import it and restart the
    /// target's flows if it was running.
    ///
    /// The in-flight marker is cleared on every path. `project.imported` and
    /// `project.snapshot.imported` are written once each, in that order.
    ///
    /// # Errors
    /// Any failure is returned as [`PipelineError::Unexpected`].
    #[instrument(
        skip(self),
        fields(
            pipeline_id = %self.request.pipeline.id,
            instance_id = %self.request.target_instance.id,
        )
    )]
    pub async fn run(self) -> Result<Snapshot, PipelineError> {
        let PendingDeploy { ctx, request, restart_after_import, guard } = self;

        let outcome = copy_into_target(&ctx, &request, restart_after_import).await;
        guard.release();

        let (error, snapshot) = match &outcome {
            Ok(copy) => (None, Some(copy.id)),
            Err(e) => (Some(e.to_string()), None),
        };

        ctx.record(AuditEvent::ProjectImported {
            actor: request.user,
            error: None,
            instance: request.target_instance.id,
            source_instance: request.source_instance,
            source_device: request.source_device,
        })
        .await;
        ctx.record(AuditEvent::ProjectSnapshotImported {
            actor: request.user,
            error,
            instance: request.target_instance.id,
            source_instance: request.source_instance,
            source_device: request.source_device,
            snapshot,
        })
        .await;

        match outcome {
            Ok(copy) => {
                info!(snapshot_id = %copy.id, "deploy to instance finished");
                Ok(copy)
            }
            Err(e) => {
                error!(error = %e, "deploy to instance failed");
                Err(PipelineError::unexpected(e))
            }
        }
    }
}

async fn copy_into_target(
    ctx: &EngineContext,
    request: &InstanceDeployRequest,
    restart_after_import: bool,
) -> Result<Snapshot, PipelineError> {
    let source = &request.source_snapshot;
    let options = CopyOptions {
        import_snapshot: true,
        set_as_target: ctx.config.deploy_to_devices,
        decrypt_secret: source.credential_secret.clone(),
        name: Some(deploy_snapshot_name(&ctx.config, Some(source), Utc::now())),
        description: Some(deploy_snapshot_description(
            &request.source_stage,
            &request.target_stage,
            &request.pipeline,
            Some(source),
        )),
        ..CopyOptions::new(request.user)
    };

    let copy = copy_snapshot(ctx, source, &request.target_instance, options).await?;

    if restart_after_import {
        ctx.runtime.restart_flows(&request.target_instance).await?;
    }
    Ok(copy)
}

/// Begin a deploy and queue its work. The handle may be awaited for the
/// outcome or dropped.
pub async fn deploy_snapshot_to_instance(
    ctx: &EngineContext,
    queue: &TaskQueue,
    request: InstanceDeployRequest,
) -> Result<DeployHandle, PipelineError> {
    let pending = begin_instance_deploy(ctx, request)?;
    let label = format!("deploy to instance {}", pending.instance_id());
    Ok(queue.submit(label, pending.run()).await?)
}

/// `true` while a deploy to `instance` holds its in-flight marker.
pub fn is_deploying(ctx: &EngineContext, instance: InstanceId) -> bool {
    ctx.inflight.is_deploying(instance)
}

// ---------------------------------------------------------------------------
// Deploy to device
// ---------------------------------------------------------------------------

/// Make `snapshot` the device's target and tell the device.
///
/// # Errors
/// Any failure is returned as [`PipelineError::Unexpected`].
#[instrument(skip(ctx, snapshot, device), fields(device_id = %device.id, snapshot_id = %snapshot.id))]
pub async fn deploy_snapshot_to_device(
    ctx: &EngineContext,
    snapshot: &Snapshot,
    device: &Device,
    user: UserId,
) -> Result<(), PipelineError> {
    retarget_device(ctx, snapshot, device, user)
        .await
        .map_err(PipelineError::unexpected)
}

async fn retarget_device(
    ctx: &EngineContext,
    snapshot: &Snapshot,
    device: &Device,
    user: UserId,
) -> Result<(), PipelineError> {
    let previous = device.target_snapshot_id;
    ctx.devices.set_target_snapshot(device.id, Some(snapshot.id)).await?;
    info!(previous = ?previous, "device target snapshot changed");

    ctx.record(AuditEvent::DeviceTargetSet {
        actor: user,
        error: None,
        application: device.application_id,
        device: device.id,
        snapshot: snapshot.id,
    })
    .await;
    ctx.record(AuditEvent::DeviceUpdated {
        actor: user,
        error: None,
        team: device.team_id,
        device: device.id,
        updates: vec![FieldUpdate::new("targetSnapshotId", previous, Some(snapshot.id))],
    })
    .await;

    let reloaded = ctx
        .devices
        .find_by_id(device.id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("Device '{}' not found", device.id)))?;

    match reloaded.team_id {
        Some(team) => {
            ctx.commands
                .send_command(
                    team,
                    &reloaded,
                    DeviceCommand::Update,
                    json!({ "snapshot": reloaded.target_snapshot_id }),
                )
                .await?;
        }
        None => warn!("device has no team, update command not sent"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Full stage deploy
// ---------------------------------------------------------------------------

/// What [`deploy_pipeline_stage`] started.
#[derive(Debug)]
pub enum DeployOutcome {
    /// Queued; await the handle for the copied snapshot.
    Instance { instance: InstanceId, handle: DeployHandle },
    /// Finished; the device now targets `snapshot`.
    Device { device: DeviceId, snapshot: SnapshotId },
}

/// Deploy `source_stage_id` to the stage after it.
///
/// Validation and source resolution run first, so their errors surface
/// before anything is changed.
#[instrument(skip(ctx, queue))]
pub async fn deploy_pipeline_stage(
    ctx: &EngineContext,
    queue: &TaskQueue,
    pipeline_id: PipelineId,
    source_stage_id: StageId,
    snapshot_id: Option<SnapshotId>,
    user: UserId,
) -> Result<DeployOutcome, PipelineError> {
    let pipeline = load_pipeline(ctx, pipeline_id).await?;
    let source_stage = ctx.pipelines.get_stage(source_stage_id).await?;
    let targets = validate_source_stage_for_deploy(ctx, &pipeline, source_stage.as_ref()).await?;
    let source_stage = source_stage
        .ok_or_else(|| PipelineError::NotFound("Source stage not found".into()))?;

    if let Some(target) = &targets.target_instance {
        if ctx.inflight.is_in_flight(target.id) {
            return Err(PipelineError::DeployInProgress(target.id));
        }
    }

    let source_snapshot = match (&targets.source_instance, &targets.source_device) {
        (Some(instance), _) => {
            let meta = SourceMeta { pipeline: &pipeline, target_stage: &targets.target_stage, user };
            get_or_create_snapshot_for_source_instance(ctx, &source_stage, instance, snapshot_id, meta)
                .await?
        }
        (None, Some(device)) => {
            get_or_create_snapshot_for_source_device(ctx, &source_stage, device, snapshot_id).await?
        }
        (None, None) => {
            return Err(PipelineError::invalid_stage(
                "Source stage must have at least one instance or device",
                400,
            ))
        }
    };

    match (targets.target_instance, targets.target_device) {
        (Some(target_instance), _) => {
            let instance = target_instance.id;
            let request = InstanceDeployRequest {
                pipeline,
                source_stage,
                target_stage: targets.target_stage,
                source_snapshot,
                target_instance,
                source_instance: targets.source_instance.map(|i| i.id),
                source_device: targets.source_device.map(|d| d.id),
                user,
            };
            let handle = deploy_snapshot_to_instance(ctx, queue, request).await?;
            Ok(DeployOutcome::Instance { instance, handle })
        }
        (None, Some(device)) => {
            deploy_snapshot_to_device(ctx, &source_snapshot, &device, user).await?;
            Ok(DeployOutcome::Device { device: device.id, snapshot: source_snapshot.id })
        }
        (None, None) => Err(PipelineError::invalid_stage(
            "Target stage must have at least one instance or device",
            400,
        )),
    }
}
