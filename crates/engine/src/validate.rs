//! Pre-deploy checks of a source stage and its successor.

use ports::{Device, DeviceId, Instance, InstanceId, Pipeline, PipelineStage, TeamId};
use tracing::debug;

use crate::{EngineContext, PipelineError};

/// The resolved ends of a deploy. Exactly one `source_*` is set; at least one
/// `target_*` is set and an instance target takes precedence.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployTargets {
    pub source_instance: Option<Instance>,
    pub source_device: Option<Device>,
    pub target_instance: Option<Instance>,
    pub target_device: Option<Device>,
    pub target_stage: PipelineStage,
}

async fn load_instances(
    ctx: &EngineContext,
    ids: &[InstanceId],
) -> Result<Vec<Instance>, PipelineError> {
    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        match ctx.instances.find_by_id(*id).await? {
            Some(instance) => found.push(instance),
            None => debug!(instance_id = %id, "stage bound to missing instance"),
        }
    }
    Ok(found)
}

async fn load_devices(ctx: &EngineContext, ids: &[DeviceId]) -> Result<Vec<Device>, PipelineError> {
    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        match ctx.devices.find_by_id(*id).await? {
            Some(device) => found.push(device),
            None => debug!(device_id = %id, "stage bound to missing device"),
        }
    }
    Ok(found)
}

async fn resolve_team(
    ctx: &EngineContext,
    team: Option<TeamId>,
    side: &str,
    kind: &str,
) -> Result<TeamId, PipelineError> {
    let missing = || PipelineError::invalid_stage(format!("{side} {kind} not associated with a team"), 404);
    let id = team.ok_or_else(missing)?;
    ctx.teams.find_team(id).await?.map(|t| t.id).ok_or_else(missing)
}

/// Check that `source_stage` can be deployed to its successor.
///
/// Checks run in a fixed order and the first failure is returned. Nothing is
/// mutated, so repeated calls give the same answer.
pub async fn validate_source_stage_for_deploy(
    ctx: &EngineContext,
    pipeline: &Pipeline,
    source_stage: Option<&PipelineStage>,
) -> Result<DeployTargets, PipelineError> {
    let source_stage =
        source_stage.ok_or_else(|| PipelineError::NotFound("Source stage not found".into()))?;
    if source_stage.pipeline_id != pipeline.id {
        return Err(PipelineError::invalid_stage(
            "Source stage must be part of the same pipeline",
            400,
        ));
    }

    let target_stage = match source_stage.next_stage_id {
        Some(id) => ctx.pipelines.get_stage(id).await?,
        None => None,
    }
    .ok_or_else(|| PipelineError::NotFound("Target stage not found".into()))?;
    if target_stage.pipeline_id != source_stage.pipeline_id {
        return Err(PipelineError::invalid_stage(
            "Target stage must be part of the same pipeline as source stage",
            400,
        ));
    }

    let source_instances = load_instances(ctx, &source_stage.instances).await?;
    let source_devices = load_devices(ctx, &source_stage.devices).await?;
    match source_instances.len() + source_devices.len() {
        0 => {
            return Err(PipelineError::invalid_stage(
                "Source stage must have at least one instance or device",
                400,
            ))
        }
        1 => {}
        _ => {
            return Err(PipelineError::invalid_stage(
                "Deployments are currently only supported for source stages with a single instance or device",
                400,
            ))
        }
    }

    let target_instances = load_instances(ctx, &target_stage.instances).await?;
    let target_devices = load_devices(ctx, &target_stage.devices).await?;
    if target_instances.is_empty() && target_devices.is_empty() {
        return Err(PipelineError::invalid_stage(
            "Target stage must have at least one instance or device",
            400,
        ));
    }
    if target_instances.len() > 1 {
        return Err(PipelineError::invalid_stage(
            "Deployments are currently only supported for target stages with a single instance",
            400,
        ));
    }

    let source_instance = source_instances.into_iter().next();
    let source_device = source_devices.into_iter().next();
    let target_instance = target_instances.into_iter().next();
    let target_device = target_devices.into_iter().next();

    let (source_kind, source_team) = match (&source_instance, &source_device) {
        (Some(i), _) => ("instance", i.team_id),
        (None, Some(d)) => ("device", d.team_id),
        (None, None) => {
            return Err(PipelineError::invalid_stage(
                "Source stage must have at least one instance or device",
                400,
            ))
        }
    };
    let (target_kind, target_team) = match (&target_instance, &target_device) {
        (Some(i), _) => ("instance", i.team_id),
        (None, Some(d)) => ("device", d.team_id),
        (None, None) => {
            return Err(PipelineError::invalid_stage(
                "Target stage must have at least one instance or device",
                400,
            ))
        }
    };

    let source_team = resolve_team(ctx, source_team, "Source", source_kind).await?;
    let target_team = resolve_team(ctx, target_team, "Target", target_kind).await?;
    if source_team != target_team {
        return Err(PipelineError::invalid_stage(
            format!("Source {source_kind} and target {target_kind} must be in the same team"),
            403,
        ));
    }

    Ok(DeployTargets {
        source_instance,
        source_device,
        target_instance,
        target_device,
        target_stage,
    })
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use ports::{InstanceState, PipelineStore, StageAction, StageLink, StageTarget};

    /// Store `source -> target` as the whole chain of an empty pipeline.
    async fn seed(h: &Harness, source: &mut PipelineStage, target: &PipelineStage) {
        let link = StageLink { stage_id: source.id, expected_next: None, next_stage_id: Some(target.id) };
        h.ctx.pipelines.insert_stage(source, None).await.unwrap();
        h.ctx.pipelines.insert_stage(target, Some(link)).await.unwrap();
        source.next_stage_id = Some(target.id);
    }

    async fn link(h: &Harness, pipeline: &Pipeline, source: StageTarget, target: StageTarget) -> PipelineStage {
        let target = PipelineStage::new(pipeline.id, "target", StageAction::Prompt, target);
        let mut source = PipelineStage::new(pipeline.id, "source", StageAction::CreateSnapshot, source);
        seed(h, &mut source, &target).await;
        source
    }

    #[tokio::test]
    async fn missing_source_stage_is_not_found() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let err = validate_source_stage_for_deploy(&h.ctx, &pipeline, None).await.unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(err.to_string(), "Source stage not found");
    }

    #[tokio::test]
    async fn source_stage_of_other_pipeline_is_invalid() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let other = h.pipeline().await;
        let team = h.team();
        let a = h.running_instance("a", team);
        let b = h.running_instance("b", team);
        let source = link(&h, &other, StageTarget::Instance(a.id), StageTarget::Instance(b.id)).await;

        let err = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&source)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_stage");
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn last_stage_has_no_target() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let team = h.team();
        let a = h.running_instance("a", team);
        let stage = PipelineStage::new(pipeline.id, "only", StageAction::Prompt, StageTarget::Instance(a.id));
        h.ctx.pipelines.insert_stage(&stage, None).await.unwrap();

        let err = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&stage)).await.unwrap_err();
        assert_eq!(err.to_string(), "Target stage not found");
    }

    #[tokio::test]
    async fn target_with_two_instances_is_rejected() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let team = h.team();
        let a = h.running_instance("a", team);
        let b1 = h.running_instance("b1", team);
        let b2 = h.running_instance("b2", team);

        let mut target = PipelineStage::new(pipeline.id, "target", StageAction::Prompt, StageTarget::Instance(b1.id));
        target.instances.push(b2.id);
        let mut source = PipelineStage::new(pipeline.id, "source", StageAction::CreateSnapshot, StageTarget::Instance(a.id));
        seed(&h, &mut source, &target).await;

        let err = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&source)).await.unwrap_err();
        assert_eq!(err.code(), "invalid_stage");
        assert!(err.to_string().contains("only supported for target stages with a single instance"));
    }

    #[tokio::test]
    async fn source_with_two_targets_is_rejected() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let team = h.team();
        let a = h.running_instance("a", team);
        let d = h.platform.add_device("d", Some(team));
        let b = h.running_instance("b", team);

        let target = PipelineStage::new(pipeline.id, "target", StageAction::Prompt, StageTarget::Instance(b.id));
        let mut source = PipelineStage::new(pipeline.id, "source", StageAction::CreateSnapshot, StageTarget::Instance(a.id));
        source.devices.push(d.id);
        seed(&h, &mut source, &target).await;

        let err = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&source)).await.unwrap_err();
        assert!(err.to_string().contains("single instance or device"));
    }

    #[tokio::test]
    async fn cross_team_pairs_are_forbidden_in_every_direction() {
        let h = Harness::new();
        let red = h.team();
        let blue = h.team();

        let pairs = [
            (StageTarget::Instance(h.running_instance("a", red).id), StageTarget::Instance(h.running_instance("b", blue).id)),
            (StageTarget::Instance(h.running_instance("c", red).id), StageTarget::Device(h.platform.add_device("d", Some(blue)).id)),
            (StageTarget::Device(h.platform.add_device("e", Some(red)).id), StageTarget::Instance(h.running_instance("f", blue).id)),
            (StageTarget::Device(h.platform.add_device("g", Some(red)).id), StageTarget::Device(h.platform.add_device("h", Some(blue)).id)),
        ];

        for (source, target) in pairs {
            let pipeline = h.pipeline().await;
            let stage = link(&h, &pipeline, source, target).await;
            let err = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&stage)).await.unwrap_err();
            assert!(matches!(err, PipelineError::InvalidStage { status: 403, .. }), "{err}");
        }
    }

    #[tokio::test]
    async fn instance_without_team_is_rejected() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let team = h.team();
        let orphan = h.platform.add_instance("orphan", None, InstanceState::Running);
        let b = h.running_instance("b", team);
        let stage = link(&h, &pipeline, StageTarget::Instance(orphan.id), StageTarget::Instance(b.id)).await;

        let err = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&stage)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStage { status: 404, .. }));
    }

    #[tokio::test]
    async fn validation_is_repeatable() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let team = h.team();
        let a = h.running_instance("a", team);
        let d = h.platform.add_device("d", Some(team));
        let stage = link(&h, &pipeline, StageTarget::Instance(a.id), StageTarget::Device(d.id)).await;

        let first = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&stage)).await.unwrap();
        let second = validate_source_stage_for_deploy(&h.ctx, &pipeline, Some(&stage)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.source_instance.unwrap().id, a.id);
        assert_eq!(first.target_device.unwrap().id, d.id);
        assert!(h.audit.events().is_empty());
    }
}
