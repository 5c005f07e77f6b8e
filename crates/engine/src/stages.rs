//! Pipeline and stage management.
//!
//! Every write that touches the stage chain is planned on a [`StageGraph`]
//! and handed to the store as one atomic call, so a failure never leaves a
//! stage linked to a missing successor.

use ports::{
    ApplicationId, DeviceId, InstanceId, Pipeline, PipelineId, PipelineStage, StageAction,
    StageId, StageTarget,
};
use tracing::{info, instrument};

use crate::{EngineContext, PipelineError, StageGraph};

/// Attributes of a stage to add.
#[derive(Debug, Clone, Default)]
pub struct NewStage {
    pub name: String,
    pub action: StageAction,
    pub instance_id: Option<InstanceId>,
    pub device_id: Option<DeviceId>,
    /// Stage the new one should follow.
    pub source: Option<StageId>,
}

/// Partial update of a stage. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub name: Option<String>,
    pub action: Option<StageAction>,
    pub instance_id: Option<InstanceId>,
    pub device_id: Option<DeviceId>,
}

fn exactly_one_target(
    instance: Option<InstanceId>,
    device: Option<DeviceId>,
) -> Result<StageTarget, PipelineError> {
    match (instance, device) {
        (Some(_), Some(_)) => Err(PipelineError::InvalidArgument(
            "Cannot add a pipeline stage with both instance and a device".into(),
        )),
        (Some(id), None) => Ok(StageTarget::Instance(id)),
        (None, Some(id)) => Ok(StageTarget::Device(id)),
        (None, None) => Err(PipelineError::InvalidArgument(
            "Param instanceId or deviceId is required when creating a new pipeline stage".into(),
        )),
    }
}

pub(crate) async fn load_pipeline(
    ctx: &EngineContext,
    id: PipelineId,
) -> Result<Pipeline, PipelineError> {
    ctx.pipelines
        .get_pipeline(id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("Pipeline '{id}' not found")))
}

pub(crate) async fn load_graph(
    ctx: &EngineContext,
    pipeline_id: PipelineId,
) -> Result<StageGraph, PipelineError> {
    let stages = ctx.pipelines.list_stages(pipeline_id).await?;
    Ok(StageGraph::from_stages(pipeline_id, stages))
}

pub async fn create_pipeline(
    ctx: &EngineContext,
    application_id: ApplicationId,
    name: impl Into<String>,
) -> Result<Pipeline, PipelineError> {
    let pipeline = Pipeline::new(name, application_id);
    ctx.pipelines.create_pipeline(&pipeline).await?;
    info!(pipeline_id = %pipeline.id, application_id = %application_id, "pipeline created");
    Ok(pipeline)
}

/// Add a stage bound to exactly one instance or device.
///
/// # Errors
/// - [`PipelineError::InvalidArgument`] unless exactly one target is given.
/// - [`PipelineError::InvalidStage`] if `source` is not a stage of `pipeline`.
/// - [`PipelineError::StageConflict`] if the chain changed while planning.
#[instrument(skip(ctx, new), fields(pipeline_id = %pipeline.id))]
pub async fn add_pipeline_stage(
    ctx: &EngineContext,
    pipeline: &Pipeline,
    new: NewStage,
) -> Result<PipelineStage, PipelineError> {
    let target = exactly_one_target(new.instance_id, new.device_id)?;

    let graph = load_graph(ctx, pipeline.id).await?;
    let mut stage = PipelineStage::new(pipeline.id, new.name, new.action, target);
    let plan = graph.plan_insert(stage.id, new.source)?;
    stage.next_stage_id = plan.next_stage_id;

    ctx.pipelines.insert_stage(&stage, plan.link).await?;

    info!(stage_id = %stage.id, after = ?plan.link.map(|l| l.stage_id), "pipeline stage added");
    Ok(stage)
}

pub async fn update_pipeline_stage(
    ctx: &EngineContext,
    stage_id: StageId,
    update: StageUpdate,
) -> Result<PipelineStage, PipelineError> {
    let retarget = match (update.instance_id, update.device_id) {
        (None, None) => None,
        (instance, device) => Some(exactly_one_target(instance, device)?),
    };

    let mut stage = ctx
        .pipelines
        .get_stage(stage_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("Stage '{stage_id}' not found")))?;

    if let Some(name) = update.name {
        stage.name = name;
    }
    if let Some(action) = update.action {
        stage.action = action;
    }
    if let Some(target) = retarget {
        stage.bind(target);
    }

    ctx.pipelines.update_stage(&stage).await?;
    info!(stage_id = %stage.id, "pipeline stage updated");
    Ok(stage)
}

/// Delete a stage, re-pointing its predecessor at its successor. The bound
/// instance or device is left alone.
#[instrument(skip(ctx))]
pub async fn delete_pipeline_stage(
    ctx: &EngineContext,
    stage_id: StageId,
) -> Result<(), PipelineError> {
    let stage = ctx
        .pipelines
        .get_stage(stage_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("Stage '{stage_id}' not found")))?;

    let graph = load_graph(ctx, stage.pipeline_id).await?;
    let plan = graph.plan_removal(stage_id)?;
    ctx.pipelines.remove_stage(stage_id, plan.rewire).await?;

    info!(pipeline_id = %stage.pipeline_id, rewired = ?plan.rewire, "pipeline stage deleted");
    Ok(())
}

pub async fn delete_pipeline(ctx: &EngineContext, id: PipelineId) -> Result<(), PipelineError> {
    load_pipeline(ctx, id).await?;
    ctx.pipelines.delete_pipeline(id).await?;
    info!(pipeline_id = %id, "pipeline deleted");
    Ok(())
}

/// Stages of a pipeline in chain order.
pub async fn list_pipeline_stages(
    ctx: &EngineContext,
    pipeline_id: PipelineId,
) -> Result<Vec<PipelineStage>, PipelineError> {
    let graph = load_graph(ctx, pipeline_id).await?;
    Ok(graph.ordered()?.into_iter().cloned().collect())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::Harness;
    use async_trait::async_trait;
    use ports::mock::MemoryPlatform;
    use ports::{PipelineStore, StageLink, StoreError};

    fn on_instance(name: &str, source: Option<StageId>) -> NewStage {
        NewStage {
            name: name.into(),
            action: StageAction::CreateSnapshot,
            instance_id: Some(InstanceId::new()),
            device_id: None,
            source,
        }
    }

    #[tokio::test]
    async fn both_or_neither_target_fail_with_the_same_kind() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;

        let both = NewStage {
            instance_id: Some(InstanceId::new()),
            device_id: Some(DeviceId::new()),
            ..Default::default()
        };
        let neither = NewStage::default();

        for stage in [both, neither] {
            let err = add_pipeline_stage(&h.ctx, &pipeline, stage).await.unwrap_err();
            assert!(matches!(err, PipelineError::InvalidArgument(_)));
        }
        assert_eq!(h.platform.stage_count(), 0);
    }

    #[tokio::test]
    async fn source_stage_is_linked_to_new_stage() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;

        let a = add_pipeline_stage(&h.ctx, &pipeline, on_instance("a", None)).await.unwrap();
        let b = add_pipeline_stage(&h.ctx, &pipeline, on_instance("b", Some(a.id))).await.unwrap();

        let a = h.ctx.pipelines.get_stage(a.id).await.unwrap().unwrap();
        assert_eq!(a.next_stage_id, Some(b.id));
        assert_eq!(b.instances.len(), 1);
        assert!(b.devices.is_empty());
    }

    #[tokio::test]
    async fn source_in_another_pipeline_is_rejected() {
        let h = Harness::new();
        let first = h.pipeline().await;
        let second = h.pipeline().await;

        let a = add_pipeline_stage(&h.ctx, &first, on_instance("a", None)).await.unwrap();
        let err = add_pipeline_stage(&h.ctx, &second, on_instance("b", Some(a.id)))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "invalid_stage");
        assert_eq!(h.platform.stage_count(), 1);
    }

    #[tokio::test]
    async fn deleting_middle_stage_rewires_chain() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let s1 = add_pipeline_stage(&h.ctx, &pipeline, on_instance("1", None)).await.unwrap();
        let s2 = add_pipeline_stage(&h.ctx, &pipeline, on_instance("2", Some(s1.id))).await.unwrap();
        let s3 = add_pipeline_stage(&h.ctx, &pipeline, on_instance("3", Some(s2.id))).await.unwrap();

        delete_pipeline_stage(&h.ctx, s2.id).await.unwrap();

        let s1 = h.ctx.pipelines.get_stage(s1.id).await.unwrap().unwrap();
        assert_eq!(s1.next_stage_id, Some(s3.id));
        let order: Vec<_> = list_pipeline_stages(&h.ctx, pipeline.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(order, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn deleting_last_stage_clears_predecessor() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let s1 = add_pipeline_stage(&h.ctx, &pipeline, on_instance("1", None)).await.unwrap();
        let s2 = add_pipeline_stage(&h.ctx, &pipeline, on_instance("2", Some(s1.id))).await.unwrap();

        delete_pipeline_stage(&h.ctx, s2.id).await.unwrap();

        let s1 = h.ctx.pipelines.get_stage(s1.id).await.unwrap().unwrap();
        assert_eq!(s1.next_stage_id, None);
    }

    #[tokio::test]
    async fn update_replaces_the_bound_target() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let stage = add_pipeline_stage(&h.ctx, &pipeline, on_instance("a", None)).await.unwrap();
        let device = DeviceId::new();

        let updated = update_pipeline_stage(
            &h.ctx,
            stage.id,
            StageUpdate {
                device_id: Some(device),
                action: Some(StageAction::UseActiveSnapshot),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(updated.instances.is_empty());
        assert_eq!(updated.devices, vec![device]);
        assert_eq!(updated.action, StageAction::UseActiveSnapshot);
        assert_eq!(updated.name, "a");
    }

    #[tokio::test]
    async fn update_with_both_targets_is_rejected() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let stage = add_pipeline_stage(&h.ctx, &pipeline, on_instance("a", None)).await.unwrap();

        let err = update_pipeline_stage(
            &h.ctx,
            stage.id,
            StageUpdate {
                instance_id: Some(InstanceId::new()),
                device_id: Some(DeviceId::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn deleting_pipeline_removes_its_stages() {
        let h = Harness::new();
        let pipeline = h.pipeline().await;
        let a = add_pipeline_stage(&h.ctx, &pipeline, on_instance("a", None)).await.unwrap();
        add_pipeline_stage(&h.ctx, &pipeline, on_instance("b", Some(a.id))).await.unwrap();

        delete_pipeline(&h.ctx, pipeline.id).await.unwrap();

        assert_eq!(h.platform.stage_count(), 0);
        assert!(h.ctx.pipelines.get_pipeline(pipeline.id).await.unwrap().is_none());
        assert_eq!(
            delete_pipeline(&h.ctx, pipeline.id).await.unwrap_err().code(),
            "not_found"
        );
    }

    /// Store that yields after every chain read so two writers plan against
    /// the same view of the chain.
    struct YieldingStages(Arc<MemoryPlatform>);

    #[async_trait]
    impl PipelineStore for YieldingStages {
        async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
            self.0.create_pipeline(pipeline).await
        }

        async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>, StoreError> {
            self.0.get_pipeline(id).await
        }

        async fn delete_pipeline(&self, id: PipelineId) -> Result<(), StoreError> {
            self.0.delete_pipeline(id).await
        }

        async fn list_stages(&self, pipeline_id: PipelineId) -> Result<Vec<PipelineStage>, StoreError> {
            let stages = self.0.list_stages(pipeline_id).await;
            tokio::task::yield_now().await;
            stages
        }

        async fn get_stage(&self, id: StageId) -> Result<Option<PipelineStage>, StoreError> {
            self.0.get_stage(id).await
        }

        async fn insert_stage(
            &self,
            stage: &PipelineStage,
            link: Option<StageLink>,
        ) -> Result<(), StoreError> {
            self.0.insert_stage(stage, link).await
        }

        async fn update_stage(&self, stage: &PipelineStage) -> Result<(), StoreError> {
            self.0.update_stage(stage).await
        }

        async fn remove_stage(&self, id: StageId, rewire: Option<StageLink>) -> Result<(), StoreError> {
            self.0.remove_stage(id, rewire).await
        }
    }

    fn racing_harness() -> Harness {
        let mut h = Harness::new();
        h.ctx.pipelines = Arc::new(YieldingStages(h.platform.clone()));
        h
    }

    fn one_conflict(results: [&Result<PipelineStage, PipelineError>; 2]) {
        let lost: Vec<_> = results.into_iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(lost.len(), 1, "exactly one concurrent write must win");
        assert!(matches!(lost[0], PipelineError::StageConflict(_)), "{}", lost[0]);
        assert_eq!(lost[0].status(), 409);
    }

    #[tokio::test]
    async fn concurrent_inserts_after_one_source_keep_a_single_chain() {
        let h = racing_harness();
        let pipeline = h.pipeline().await;
        let first = add_pipeline_stage(&h.ctx, &pipeline, on_instance("first", None)).await.unwrap();
        add_pipeline_stage(&h.ctx, &pipeline, on_instance("last", None)).await.unwrap();

        let (b, c) = tokio::join!(
            add_pipeline_stage(&h.ctx, &pipeline, on_instance("b", Some(first.id))),
            add_pipeline_stage(&h.ctx, &pipeline, on_instance("c", Some(first.id))),
        );
        one_conflict([&b, &c]);

        let order: Vec<_> = list_pipeline_stages(&h.ctx, pipeline.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], "first");
        assert_eq!(order[2], "last");
        assert_eq!(h.platform.stage_count(), 3);
    }

    #[tokio::test]
    async fn concurrent_tail_appends_keep_a_single_chain() {
        let h = racing_harness();
        let pipeline = h.pipeline().await;
        add_pipeline_stage(&h.ctx, &pipeline, on_instance("first", None)).await.unwrap();

        let (b, c) = tokio::join!(
            add_pipeline_stage(&h.ctx, &pipeline, on_instance("b", None)),
            add_pipeline_stage(&h.ctx, &pipeline, on_instance("c", None)),
        );
        one_conflict([&b, &c]);

        assert_eq!(list_pipeline_stages(&h.ctx, pipeline.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_stages_keep_a_single_head() {
        let h = racing_harness();
        let pipeline = h.pipeline().await;

        let (a, b) = tokio::join!(
            add_pipeline_stage(&h.ctx, &pipeline, on_instance("a", None)),
            add_pipeline_stage(&h.ctx, &pipeline, on_instance("b", None)),
        );
        one_conflict([&a, &b]);

        assert_eq!(list_pipeline_stages(&h.ctx, pipeline.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_racing_a_delete_of_the_successor_is_rejected() {
        let h = racing_harness();
        let pipeline = h.pipeline().await;
        let s1 = add_pipeline_stage(&h.ctx, &pipeline, on_instance("1", None)).await.unwrap();
        let s2 = add_pipeline_stage(&h.ctx, &pipeline, on_instance("2", None)).await.unwrap();
        add_pipeline_stage(&h.ctx, &pipeline, on_instance("3", None)).await.unwrap();

        let (deleted, inserted) = tokio::join!(
            delete_pipeline_stage(&h.ctx, s2.id),
            add_pipeline_stage(&h.ctx, &pipeline, on_instance("x", Some(s1.id))),
        );
        deleted.unwrap();
        assert!(matches!(inserted, Err(PipelineError::StageConflict(_))));

        let order: Vec<_> = list_pipeline_stages(&h.ctx, pipeline.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(order, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn deleting_unknown_stage_is_not_found() {
        let h = Harness::new();
        let err = delete_pipeline_stage(&h.ctx, StageId::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
