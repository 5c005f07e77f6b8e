//! `engine` crate — the deployment pipeline core.
//!
//! Stage graph and stage management, deploy validation, source snapshot
//! resolution, snapshot export/import and the deploy orchestrator. All
//! persistence and runtime effects go through the collaborator traits of the
//! `ports` crate, bundled in an [`EngineContext`].

pub mod error;
pub mod config;
pub mod context;
pub mod inflight;
pub mod graph;
pub mod stages;
pub mod validate;
pub mod snapshots;
pub mod source;
pub mod deploy;

pub use error::PipelineError;
pub use config::EngineConfig;
pub use context::EngineContext;
pub use inflight::{InflightGuard, InflightMarker, InflightRegistry};
pub use graph::{InsertPlan, RemovalPlan, StageGraph};
pub use stages::{
    add_pipeline_stage, create_pipeline, delete_pipeline, delete_pipeline_stage,
    list_pipeline_stages, update_pipeline_stage, NewStage, StageUpdate,
};
pub use validate::{validate_source_stage_for_deploy, DeployTargets};
pub use snapshots::{
    copy_snapshot, create_snapshot, delete_snapshot, export_snapshot, get_snapshot,
    platform_env, rotate_device_credentials, runtime_settings, strip_reserved_env,
    upload_snapshot, CopyOptions, CreateSnapshotOptions, ExportOptions, ExportedSnapshot,
    SnapshotPayload,
};
pub use source::{
    get_or_create_snapshot_for_source_device, get_or_create_snapshot_for_source_instance,
    SourceMeta,
};
pub use deploy::{
    begin_instance_deploy, deploy_pipeline_stage, deploy_snapshot_to_device,
    deploy_snapshot_to_instance, is_deploying, DeployHandle, DeployOutcome,
    InstanceDeployRequest, PendingDeploy,
};

#[cfg(test)]
mod testing;
#[cfg(test)]
mod deploy_tests;
