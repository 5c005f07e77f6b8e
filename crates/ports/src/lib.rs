//! `ports` crate — shared domain models and the collaborator contracts of the
//! deployment pipeline.
//!
//! The engine talks to persistence, the device command bus, instance runtimes
//! and the audit log exclusively through the traits in [`traits`]. The `db`
//! crate implements the store traits against Postgres; [`mock`] provides
//! in-memory implementations for tests.

pub mod ids;
pub mod models;
pub mod audit;
pub mod error;
pub mod traits;
pub mod mock;
pub mod detached;

pub use ids::{
    ApplicationId, DeviceId, InstanceId, PipelineId, SnapshotId, StageId, TeamId, UserId,
};
pub use models::{
    Device, Instance, InstanceConfig, InstanceState, NewSnapshot, OwnerRecord, Pipeline,
    PipelineStage, Snapshot, SnapshotFlows, SnapshotOwner, SnapshotSettings, StageAction,
    StageTarget, Team,
};
pub use audit::{AuditEvent, FieldUpdate};
pub use error::StoreError;
pub use traits::{
    AuditSink, DeviceCommand, DeviceCommands, DeviceStore, FlowRuntime, InstanceStore,
    PipelineStore, SnapshotStore, StageLink, TeamDirectory,
};
