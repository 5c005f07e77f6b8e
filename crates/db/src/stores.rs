//! Postgres implementations of the `ports` store traits.

use async_trait::async_trait;
use ports::{
    AuditEvent, AuditSink, Device, DeviceId, DeviceStore, Instance, InstanceConfig, InstanceId,
    InstanceStore, NewSnapshot, Pipeline, PipelineId, PipelineStage, PipelineStore, Snapshot,
    SnapshotId, SnapshotOwner, SnapshotStore, StageId, StageLink, StoreError, Team,
    TeamDirectory, TeamId,
};
use tracing::debug;
use uuid::Uuid;

use crate::mapping::{owner_columns, stage_from_rows};
use crate::models::{AuditRow, InstanceStorageRow, PipelineRow, SnapshotRow, StageRow};
use crate::repository::{audit, devices, instances, pipelines, snapshots, stages, teams};
use crate::{DbError, DbPool};

/// Every pipeline store, backed by one pool.
#[derive(Debug, Clone)]
pub struct PgStores {
    pool: DbPool,
}

impl PgStores {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn load_stages(&self, rows: Vec<StageRow>) -> Result<Vec<PipelineStage>, DbError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let bound_instances = stages::list_stage_instances(&self.pool, &ids).await?;
        let bound_devices = stages::list_stage_devices(&self.pool, &ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| stage_from_rows(row, &bound_instances, &bound_devices))
            .collect())
    }
}

fn stage_row(stage: &PipelineStage) -> StageRow {
    StageRow {
        id: stage.id.as_uuid(),
        pipeline_id: stage.pipeline_id.as_uuid(),
        name: stage.name.clone(),
        action: stage.action.to_string(),
        next_stage_id: stage.next_stage_id.map(|s| s.as_uuid()),
    }
}

fn target_ids<T: Copy>(ids: &[T], as_uuid: impl Fn(T) -> Uuid) -> Vec<Uuid> {
    ids.iter().copied().map(as_uuid).collect()
}

// ---------------------------------------------------------------------------
// PipelineStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineStore for PgStores {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let row = PipelineRow {
            id: pipeline.id.as_uuid(),
            name: pipeline.name.clone(),
            application_id: pipeline.application_id.as_uuid(),
            created_at: pipeline.created_at,
        };
        pipelines::insert_pipeline(&self.pool, &row).await?;
        Ok(())
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>, StoreError> {
        Ok(pipelines::get_pipeline(&self.pool, id.as_uuid()).await?.map(Pipeline::from))
    }

    async fn delete_pipeline(&self, id: PipelineId) -> Result<(), StoreError> {
        pipelines::delete_pipeline(&self.pool, id.as_uuid()).await?;
        Ok(())
    }

    async fn list_stages(&self, pipeline_id: PipelineId) -> Result<Vec<PipelineStage>, StoreError> {
        let rows = stages::list_stage_rows(&self.pool, pipeline_id.as_uuid()).await?;
        Ok(self.load_stages(rows).await?)
    }

    async fn get_stage(&self, id: StageId) -> Result<Option<PipelineStage>, StoreError> {
        let Some(row) = stages::get_stage_row(&self.pool, id.as_uuid()).await? else {
            return Ok(None);
        };
        Ok(self.load_stages(vec![row]).await?.into_iter().next())
    }

    async fn insert_stage(
        &self,
        stage: &PipelineStage,
        link: Option<StageLink>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let pipeline_id = stage.pipeline_id.as_uuid();
        stages::lock_pipeline(&mut tx, pipeline_id).await?;
        if link.is_none() && stages::count_stages(&mut tx, pipeline_id).await? > 0 {
            return Err(DbError::Conflict(format!("pipeline {pipeline_id} already has stages")).into());
        }

        stages::insert_stage_row(&mut tx, &stage_row(stage)).await?;
        stages::replace_stage_targets(
            &mut tx,
            stage.id.as_uuid(),
            &target_ids(&stage.instances, |i| i.as_uuid()),
            &target_ids(&stage.devices, |d| d.as_uuid()),
        )
        .await?;
        if let Some(link) = link {
            stages::set_next_stage(
                &mut tx,
                link.stage_id.as_uuid(),
                link.expected_next.map(|s| s.as_uuid()),
                link.next_stage_id.map(|s| s.as_uuid()),
            )
            .await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        debug!(stage_id = %stage.id, "stage row inserted");
        Ok(())
    }

    async fn update_stage(&self, stage: &PipelineStage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        stages::update_stage_row(&mut tx, &stage_row(stage)).await?;
        stages::replace_stage_targets(
            &mut tx,
            stage.id.as_uuid(),
            &target_ids(&stage.instances, |i| i.as_uuid()),
            &target_ids(&stage.devices, |d| d.as_uuid()),
        )
        .await?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn remove_stage(&self, id: StageId, rewire: Option<StageLink>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        // Rewire before the delete; the foreign key would null the link first.
        if let Some(link) = rewire {
            stages::set_next_stage(
                &mut tx,
                link.stage_id.as_uuid(),
                link.expected_next.map(|s| s.as_uuid()),
                link.next_stage_id.map(|s| s.as_uuid()),
            )
            .await?;
        }
        stages::delete_stage_row(&mut tx, id.as_uuid()).await?;

        tx.commit().await.map_err(DbError::from)?;
        debug!(stage_id = %id, "stage row removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SnapshotStore for PgStores {
    async fn find_by_id(&self, id: SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        match snapshots::get_snapshot(&self.pool, id.as_uuid()).await? {
            Some(row) => Ok(Some(Snapshot::try_from(row)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, snapshot: NewSnapshot) -> Result<Snapshot, StoreError> {
        let snapshot = snapshot.into_snapshot();
        snapshots::insert_snapshot(&self.pool, &SnapshotRow::from_snapshot(&snapshot)?).await?;
        Ok(snapshot)
    }

    async fn destroy(&self, id: SnapshotId) -> Result<(), StoreError> {
        snapshots::delete_snapshot(&self.pool, id.as_uuid()).await?;
        Ok(())
    }

    async fn latest_for_owner(&self, owner: SnapshotOwner) -> Result<Option<Snapshot>, StoreError> {
        let (owner_type, owner_id) = owner_columns(owner);
        let rows = snapshots::list_owner_snapshots(&self.pool, owner_type, owner_id, Some(1)).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(Snapshot::try_from(row)?)),
            None => Ok(None),
        }
    }

    async fn list_for_owner(&self, owner: SnapshotOwner) -> Result<Vec<Snapshot>, StoreError> {
        let (owner_type, owner_id) = owner_columns(owner);
        let rows = snapshots::list_owner_snapshots(&self.pool, owner_type, owner_id, None).await?;
        let snapshots = rows
            .into_iter()
            .map(Snapshot::try_from)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(snapshots)
    }
}

// ---------------------------------------------------------------------------
// InstanceStore
// ---------------------------------------------------------------------------

#[async_trait]
impl InstanceStore for PgStores {
    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        match instances::get_instance(&self.pool, id.as_uuid()).await? {
            Some(row) => Ok(Some(Instance::from(row))),
            None => Ok(None),
        }
    }

    async fn derived_credential_secret(&self, id: InstanceId) -> Result<Option<String>, StoreError> {
        let storage = instances::get_storage(&self.pool, id.as_uuid()).await?;
        Ok(storage.and_then(|s| s.credential_secret))
    }

    async fn current_config(&self, id: InstanceId) -> Result<InstanceConfig, StoreError> {
        if instances::get_instance(&self.pool, id.as_uuid()).await?.is_none() {
            return Err(StoreError::not_found("instance", id));
        }
        match instances::get_storage(&self.pool, id.as_uuid()).await? {
            Some(row) => Ok(InstanceConfig::try_from(row)?),
            None => Ok(InstanceConfig::default()),
        }
    }

    async fn import_snapshot(&self, id: InstanceId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let row = InstanceStorageRow {
            instance_id: id.as_uuid(),
            flows: snapshot.flows.flows.clone(),
            credentials: serde_json::to_value(&snapshot.flows.credentials).map_err(DbError::from)?,
            settings: snapshot.settings.settings.clone(),
            env: serde_json::to_value(&snapshot.settings.env).map_err(DbError::from)?,
            modules: snapshot.settings.modules.clone(),
            credential_secret: None,
        };
        instances::upsert_storage(&self.pool, &row).await?;
        debug!(instance_id = %id, snapshot_id = %snapshot.id, "instance storage replaced");
        Ok(())
    }

    async fn set_device_target(
        &self,
        id: InstanceId,
        snapshot: Option<SnapshotId>,
    ) -> Result<(), StoreError> {
        instances::set_device_target(&self.pool, id.as_uuid(), snapshot.map(|s| s.as_uuid())).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DeviceStore
// ---------------------------------------------------------------------------

#[async_trait]
impl DeviceStore for PgStores {
    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(devices::get_device(&self.pool, id.as_uuid()).await?.map(Device::from))
    }

    async fn set_target_snapshot(
        &self,
        id: DeviceId,
        snapshot: Option<SnapshotId>,
    ) -> Result<(), StoreError> {
        devices::set_target_snapshot(&self.pool, id.as_uuid(), snapshot.map(|s| s.as_uuid())).await?;
        Ok(())
    }

    async fn set_credential_secret(&self, id: DeviceId, secret: &str) -> Result<(), StoreError> {
        devices::set_credential_secret(&self.pool, id.as_uuid(), secret).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TeamDirectory
// ---------------------------------------------------------------------------

#[async_trait]
impl TeamDirectory for PgStores {
    async fn find_team(&self, id: TeamId) -> Result<Option<Team>, StoreError> {
        Ok(teams::get_team(&self.pool, id.as_uuid()).await?.map(Team::from))
    }
}

// ---------------------------------------------------------------------------
// PgAuditSink
// ---------------------------------------------------------------------------

/// Writes audit events to the `audit_log` table.
#[derive(Debug, Clone)]
pub struct PgAuditSink {
    pool: DbPool,
}

impl PgAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        let row = AuditRow::from_event(&event)?;
        audit::insert_audit(&self.pool, &row).await?;
        Ok(())
    }
}
