//! In-memory test doubles for every collaborator trait.
//!
//! [`MemoryPlatform`] implements all store traits over a single mutex, which
//! also makes its multi-row writes (stage insert + link, stage removal +
//! rewire) atomic. The `Recording*` types capture what the engine sent so
//! tests can assert on it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    AuditEvent, AuditSink, Device, DeviceCommand, DeviceCommands, DeviceId, DeviceStore,
    FlowRuntime, Instance, InstanceConfig, InstanceId, InstanceState, InstanceStore, NewSnapshot,
    Pipeline, PipelineId, PipelineStage, PipelineStore, Snapshot, SnapshotId, SnapshotOwner,
    SnapshotStore, StageId, StageLink, StoreError, Team, TeamDirectory, TeamId,
};

// ---------------------------------------------------------------------------
// MemoryPlatform
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    pipelines: HashMap<PipelineId, Pipeline>,
    stages: HashMap<StageId, PipelineStage>,
    /// Insertion order doubles as creation order.
    snapshots: Vec<Snapshot>,
    instances: HashMap<InstanceId, Instance>,
    live: HashMap<InstanceId, InstanceConfig>,
    derived_secrets: HashMap<InstanceId, String>,
    imports: Vec<(InstanceId, SnapshotId)>,
    devices: HashMap<DeviceId, Device>,
    teams: HashMap<TeamId, Team>,
    fail_imports: bool,
}

/// Every store of the platform, in memory.
#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<MemoryState>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_team(&self, name: &str) -> Team {
        let team = Team { id: TeamId::new(), name: name.into() };
        self.state.lock().unwrap().teams.insert(team.id, team.clone());
        team
    }

    /// Add an instance with its own stored credential secret.
    pub fn add_instance(&self, name: &str, team: Option<TeamId>, state: InstanceState) -> Instance {
        let instance = Instance {
            id: InstanceId::new(),
            name: name.into(),
            state,
            credential_secret: Some(format!("{name}-secret")),
            team_id: team,
            application_id: None,
            device_target_snapshot_id: None,
        };
        self.put_instance(instance.clone());
        instance
    }

    pub fn put_instance(&self, instance: Instance) {
        self.state.lock().unwrap().instances.insert(instance.id, instance);
    }

    pub fn add_device(&self, name: &str, team: Option<TeamId>) -> Device {
        let device = Device {
            id: DeviceId::new(),
            name: name.into(),
            device_type: "raspberry-pi".into(),
            credential_secret: format!("{name}-secret"),
            target_snapshot_id: None,
            active_snapshot_id: None,
            team_id: team,
            application_id: None,
            instance_id: None,
        };
        self.put_device(device.clone());
        device
    }

    pub fn put_device(&self, device: Device) {
        self.state.lock().unwrap().devices.insert(device.id, device);
    }

    pub fn set_live_config(&self, instance: InstanceId, config: InstanceConfig) {
        self.state.lock().unwrap().live.insert(instance, config);
    }

    pub fn set_derived_secret(&self, instance: InstanceId, secret: &str) {
        self.state.lock().unwrap().derived_secrets.insert(instance, secret.into());
    }

    /// Store a fully formed snapshot as-is.
    pub fn put_snapshot(&self, snapshot: Snapshot) {
        self.state.lock().unwrap().snapshots.push(snapshot);
    }

    /// Make every subsequent `import_snapshot` fail.
    pub fn fail_imports(&self) {
        self.state.lock().unwrap().fail_imports = true;
    }

    pub fn instance(&self, id: InstanceId) -> Option<Instance> {
        self.state.lock().unwrap().instances.get(&id).cloned()
    }

    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.state.lock().unwrap().devices.get(&id).cloned()
    }

    pub fn snapshots_of(&self, owner: SnapshotOwner) -> Vec<Snapshot> {
        let state = self.state.lock().unwrap();
        state.snapshots.iter().filter(|s| s.owner == owner).cloned().collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }

    /// `(instance, snapshot)` pairs passed to `import_snapshot`, in call order.
    pub fn imports(&self) -> Vec<(InstanceId, SnapshotId)> {
        self.state.lock().unwrap().imports.clone()
    }

    pub fn stage_count(&self) -> usize {
        self.state.lock().unwrap().stages.len()
    }
}

fn check_link(stage: &PipelineStage, link: &StageLink) -> Result<(), StoreError> {
    if stage.next_stage_id != link.expected_next {
        return Err(StoreError::Conflict(format!("stage {} was relinked", link.stage_id)));
    }
    Ok(())
}

#[async_trait]
impl PipelineStore for MemoryPlatform {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        self.state.lock().unwrap().pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>, StoreError> {
        Ok(self.state.lock().unwrap().pipelines.get(&id).cloned())
    }

    async fn delete_pipeline(&self, id: PipelineId) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.pipelines.remove(&id).is_none() {
            return Err(StoreError::not_found("pipeline", id));
        }
        state.stages.retain(|_, stage| stage.pipeline_id != id);
        Ok(())
    }

    async fn list_stages(&self, pipeline_id: PipelineId) -> Result<Vec<PipelineStage>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .stages
            .values()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn get_stage(&self, id: StageId) -> Result<Option<PipelineStage>, StoreError> {
        Ok(self.state.lock().unwrap().stages.get(&id).cloned())
    }

    async fn insert_stage(
        &self,
        stage: &PipelineStage,
        link: Option<StageLink>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        match link {
            Some(link) => {
                let source = state
                    .stages
                    .get_mut(&link.stage_id)
                    .ok_or_else(|| StoreError::not_found("stage", link.stage_id))?;
                check_link(source, &link)?;
                source.next_stage_id = link.next_stage_id;
            }
            None => {
                if state.stages.values().any(|s| s.pipeline_id == stage.pipeline_id) {
                    return Err(StoreError::Conflict(format!(
                        "pipeline {} already has stages",
                        stage.pipeline_id
                    )));
                }
            }
        }
        state.stages.insert(stage.id, stage.clone());
        Ok(())
    }

    async fn update_stage(&self, stage: &PipelineStage) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .stages
            .get_mut(&stage.id)
            .ok_or_else(|| StoreError::not_found("stage", stage.id))?;
        stored.name = stage.name.clone();
        stored.action = stage.action.clone();
        stored.instances = stage.instances.clone();
        stored.devices = stage.devices.clone();
        Ok(())
    }

    async fn remove_stage(&self, id: StageId, rewire: Option<StageLink>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.stages.contains_key(&id) {
            return Err(StoreError::not_found("stage", id));
        }
        if let Some(link) = rewire {
            let prev = state
                .stages
                .get(&link.stage_id)
                .ok_or_else(|| StoreError::not_found("stage", link.stage_id))?;
            check_link(prev, &link)?;
        }
        state.stages.remove(&id);
        if let Some(link) = rewire {
            if let Some(prev) = state.stages.get_mut(&link.stage_id) {
                prev.next_stage_id = link.next_stage_id;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryPlatform {
    async fn find_by_id(&self, id: SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.snapshots.iter().find(|s| s.id == id).cloned())
    }

    async fn create(&self, snapshot: NewSnapshot) -> Result<Snapshot, StoreError> {
        let snapshot = snapshot.into_snapshot();
        self.state.lock().unwrap().snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn destroy(&self, id: SnapshotId) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let before = state.snapshots.len();
        state.snapshots.retain(|s| s.id != id);
        if state.snapshots.len() == before {
            return Err(StoreError::not_found("snapshot", id));
        }
        for device in state.devices.values_mut() {
            if device.target_snapshot_id == Some(id) {
                device.target_snapshot_id = None;
            }
            if device.active_snapshot_id == Some(id) {
                device.active_snapshot_id = None;
            }
        }
        for instance in state.instances.values_mut() {
            if instance.device_target_snapshot_id == Some(id) {
                instance.device_target_snapshot_id = None;
            }
        }
        Ok(())
    }

    async fn latest_for_owner(&self, owner: SnapshotOwner) -> Result<Option<Snapshot>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.snapshots.iter().rev().find(|s| s.owner == owner).cloned())
    }

    async fn list_for_owner(&self, owner: SnapshotOwner) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.snapshots.iter().rev().filter(|s| s.owner == owner).cloned().collect())
    }
}

#[async_trait]
impl InstanceStore for MemoryPlatform {
    async fn find_by_id(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        Ok(self.instance(id))
    }

    async fn derived_credential_secret(&self, id: InstanceId) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().unwrap().derived_secrets.get(&id).cloned())
    }

    async fn current_config(&self, id: InstanceId) -> Result<InstanceConfig, StoreError> {
        let state = self.state.lock().unwrap();
        if !state.instances.contains_key(&id) {
            return Err(StoreError::not_found("instance", id));
        }
        Ok(state.live.get(&id).cloned().unwrap_or_default())
    }

    async fn import_snapshot(&self, id: InstanceId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_imports {
            return Err(StoreError::Runtime(format!("instance {id} rejected the import")));
        }
        state.imports.push((id, snapshot.id));
        state.live.insert(
            id,
            InstanceConfig {
                flows: snapshot.flows.flows.clone(),
                credentials: snapshot.flows.credentials.clone(),
                settings: snapshot.settings.settings.clone(),
                env: snapshot.settings.env.clone(),
                modules: snapshot.settings.modules.clone(),
            },
        );
        Ok(())
    }

    async fn set_device_target(
        &self,
        id: InstanceId,
        snapshot: Option<SnapshotId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("instance", id))?;
        instance.device_target_snapshot_id = snapshot;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for MemoryPlatform {
    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.device(id))
    }

    async fn set_target_snapshot(
        &self,
        id: DeviceId,
        snapshot: Option<SnapshotId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("device", id))?;
        device.target_snapshot_id = snapshot;
        Ok(())
    }

    async fn set_credential_secret(&self, id: DeviceId, secret: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("device", id))?;
        device.credential_secret = secret.into();
        Ok(())
    }
}

#[async_trait]
impl TeamDirectory for MemoryPlatform {
    async fn find_team(&self, id: TeamId) -> Result<Option<Team>, StoreError> {
        Ok(self.state.lock().unwrap().teams.get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// RecordingCommands
// ---------------------------------------------------------------------------

/// Where a recorded command was addressed.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandTarget {
    Device(Device),
    InstanceDevices(InstanceId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub team: TeamId,
    pub target: CommandTarget,
    pub command: DeviceCommand,
    pub payload: Value,
}

/// Records every command instead of delivering it.
#[derive(Default)]
pub struct RecordingCommands {
    sent: Mutex<Vec<SentCommand>>,
}

impl RecordingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceCommands for RecordingCommands {
    async fn send_command(
        &self,
        team: TeamId,
        device: &Device,
        command: DeviceCommand,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.sent.lock().unwrap().push(SentCommand {
            team,
            target: CommandTarget::Device(device.clone()),
            command,
            payload,
        });
        Ok(())
    }

    async fn send_to_instance_devices(
        &self,
        team: TeamId,
        instance: InstanceId,
        command: DeviceCommand,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.sent.lock().unwrap().push(SentCommand {
            team,
            target: CommandTarget::InstanceDevices(instance),
            command,
            payload,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingRuntime
// ---------------------------------------------------------------------------

/// Records flow restarts; optionally fails every restart.
#[derive(Default)]
pub struct RecordingRuntime {
    restarts: Mutex<Vec<InstanceId>>,
    failing: bool,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { restarts: Mutex::new(Vec::new()), failing: true }
    }

    pub fn restarts(&self) -> Vec<InstanceId> {
        self.restarts.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlowRuntime for RecordingRuntime {
    async fn restart_flows(&self, instance: &Instance) -> Result<(), StoreError> {
        self.restarts.lock().unwrap().push(instance.id);
        if self.failing {
            return Err(StoreError::Runtime(format!("restart of {} failed", instance.id)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingAudit
// ---------------------------------------------------------------------------

/// Keeps every audit event in emission order.
#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(AuditEvent::name).collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
