//! Core domain models of the deployment pipeline.
//!
//! These are the in-memory source of truth shared by the engine and every
//! store implementation. Persistence row structs live in the `db` crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use credentials::Credentials;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{
    ApplicationId, DeviceId, InstanceId, PipelineId, SnapshotId, StageId, TeamId, UserId,
};

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An ordered promotion path for snapshots, scoped to an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub application_id: ApplicationId,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, application_id: ApplicationId) -> Self {
        Self {
            id: PipelineId::new(),
            name: name.into(),
            application_id,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// StageAction
// ---------------------------------------------------------------------------

/// How a stage obtains the snapshot it deploys to the next stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageAction {
    CreateSnapshot,
    UseLatestSnapshot,
    Prompt,
    UseActiveSnapshot,
    /// A stored value this build does not know. Deploys reject it.
    Unknown(String),
}

impl std::fmt::Display for StageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateSnapshot    => write!(f, "create_snapshot"),
            Self::UseLatestSnapshot => write!(f, "use_latest_snapshot"),
            Self::Prompt            => write!(f, "prompt"),
            Self::UseActiveSnapshot => write!(f, "use_active_snapshot"),
            Self::Unknown(other)    => write!(f, "{other}"),
        }
    }
}

impl From<String> for StageAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "create_snapshot"     => Self::CreateSnapshot,
            "use_latest_snapshot" => Self::UseLatestSnapshot,
            "prompt"              => Self::Prompt,
            "use_active_snapshot" => Self::UseActiveSnapshot,
            _                     => Self::Unknown(s),
        }
    }
}

impl From<StageAction> for String {
    fn from(action: StageAction) -> Self {
        action.to_string()
    }
}

impl Default for StageAction {
    fn default() -> Self {
        Self::CreateSnapshot
    }
}

// ---------------------------------------------------------------------------
// PipelineStage
// ---------------------------------------------------------------------------

/// The single thing a stage deploys to or from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum StageTarget {
    Instance(InstanceId),
    Device(DeviceId),
}

/// One step of a pipeline.
///
/// `next_stage_id` is the link to the following stage; the last stage of a
/// pipeline has none. Bound targets are lists because stored rows may carry
/// more than one; the stage API only ever binds exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: StageId,
    pub pipeline_id: PipelineId,
    pub name: String,
    pub action: StageAction,
    pub next_stage_id: Option<StageId>,
    pub instances: Vec<InstanceId>,
    pub devices: Vec<DeviceId>,
}

impl PipelineStage {
    /// A new, unlinked stage bound to `target`.
    pub fn new(
        pipeline_id: PipelineId,
        name: impl Into<String>,
        action: StageAction,
        target: StageTarget,
    ) -> Self {
        let mut stage = Self {
            id: StageId::new(),
            pipeline_id,
            name: name.into(),
            action,
            next_stage_id: None,
            instances: Vec::new(),
            devices: Vec::new(),
        };
        stage.bind(target);
        stage
    }

    /// Replace every bound target with `target`.
    pub fn bind(&mut self, target: StageTarget) {
        self.instances.clear();
        self.devices.clear();
        match target {
            StageTarget::Instance(id) => self.instances.push(id),
            StageTarget::Device(id) => self.devices.push(id),
        }
    }

    pub fn target_count(&self) -> usize {
        self.instances.len() + self.devices.len()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Who a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "ownerType", content = "ownerId", rename_all = "snake_case")]
pub enum SnapshotOwner {
    Instance(InstanceId),
    Device(DeviceId),
}

impl SnapshotOwner {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Instance(_) => "instance",
            Self::Device(_) => "device",
        }
    }
}

/// Runtime settings captured in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSettings {
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub modules: Value,
}

/// Flow graph plus the credentials blob of its nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFlows {
    #[serde(default)]
    pub flows: Value,
    #[serde(default)]
    pub credentials: Credentials,
}

/// An immutable capture of an instance's or device's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: SnapshotId,
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub owner: SnapshotOwner,
    pub user_id: Option<UserId>,
    pub settings: SnapshotSettings,
    pub flows: SnapshotFlows,
    /// Key the credentials blob is sealed with. Never exported.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub credential_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Attributes of a snapshot about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub name: String,
    pub description: String,
    pub owner: SnapshotOwner,
    pub user_id: Option<UserId>,
    pub settings: SnapshotSettings,
    pub flows: SnapshotFlows,
    pub credential_secret: Option<String>,
}

impl NewSnapshot {
    /// Materialise with a fresh id and the current time.
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot {
            id: SnapshotId::new(),
            name: self.name,
            description: self.description,
            owner: self.owner,
            user_id: self.user_id,
            settings: self.settings,
            flows: self.flows,
            credential_secret: self.credential_secret,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Runtime state of a managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    Running,
    Starting,
    Stopped,
    Suspended,
    Crashed,
    Importing,
    /// Any other platform state (`installing`, `restarting`, `safe`, ...).
    /// Carried through unchanged.
    Other(String),
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running      => write!(f, "running"),
            Self::Starting     => write!(f, "starting"),
            Self::Stopped      => write!(f, "stopped"),
            Self::Suspended    => write!(f, "suspended"),
            Self::Crashed      => write!(f, "crashed"),
            Self::Importing    => write!(f, "importing"),
            Self::Other(other) => write!(f, "{other}"),
        }
    }
}

impl From<String> for InstanceState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running"   => Self::Running,
            "starting"  => Self::Starting,
            "stopped"   => Self::Stopped,
            "suspended" => Self::Suspended,
            "crashed"   => Self::Crashed,
            "importing" => Self::Importing,
            _           => Self::Other(s),
        }
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        state.to_string()
    }
}

/// A managed Node-RED instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    /// Explicit secret, when the instance stores one. Otherwise the store
    /// derives it, see `InstanceStore::derived_credential_secret`.
    pub credential_secret: Option<String>,
    pub team_id: Option<TeamId>,
    pub application_id: Option<ApplicationId>,
    /// Snapshot the devices assigned to this instance should run.
    pub device_target_snapshot_id: Option<SnapshotId>,
}

/// The live configuration of an instance, as captured for a new snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceConfig {
    pub flows: Value,
    /// Sealed with the instance's credential secret.
    pub credentials: Credentials,
    pub settings: Value,
    pub env: BTreeMap<String, String>,
    pub modules: Value,
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A remote runtime that runs its target snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub device_type: String,
    pub credential_secret: String,
    /// Desired state.
    pub target_snapshot_id: Option<SnapshotId>,
    /// Reported state.
    pub active_snapshot_id: Option<SnapshotId>,
    pub team_id: Option<TeamId>,
    pub application_id: Option<ApplicationId>,
    pub instance_id: Option<InstanceId>,
}

// ---------------------------------------------------------------------------
// Team
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

// ---------------------------------------------------------------------------
// OwnerRecord
// ---------------------------------------------------------------------------

/// A loaded snapshot owner.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerRecord {
    Instance(Instance),
    Device(Device),
}

impl OwnerRecord {
    pub fn owner(&self) -> SnapshotOwner {
        match self {
            Self::Instance(i) => SnapshotOwner::Instance(i.id),
            Self::Device(d) => SnapshotOwner::Device(d.id),
        }
    }

    /// `true` when this record is the same kind of owner as `owner`.
    pub fn is_kind_of(&self, owner: &SnapshotOwner) -> bool {
        matches!(
            (self, owner),
            (Self::Instance(_), SnapshotOwner::Instance(_)) | (Self::Device(_), SnapshotOwner::Device(_))
        )
    }

    pub fn team_id(&self) -> Option<TeamId> {
        match self {
            Self::Instance(i) => i.team_id,
            Self::Device(d) => d.team_id,
        }
    }

    /// The secret stored on the owner row, if any.
    pub fn stored_secret(&self) -> Option<&str> {
        match self {
            Self::Instance(i) => i.credential_secret.as_deref(),
            Self::Device(d) => Some(d.credential_secret.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unlisted_instance_states_are_kept_verbatim() {
        let known: InstanceState = serde_json::from_value(json!("suspended")).unwrap();
        assert_eq!(known, InstanceState::Suspended);

        let installing = InstanceState::from("installing".to_string());
        assert_eq!(installing, InstanceState::Other("installing".into()));
        assert_ne!(installing, InstanceState::Running);
        assert_eq!(serde_json::to_value(&installing).unwrap(), json!("installing"));
    }

    #[test]
    fn stage_action_round_trips_known_and_unknown_values() {
        let known: StageAction = serde_json::from_value(json!("use_active_snapshot")).unwrap();
        assert_eq!(known, StageAction::UseActiveSnapshot);

        let unknown: StageAction = serde_json::from_value(json!("rollback")).unwrap();
        assert_eq!(unknown, StageAction::Unknown("rollback".into()));
        assert_eq!(serde_json::to_value(&unknown).unwrap(), json!("rollback"));
    }

    #[test]
    fn binding_replaces_previous_targets() {
        let mut stage = PipelineStage::new(
            PipelineId::new(),
            "dev",
            StageAction::Prompt,
            StageTarget::Instance(InstanceId::new()),
        );
        let device = DeviceId::new();
        stage.bind(StageTarget::Device(device));
        assert!(stage.instances.is_empty());
        assert_eq!(stage.devices, vec![device]);
        assert_eq!(stage.target_count(), 1);
    }

    #[test]
    fn snapshot_json_hides_credential_secret_and_flattens_owner() {
        let instance = InstanceId::new();
        let snapshot = NewSnapshot {
            name: "s".into(),
            description: String::new(),
            owner: SnapshotOwner::Instance(instance),
            user_id: None,
            settings: SnapshotSettings::default(),
            flows: SnapshotFlows::default(),
            credential_secret: None,
        }
        .into_snapshot();

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["ownerType"], "instance");
        assert_eq!(value["ownerId"], json!(instance));
        assert!(value.get("credentialSecret").is_none());
    }
}
