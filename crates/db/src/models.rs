//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Conversion to the `ports` domain types lives in [`crate::mapping`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// pipelines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRow {
    pub id: Uuid,
    pub name: String,
    pub application_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// pipeline_stages, stage_instances, stage_devices
// ---------------------------------------------------------------------------

/// A persisted stage row without its bound targets.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StageRow {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub name: String,
    /// Raw action string; unknown values are kept.
    pub action: String,
    pub next_stage_id: Option<Uuid>,
}

/// One row of `stage_instances` or `stage_devices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StageTargetRow {
    pub stage_id: Uuid,
    pub target_id: Uuid,
}

// ---------------------------------------------------------------------------
// snapshots
// ---------------------------------------------------------------------------

/// A persisted snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SnapshotRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// `instance` or `device`.
    pub owner_type: String,
    pub owner_id: Uuid,
    pub user_id: Option<Uuid>,
    /// `{ settings, env, modules }`
    pub settings: serde_json::Value,
    /// `{ flows, credentials }`; credentials are always the encrypted envelope.
    pub flows: serde_json::Value,
    pub credential_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// instances, instance_storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstanceRow {
    pub id: Uuid,
    pub name: String,
    pub state: String,
    pub credential_secret: Option<String>,
    pub team_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub device_target_snapshot_id: Option<Uuid>,
}

/// Live configuration of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstanceStorageRow {
    pub instance_id: Uuid,
    pub flows: serde_json::Value,
    pub credentials: serde_json::Value,
    pub settings: serde_json::Value,
    pub env: serde_json::Value,
    pub modules: serde_json::Value,
    pub credential_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeviceRow {
    pub id: Uuid,
    pub name: String,
    pub device_type: String,
    pub credential_secret: String,
    pub target_snapshot_id: Option<Uuid>,
    pub active_snapshot_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// teams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TeamRow {
    pub id: Uuid,
    pub name: String,
}

// ---------------------------------------------------------------------------
// audit_log
// ---------------------------------------------------------------------------

/// One audit log entry. `body` is the full serialised event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditRow {
    pub id: Uuid,
    pub event: String,
    pub actor: Uuid,
    pub error: Option<String>,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
