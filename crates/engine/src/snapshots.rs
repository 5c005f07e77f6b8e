//! Snapshot lifecycle: capture, export, upload, copy and delete.
//!
//! Credentials are always persisted sealed. Whenever a snapshot crosses from
//! one owner to another its credentials are opened with the old secret and
//! sealed with the new one inside the cipher.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use credentials::{generate_secret, Credentials};
use ports::{
    AuditEvent, Device, DeviceCommand, Instance, NewSnapshot, OwnerRecord,
    Pipeline, PipelineStage, Snapshot, SnapshotFlows, SnapshotId, SnapshotOwner,
    SnapshotSettings, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::{EngineConfig, EngineContext, PipelineError};

// ---------------------------------------------------------------------------
// Env handling
// ---------------------------------------------------------------------------

/// Copy of `env` without platform-owned keys. Applying it twice changes
/// nothing.
pub fn strip_reserved_env(env: &BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| !key.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Platform env synthesised from the owner's identity.
pub fn platform_env(owner: &OwnerRecord, snapshot: Option<&Snapshot>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    match owner {
        OwnerRecord::Instance(instance) => {
            env.insert("FF_PROJECT_ID".into(), instance.id.to_string());
            env.insert("FF_PROJECT_NAME".into(), instance.name.clone());
        }
        OwnerRecord::Device(device) => {
            if let Some(instance) = device.instance_id {
                env.insert("FF_PROJECT_ID".into(), instance.to_string());
            }
            env.insert("FF_DEVICE_ID".into(), device.id.to_string());
            env.insert("FF_DEVICE_NAME".into(), device.name.clone());
            env.insert("FF_DEVICE_TYPE".into(), device.device_type.clone());
            if let Some(snapshot) = snapshot {
                env.insert("FF_SNAPSHOT_ID".into(), snapshot.id.to_string());
                env.insert("FF_SNAPSHOT_NAME".into(), snapshot.name.clone());
            }
        }
    }
    env
}

// ---------------------------------------------------------------------------
// Owners and secrets
// ---------------------------------------------------------------------------

pub(crate) async fn load_owner(
    ctx: &EngineContext,
    owner: SnapshotOwner,
) -> Result<Option<OwnerRecord>, PipelineError> {
    Ok(match owner {
        SnapshotOwner::Instance(id) => ctx.instances.find_by_id(id).await?.map(OwnerRecord::Instance),
        SnapshotOwner::Device(id) => ctx.devices.find_by_id(id).await?.map(OwnerRecord::Device),
    })
}

/// The owner's stored secret, falling back to the store-derived one.
pub(crate) async fn owner_secret(
    ctx: &EngineContext,
    owner: &OwnerRecord,
) -> Result<Option<String>, PipelineError> {
    if let Some(secret) = owner.stored_secret() {
        return Ok(Some(secret.to_owned()));
    }
    match owner {
        OwnerRecord::Instance(instance) => {
            Ok(ctx.instances.derived_credential_secret(instance.id).await?)
        }
        OwnerRecord::Device(_) => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Secret the exported credentials are sealed with. Nothing is exported
    /// without one.
    pub credential_secret: Option<String>,
    /// Credentials to export instead of the snapshot's own. Encrypted input
    /// is expected to be sealed with `credential_secret` already.
    pub credentials: Option<Credentials>,
    /// Preloaded owner. Must be the same kind as the snapshot's owner.
    pub owner: Option<OwnerRecord>,
}

/// A snapshot whose credentials are sealed with an export secret and whose
/// env holds no platform keys. Never carries a credential secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExportedSnapshot(Snapshot);

impl ExportedSnapshot {
    pub fn snapshot(&self) -> &Snapshot {
        &self.0
    }

    pub fn into_inner(self) -> Snapshot {
        self.0
    }

    /// Re-shape as an upload payload.
    pub fn into_payload(self) -> SnapshotPayload {
        let Snapshot { name, description, settings, flows, .. } = self.0;
        SnapshotPayload {
            name,
            description,
            flows: flows.flows,
            credentials: flows.credentials,
            settings: settings.settings,
            env: settings.env,
            modules: settings.modules,
        }
    }
}

/// Export `snapshot` with its credentials re-sealed under
/// `options.credential_secret`.
///
/// Returns `Ok(None)` when no export secret is given, when the passed owner
/// is of the wrong kind or when the owner no longer exists.
///
/// # Errors
/// [`PipelineError::MissingCredentialSecret`] if the credentials are sealed
/// and no key to open them can be found.
pub async fn export_snapshot(
    ctx: &EngineContext,
    snapshot: &Snapshot,
    options: ExportOptions,
) -> Result<Option<ExportedSnapshot>, PipelineError> {
    let Some(export_secret) = options.credential_secret else {
        return Ok(None);
    };

    let owner = match options.owner {
        Some(owner) if owner.is_kind_of(&snapshot.owner) => owner,
        Some(_) => return Ok(None),
        None => match load_owner(ctx, snapshot.owner).await? {
            Some(owner) => owner,
            None => return Ok(None),
        },
    };

    let explicit_sealed = matches!(options.credentials, Some(Credentials::Encrypted(_)));
    let decrypt_with = if explicit_sealed {
        Some(export_secret.clone())
    } else {
        match &snapshot.credential_secret {
            Some(secret) => Some(secret.clone()),
            None => owner_secret(ctx, &owner).await?,
        }
    };

    let credentials = options.credentials.unwrap_or_else(|| snapshot.flows.credentials.clone());
    let sealed = ctx
        .cipher
        .reencrypt(&credentials, decrypt_with.as_deref(), &export_secret)?;

    let mut result = snapshot.clone();
    result.settings.env = strip_reserved_env(&snapshot.settings.env, &ctx.config.reserved_env_prefix);
    result.flows.credentials = sealed;
    result.credential_secret = None;

    debug!(snapshot_id = %snapshot.id, owner = snapshot.owner.kind(), "snapshot exported");
    Ok(Some(ExportedSnapshot(result)))
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Snapshot content as supplied by a client or produced by an export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub flows: Value,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub modules: Value,
}

fn or_empty_object(value: Value) -> Value {
    if value.is_null() {
        json!({})
    } else {
        value
    }
}

/// Persist `payload` as a new snapshot owned by `owner`.
///
/// Sealed credentials require `credential_secret`, which is checked by
/// opening them. Without a secret the owner's own secret is used.
///
/// # Errors
/// - [`PipelineError::MissingCredentialSecret`] for sealed credentials
///   without a secret, or when no secret can be found at all.
/// - [`PipelineError::Credentials`] when the secret does not open them.
#[instrument(skip(ctx, owner, payload, credential_secret), fields(owner = ?owner.owner()))]
pub async fn upload_snapshot(
    ctx: &EngineContext,
    owner: &OwnerRecord,
    payload: SnapshotPayload,
    credential_secret: Option<&str>,
    user: UserId,
) -> Result<Snapshot, PipelineError> {
    if payload.credentials.is_encrypted() {
        let secret = credential_secret.ok_or(PipelineError::MissingCredentialSecret)?;
        ctx.cipher.reencrypt(&payload.credentials, Some(secret), secret)?;
    }

    let secret = match credential_secret {
        Some(secret) => secret.to_owned(),
        None => owner_secret(ctx, owner)
            .await?
            .ok_or(PipelineError::MissingCredentialSecret)?,
    };

    let credentials = match payload.credentials {
        sealed @ Credentials::Encrypted(_) => sealed,
        Credentials::Plaintext(map) => Credentials::Encrypted(ctx.cipher.encrypt(&map, &secret)?),
    };

    let flows = match payload.flows {
        Value::Null => json!([]),
        flows => flows,
    };

    let snapshot = ctx
        .snapshots
        .create(NewSnapshot {
            name: payload.name,
            description: payload.description,
            owner: owner.owner(),
            user_id: Some(user),
            settings: SnapshotSettings {
                settings: or_empty_object(payload.settings),
                env: strip_reserved_env(&payload.env, &ctx.config.reserved_env_prefix),
                modules: or_empty_object(payload.modules),
            },
            flows: SnapshotFlows { flows, credentials },
            credential_secret: Some(secret),
        })
        .await?;

    info!(snapshot_id = %snapshot.id, "snapshot uploaded");
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Create from live state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CreateSnapshotOptions {
    pub name: String,
    pub description: String,
    /// Make the new snapshot the target of the instance's devices.
    pub set_as_target: bool,
}

/// Persist the instance's live configuration. No audit event is written.
pub(crate) async fn capture_instance_snapshot(
    ctx: &EngineContext,
    instance: &Instance,
    user: UserId,
    name: String,
    description: String,
) -> Result<Snapshot, PipelineError> {
    let owner = OwnerRecord::Instance(instance.clone());
    let secret = owner_secret(ctx, &owner)
        .await?
        .ok_or(PipelineError::MissingCredentialSecret)?;

    let live = ctx.instances.current_config(instance.id).await?;
    let credentials = ctx.cipher.reencrypt(&live.credentials, Some(&secret), &secret)?;

    let snapshot = ctx
        .snapshots
        .create(NewSnapshot {
            name,
            description,
            owner: owner.owner(),
            user_id: Some(user),
            settings: SnapshotSettings {
                settings: or_empty_object(live.settings),
                env: strip_reserved_env(&live.env, &ctx.config.reserved_env_prefix),
                modules: or_empty_object(live.modules),
            },
            flows: SnapshotFlows { flows: live.flows, credentials },
            credential_secret: Some(secret),
        })
        .await?;

    info!(snapshot_id = %snapshot.id, instance_id = %instance.id, "snapshot created from live state");
    Ok(snapshot)
}

async fn set_instance_device_target(
    ctx: &EngineContext,
    instance: &Instance,
    snapshot: Option<SnapshotId>,
) -> Result<(), PipelineError> {
    ctx.instances.set_device_target(instance.id, snapshot).await?;
    if let Some(team) = instance.team_id {
        ctx.commands
            .send_to_instance_devices(team, instance.id, DeviceCommand::Update, json!({ "snapshot": snapshot }))
            .await?;
    }
    info!(instance_id = %instance.id, snapshot_id = ?snapshot, "instance device target changed");
    Ok(())
}

/// Snapshot the instance's live state and record `project.snapshot.created`.
pub async fn create_snapshot(
    ctx: &EngineContext,
    instance: &Instance,
    user: UserId,
    options: CreateSnapshotOptions,
) -> Result<Snapshot, PipelineError> {
    let snapshot =
        capture_instance_snapshot(ctx, instance, user, options.name, options.description).await?;

    if options.set_as_target {
        set_instance_device_target(ctx, instance, Some(snapshot.id)).await?;
    }

    ctx.record(AuditEvent::ProjectSnapshotCreated {
        actor: user,
        error: None,
        instance: instance.id,
        snapshot: snapshot.id,
    })
    .await;
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Copy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Load the copy into the target's running configuration.
    pub import_snapshot: bool,
    /// Make the copy the target of the target instance's devices.
    pub set_as_target: bool,
    /// Opens the source credentials instead of the source's own secret.
    pub decrypt_secret: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub user: UserId,
}

impl CopyOptions {
    pub fn new(user: UserId) -> Self {
        Self {
            import_snapshot: false,
            set_as_target: false,
            decrypt_secret: None,
            name: None,
            description: None,
            user,
        }
    }
}

/// Copy `source` into `target`, re-sealing its credentials for the target.
pub async fn copy_snapshot(
    ctx: &EngineContext,
    source: &Snapshot,
    target: &Instance,
    options: CopyOptions,
) -> Result<Snapshot, PipelineError> {
    let target_owner = OwnerRecord::Instance(target.clone());
    let target_secret = owner_secret(ctx, &target_owner)
        .await?
        .ok_or(PipelineError::MissingCredentialSecret)?;

    let mut source = source.clone();
    if let Some(secret) = options.decrypt_secret {
        source.credential_secret = Some(secret);
    }

    let exported = export_snapshot(
        ctx,
        &source,
        ExportOptions { credential_secret: Some(target_secret.clone()), ..Default::default() },
    )
    .await?
    .ok_or_else(|| PipelineError::NotFound(format!("Owner of snapshot '{}' not found", source.id)))?;

    let mut payload = exported.into_payload();
    if let Some(name) = options.name {
        payload.name = name;
    }
    if let Some(description) = options.description {
        payload.description = description;
    }

    let copy = upload_snapshot(ctx, &target_owner, payload, Some(&target_secret), options.user).await?;

    if options.import_snapshot {
        ctx.instances.import_snapshot(target.id, &copy).await?;
    }
    if options.set_as_target {
        set_instance_device_target(ctx, target, Some(copy.id)).await?;
    }

    info!(source_id = %source.id, copy_id = %copy.id, target_instance = %target.id, "snapshot copied");
    Ok(copy)
}

// ---------------------------------------------------------------------------
// Read / delete / device secret
// ---------------------------------------------------------------------------

pub async fn get_snapshot(ctx: &EngineContext, id: SnapshotId) -> Result<Snapshot, PipelineError> {
    ctx.snapshots
        .find_by_id(id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("Snapshot '{id}' not found")))
}

/// Settings a runtime should start with: stored settings plus the platform
/// env of the snapshot's owner.
pub async fn runtime_settings(
    ctx: &EngineContext,
    snapshot: &Snapshot,
) -> Result<SnapshotSettings, PipelineError> {
    let mut settings = snapshot.settings.clone();
    settings.env = strip_reserved_env(&settings.env, &ctx.config.reserved_env_prefix);
    if let Some(owner) = load_owner(ctx, snapshot.owner).await? {
        settings.env.extend(platform_env(&owner, Some(snapshot)));
    }
    Ok(settings)
}

/// Delete a snapshot.
///
/// When it is the device target of its owning instance the target is
/// cleared first and the instance's devices are told to drop it.
#[instrument(skip(ctx, snapshot), fields(snapshot_id = %snapshot.id))]
pub async fn delete_snapshot(
    ctx: &EngineContext,
    snapshot: &Snapshot,
    user: UserId,
) -> Result<(), PipelineError> {
    if let Some(OwnerRecord::Instance(instance)) = load_owner(ctx, snapshot.owner).await? {
        if instance.device_target_snapshot_id == Some(snapshot.id) {
            set_instance_device_target(ctx, &instance, None).await?;
        }
    }

    ctx.snapshots.destroy(snapshot.id).await?;
    info!(owner = snapshot.owner.kind(), "snapshot deleted");

    ctx.record(AuditEvent::ProjectSnapshotDeleted {
        actor: user,
        error: None,
        owner: snapshot.owner,
        snapshot: snapshot.id,
    })
    .await;
    Ok(())
}

/// Give a device a fresh credential secret and return it.
pub async fn rotate_device_credentials(
    ctx: &EngineContext,
    device: &Device,
) -> Result<String, PipelineError> {
    let secret = generate_secret();
    ctx.devices.set_credential_secret(device.id, &secret).await?;
    info!(device_id = %device.id, "device credential secret rotated");
    Ok(secret)
}

// ---------------------------------------------------------------------------
// Deploy naming
// ---------------------------------------------------------------------------

/// `"<source> - Deploy Snapshot - <timestamp>"`; the source part only when
/// there is a source snapshot.
pub fn deploy_snapshot_name(
    config: &EngineConfig,
    source: Option<&Snapshot>,
    now: DateTime<Utc>,
) -> String {
    let stamp = now.format(&config.snapshot_timestamp_format);
    match source {
        Some(snapshot) => format!("{} - Deploy Snapshot - {stamp}", snapshot.name),
        None => format!("Deploy Snapshot - {stamp}"),
    }
}

pub fn deploy_snapshot_description(
    source_stage: &PipelineStage,
    target_stage: &PipelineStage,
    pipeline: &Pipeline,
    source: Option<&Snapshot>,
) -> String {
    let mut description = format!(
        "Snapshot created for pipeline deployment from {} to {} as part of pipeline {}",
        source_stage.name, target_stage.name, pipeline.name
    );
    if let Some(snapshot) = source.filter(|s| !s.description.is_empty()) {
        description.push_str("\n\n");
        description.push_str(&snapshot.description);
    }
    description
}
