//! End-to-end tests of the deploy orchestrator.
//!
//! Everything runs against the in-memory stores and recording doubles from
//! `ports::mock`, so no Postgres, device bus or Node-RED runtime is needed.

use std::time::Duration;

use credentials::Credentials;
use ports::mock::{CommandTarget, RecordingRuntime};
use ports::{
    AuditEvent, DeviceCommand, FieldUpdate, Instance, InstanceConfig, InstanceState, NewSnapshot,
    Pipeline, PipelineStage, Snapshot, SnapshotOwner, SnapshotStore, StageAction, UserId,
};
use queue::{QueueConfig, TaskQueue};
use serde_json::{json, Map, Value};

use crate::testing::{action, Harness};
use crate::{
    add_pipeline_stage, begin_instance_deploy, deploy_pipeline_stage, is_deploying,
    DeployOutcome, EngineConfig, InstanceDeployRequest, NewStage, PipelineError,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn creds() -> Map<String, Value> {
    json!({ "mqtt": { "user": "svc", "password": "s3cret" } })
        .as_object()
        .cloned()
        .unwrap()
}

struct Chain {
    pipeline: Pipeline,
    source: PipelineStage,
    target: PipelineStage,
}

async fn instance_chain(h: &Harness, action: StageAction, from: &Instance, to: &Instance) -> Chain {
    let pipeline = h.pipeline().await;
    let source = add_pipeline_stage(
        &h.ctx,
        &pipeline,
        NewStage { name: "dev".into(), action, instance_id: Some(from.id), ..Default::default() },
    )
    .await
    .unwrap();
    let target = add_pipeline_stage(
        &h.ctx,
        &pipeline,
        NewStage {
            name: "prod".into(),
            action: StageAction::Prompt,
            instance_id: Some(to.id),
            source: Some(source.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    Chain { pipeline, source, target }
}

fn with_live_flows(h: &Harness, instance: &Instance) {
    h.platform.set_live_config(
        instance.id,
        InstanceConfig {
            flows: json!([{ "id": "n1", "type": "mqtt in" }]),
            credentials: Credentials::Plaintext(creds()),
            env: [("FF_PROJECT_NAME".to_string(), "dev".to_string())].into(),
            ..Default::default()
        },
    );
}

async fn owned_snapshot(h: &Harness, owner: SnapshotOwner, secret: &str) -> Snapshot {
    let sealed = h.ctx.cipher.encrypt(&creds(), secret).unwrap();
    SnapshotStore::create(
        h.platform.as_ref(),
        NewSnapshot {
            name: "v1".into(),
            description: "tagged release".into(),
            owner,
            user_id: None,
            settings: Default::default(),
            flows: ports::SnapshotFlows { flows: json!([]), credentials: sealed.into() },
            credential_secret: Some(secret.into()),
        },
    )
    .await
    .unwrap()
}

/// Wait for the in-flight marker to clear and both import events to land.
async fn wait_until_idle(h: &Harness, instance: &Instance) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while is_deploying(&h.ctx, instance.id) || h.audit.events().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deploy should finish");
}

fn start_queue() -> TaskQueue {
    TaskQueue::start(QueueConfig::default())
}

// ============================================================
// Deploy to instance
// ============================================================

#[tokio::test]
async fn latest_snapshot_missing_fails_without_side_effects() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    let chain = instance_chain(&h, StageAction::UseLatestSnapshot, &a, &b).await;

    let err = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidSourceInstance(_)));
    assert_eq!(h.platform.snapshot_count(), 0);
    assert!(h.audit.events().is_empty());
    assert!(!is_deploying(&h.ctx, b.id));
}

#[tokio::test]
async fn create_snapshot_deploy_copies_reencrypted_snapshot_into_target() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    with_live_flows(&h, &a);
    let chain = instance_chain(&h, StageAction::CreateSnapshot, &a, &b).await;
    let user = UserId::new();

    let outcome = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, user)
        .await
        .unwrap();
    let DeployOutcome::Instance { instance, handle } = outcome else {
        panic!("expected an instance deploy");
    };
    assert_eq!(instance, b.id);
    let copy = handle.join().await.unwrap().unwrap();

    // one snapshot on each side
    let source_snaps = h.platform.snapshots_of(SnapshotOwner::Instance(a.id));
    assert_eq!(source_snaps.len(), 1);
    assert_eq!(h.platform.snapshots_of(SnapshotOwner::Instance(b.id)), vec![copy.clone()]);

    // credentials now open with the target secret only
    let Credentials::Encrypted(blob) = &copy.flows.credentials else {
        panic!("copied credentials must be sealed");
    };
    assert_eq!(h.ctx.cipher.decrypt(blob, "b-secret").unwrap(), creds());
    assert!(h.ctx.cipher.decrypt(blob, "a-secret").is_err());
    assert!(copy.settings.env.is_empty());

    assert!(copy.name.starts_with(&format!("{} - Deploy Snapshot - ", source_snaps[0].name)));
    assert!(copy
        .description
        .starts_with("Snapshot created for pipeline deployment from dev to prod as part of pipeline release"));

    assert_eq!(h.platform.imports(), vec![(b.id, copy.id)]);
    assert_eq!(h.runtime.restarts(), vec![b.id]);
    assert!(!is_deploying(&h.ctx, b.id));
    assert_eq!(h.audit.names(), vec!["project.imported", "project.snapshot.imported"]);
    match &h.audit.events()[1] {
        AuditEvent::ProjectSnapshotImported { actor, error, snapshot, source_instance, .. } => {
            assert_eq!(*actor, user);
            assert!(error.is_none());
            assert_eq!(*snapshot, Some(copy.id));
            assert_eq!(*source_instance, Some(a.id));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(h.commands.sent().is_empty());
}

#[tokio::test]
async fn stopped_target_is_not_restarted() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.platform.add_instance("b", Some(team), InstanceState::Stopped);
    with_live_flows(&h, &a);
    let chain = instance_chain(&h, StageAction::CreateSnapshot, &a, &b).await;

    let outcome = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap();
    let DeployOutcome::Instance { handle, .. } = outcome else {
        panic!("expected an instance deploy");
    };
    handle.join().await.unwrap().unwrap();

    assert!(h.runtime.restarts().is_empty());
    assert_eq!(h.platform.imports().len(), 1);
}

#[tokio::test]
async fn failed_import_clears_inflight_and_records_the_error() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    with_live_flows(&h, &a);
    h.platform.fail_imports();
    let chain = instance_chain(&h, StageAction::CreateSnapshot, &a, &b).await;

    let outcome = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap();
    let DeployOutcome::Instance { handle, .. } = outcome else {
        panic!("expected an instance deploy");
    };
    let err = handle.join().await.unwrap().unwrap_err();

    assert_eq!(err.code(), "unexpected_error");
    assert!(err.to_string().starts_with("Error during deploy: "));
    assert!(!is_deploying(&h.ctx, b.id));
    assert!(h.runtime.restarts().is_empty());

    let events = h.audit.events();
    assert_eq!(h.audit.names(), vec!["project.imported", "project.snapshot.imported"]);
    assert!(events[0].error().is_none());
    match &events[1] {
        AuditEvent::ProjectSnapshotImported { error, snapshot, .. } => {
            assert!(error.as_deref().unwrap_or_default().contains("rejected the import"));
            assert!(snapshot.is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn failed_restart_is_reported_as_unexpected() {
    let h = Harness::with(EngineConfig::default(), RecordingRuntime::failing());
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    with_live_flows(&h, &a);
    let chain = instance_chain(&h, StageAction::CreateSnapshot, &a, &b).await;

    let outcome = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap();
    let DeployOutcome::Instance { handle, .. } = outcome else {
        panic!("expected an instance deploy");
    };

    assert!(matches!(handle.join().await.unwrap(), Err(PipelineError::Unexpected { .. })));
    assert_eq!(h.platform.imports().len(), 1);
    assert!(!is_deploying(&h.ctx, b.id));
}

#[tokio::test]
async fn second_deploy_to_same_instance_is_rejected_while_in_flight() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    let chain = instance_chain(&h, StageAction::Prompt, &a, &b).await;
    let snapshot = owned_snapshot(&h, SnapshotOwner::Instance(a.id), "a-secret").await;

    let request = InstanceDeployRequest {
        pipeline: chain.pipeline.clone(),
        source_stage: chain.source.clone(),
        target_stage: chain.target.clone(),
        source_snapshot: snapshot,
        target_instance: b.clone(),
        source_instance: Some(a.id),
        source_device: None,
        user: UserId::new(),
    };

    let first = begin_instance_deploy(&h.ctx, request.clone()).unwrap();
    assert!(first.restarts_target());
    assert!(is_deploying(&h.ctx, b.id));
    assert!(matches!(
        begin_instance_deploy(&h.ctx, request.clone()),
        Err(PipelineError::DeployInProgress(id)) if id == b.id
    ));

    first.run().await.unwrap();
    assert!(!is_deploying(&h.ctx, b.id));
    assert!(begin_instance_deploy(&h.ctx, request).is_ok());
}

#[tokio::test]
async fn stage_deploy_checks_inflight_before_creating_a_snapshot() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    with_live_flows(&h, &a);
    let chain = instance_chain(&h, StageAction::CreateSnapshot, &a, &b).await;
    let _held = h.ctx.inflight.try_begin(b.id).unwrap();

    let err = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap_err();

    assert_eq!(err.status(), 409);
    assert_eq!(h.platform.snapshot_count(), 0);
}

#[tokio::test]
async fn restart_in_flight_blocks_a_stage_deploy_but_is_not_a_deploy() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    with_live_flows(&h, &a);
    let chain = instance_chain(&h, StageAction::CreateSnapshot, &a, &b).await;
    let _restart = h.ctx.inflight.try_begin_operation(b.id, InstanceState::Starting).unwrap();

    let err = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::DeployInProgress(id) if id == b.id));
    assert!(!is_deploying(&h.ctx, b.id));
    assert_eq!(h.platform.snapshot_count(), 0);
}

#[tokio::test]
async fn dropped_handle_still_finishes_the_deploy() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    let chain = instance_chain(&h, StageAction::UseLatestSnapshot, &a, &b).await;
    owned_snapshot(&h, SnapshotOwner::Instance(a.id), "a-secret").await;

    let outcome = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap();
    drop(outcome);

    wait_until_idle(&h, &b).await;
    assert_eq!(h.platform.imports().len(), 1);
    assert_eq!(h.audit.names().len(), 2);
}

#[tokio::test]
async fn deploy_to_devices_targets_the_copy_for_instance_devices() {
    let config = EngineConfig { deploy_to_devices: true, ..Default::default() };
    let h = Harness::with(config, RecordingRuntime::new());
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    let chain = instance_chain(&h, StageAction::UseLatestSnapshot, &a, &b).await;
    owned_snapshot(&h, SnapshotOwner::Instance(a.id), "a-secret").await;

    let outcome = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap();
    let DeployOutcome::Instance { handle, .. } = outcome else {
        panic!("expected an instance deploy");
    };
    let copy = handle.join().await.unwrap().unwrap();

    assert_eq!(h.platform.instance(b.id).unwrap().device_target_snapshot_id, Some(copy.id));
    let sent = h.commands.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target, CommandTarget::InstanceDevices(b.id));
}

#[tokio::test]
async fn unknown_stored_action_is_rejected() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let b = h.running_instance("b", team);
    let chain = instance_chain(&h, action("promote_everything"), &a, &b).await;

    let err = deploy_pipeline_stage(&h.ctx, &start_queue(), chain.pipeline.id, chain.source.id, None, UserId::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_action");
}

// ============================================================
// Deploy to device
// ============================================================

#[tokio::test]
async fn device_deploy_retargets_device_and_notifies_it_once() {
    let h = Harness::new();
    let team = h.team();
    let a = h.running_instance("a", team);
    let mut device = h.platform.add_device("pi", Some(team));
    let previous = owned_snapshot(&h, SnapshotOwner::Device(device.id), "pi-secret").await;
    device.target_snapshot_id = Some(previous.id);
    h.platform.put_device(device.clone());

    let pipeline = h.pipeline().await;
    let source = add_pipeline_stage(
        &h.ctx,
        &pipeline,
        NewStage { name: "dev".into(), action: StageAction::Prompt, instance_id: Some(a.id), ..Default::default() },
    )
    .await
    .unwrap();
    add_pipeline_stage(
        &h.ctx,
        &pipeline,
        NewStage {
            name: "edge".into(),
            action: StageAction::UseActiveSnapshot,
            device_id: Some(device.id),
            source: Some(source.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let chosen = owned_snapshot(&h, SnapshotOwner::Instance(a.id), "a-secret").await;
    let user = UserId::new();

    let outcome = deploy_pipeline_stage(&h.ctx, &start_queue(), pipeline.id, source.id, Some(chosen.id), user)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        DeployOutcome::Device { device: d, snapshot: s } if d == device.id && s == chosen.id
    ));

    let reloaded = h.platform.device(device.id).unwrap();
    assert_eq!(reloaded.target_snapshot_id, Some(chosen.id));

    assert_eq!(
        h.audit.names(),
        vec!["application.device.snapshot.device-target-set", "team.device.updated"]
    );
    match &h.audit.events()[1] {
        AuditEvent::DeviceUpdated { updates, actor, .. } => {
            assert_eq!(*actor, user);
            assert_eq!(
                updates,
                &vec![FieldUpdate::new("targetSnapshotId", Some(previous.id), Some(chosen.id))]
            );
        }
        other => panic!("unexpected event {other:?}"),
    }

    let sent = h.commands.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command, DeviceCommand::Update);
    assert_eq!(sent[0].target, CommandTarget::Device(reloaded));
    assert!(h.platform.imports().is_empty());
}

#[tokio::test]
async fn device_to_device_deploy_uses_active_snapshot() {
    let h = Harness::new();
    let team = h.team();
    let mut source_device = h.platform.add_device("lab", Some(team));
    let target_device = h.platform.add_device("field", Some(team));
    let active = owned_snapshot(&h, SnapshotOwner::Device(source_device.id), "lab-secret").await;
    source_device.active_snapshot_id = Some(active.id);
    h.platform.put_device(source_device.clone());

    let pipeline = h.pipeline().await;
    let source = add_pipeline_stage(
        &h.ctx,
        &pipeline,
        NewStage {
            name: "lab".into(),
            action: StageAction::UseActiveSnapshot,
            device_id: Some(source_device.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    add_pipeline_stage(
        &h.ctx,
        &pipeline,
        NewStage {
            name: "field".into(),
            action: StageAction::Prompt,
            device_id: Some(target_device.id),
            source: Some(source.id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    deploy_pipeline_stage(&h.ctx, &start_queue(), pipeline.id, source.id, None, UserId::new())
        .await
        .unwrap();

    assert_eq!(h.platform.device(target_device.id).unwrap().target_snapshot_id, Some(active.id));
    assert_eq!(h.audit.events().len(), 2);
}
