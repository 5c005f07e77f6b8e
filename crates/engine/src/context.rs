//! Everything an engine operation needs, bundled once per process.

use std::sync::Arc;

use credentials::{AesCtrCipher, CredentialCipher};
use ports::{
    AuditEvent, AuditSink, DeviceCommands, DeviceStore, FlowRuntime, InstanceStore, PipelineStore,
    SnapshotStore, TeamDirectory,
};
use tracing::warn;

use crate::{EngineConfig, InflightRegistry};

/// Collaborators, configuration and shared state of the engine.
///
/// Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct EngineContext {
    pub pipelines: Arc<dyn PipelineStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub teams: Arc<dyn TeamDirectory>,
    pub commands: Arc<dyn DeviceCommands>,
    pub runtime: Arc<dyn FlowRuntime>,
    pub audit: Arc<dyn AuditSink>,
    pub cipher: Arc<dyn CredentialCipher>,
    pub inflight: InflightRegistry,
    pub config: EngineConfig,
}

impl EngineContext {
    /// Build a context where one value backs every store trait.
    pub fn new<S>(
        stores: Arc<S>,
        commands: Arc<dyn DeviceCommands>,
        runtime: Arc<dyn FlowRuntime>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self
    where
        S: PipelineStore + SnapshotStore + InstanceStore + DeviceStore + TeamDirectory + 'static,
    {
        Self {
            pipelines: stores.clone(),
            snapshots: stores.clone(),
            instances: stores.clone(),
            devices: stores.clone(),
            teams: stores,
            commands,
            runtime,
            audit,
            cipher: Arc::new(AesCtrCipher::new()),
            inflight: InflightRegistry::new(),
            config,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn CredentialCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Write an audit event. A failing sink is logged, never propagated.
    pub(crate) async fn record(&self, event: AuditEvent) {
        let name = event.name();
        if let Err(e) = self.audit.record(event).await {
            warn!(event = name, error = %e, "failed to write audit event");
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("inflight", &self.inflight)
            .finish_non_exhaustive()
    }
}
