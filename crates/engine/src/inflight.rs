//! Transient in-flight markers for instances with a running operation.
//!
//! At most one marker exists per instance. Taking one is an atomic
//! check-and-set, so two concurrent deploys to the same instance cannot both
//! pass [`InflightRegistry::try_begin`]. A marker taken for a deploy also
//! carries the in-deploy flag; other operations (a restart, a suspend) take a
//! plain marker with their own reported state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ports::{InstanceId, InstanceState};
use tracing::debug;

use crate::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightMarker {
    /// State reported for the instance while the marker is held.
    pub state: InstanceState,
    /// Set only when the marker was taken by a deploy.
    pub in_deploy: bool,
    pub since: DateTime<Utc>,
}

/// Shared registry of in-flight instance operations.
#[derive(Debug, Clone, Default)]
pub struct InflightRegistry {
    markers: Arc<DashMap<InstanceId, InflightMarker>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `instance` as being deployed to. It reports `importing` and
    /// carries the in-deploy flag until the guard drops.
    ///
    /// # Errors
    /// [`PipelineError::DeployInProgress`] when any marker is already held.
    pub fn try_begin(&self, instance: InstanceId) -> Result<InflightGuard, PipelineError> {
        self.claim(instance, InstanceState::Importing, true)
    }

    /// Mark `instance` as busy with a non-deploy operation reporting `state`.
    ///
    /// # Errors
    /// [`PipelineError::DeployInProgress`] when any marker is already held.
    pub fn try_begin_operation(
        &self,
        instance: InstanceId,
        state: InstanceState,
    ) -> Result<InflightGuard, PipelineError> {
        self.claim(instance, state, false)
    }

    fn claim(
        &self,
        instance: InstanceId,
        state: InstanceState,
        in_deploy: bool,
    ) -> Result<InflightGuard, PipelineError> {
        match self.markers.entry(instance) {
            Entry::Occupied(_) => Err(PipelineError::DeployInProgress(instance)),
            Entry::Vacant(slot) => {
                debug!(instance_id = %instance, %state, in_deploy, "in-flight marker set");
                slot.insert(InflightMarker { state, in_deploy, since: Utc::now() });
                Ok(InflightGuard { registry: self.clone(), instance })
            }
        }
    }

    /// `true` only while a deploy holds the marker.
    pub fn is_deploying(&self, instance: InstanceId) -> bool {
        self.markers.get(&instance).is_some_and(|m| m.in_deploy)
    }

    /// `true` while any operation holds the marker.
    pub fn is_in_flight(&self, instance: InstanceId) -> bool {
        self.markers.contains_key(&instance)
    }

    pub fn marker(&self, instance: InstanceId) -> Option<InflightMarker> {
        self.markers.get(&instance).map(|m| m.clone())
    }

    fn clear(&self, instance: InstanceId) {
        if self.markers.remove(&instance).is_some() {
            debug!(instance_id = %instance, "in-flight marker cleared");
        }
    }
}

/// Holds an instance's in-flight marker. Dropping the guard clears it.
#[derive(Debug)]
pub struct InflightGuard {
    registry: InflightRegistry,
    instance: InstanceId,
}

impl InflightGuard {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Clear the marker now.
    pub fn release(self) {}
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.registry.clear(self.instance);
    }
}
