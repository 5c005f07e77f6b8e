//! Stand-ins for the device command bus and instance runtime when the process
//! runs without them (the CLI, for example). Every call is logged and
//! reported as a success.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::{
    Device, DeviceCommand, DeviceCommands, FlowRuntime, Instance, InstanceId, StoreError, TeamId,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedRuntime;

#[async_trait]
impl DeviceCommands for DetachedRuntime {
    async fn send_command(
        &self,
        team: TeamId,
        device: &Device,
        command: DeviceCommand,
        _payload: Value,
    ) -> Result<(), StoreError> {
        warn!(%team, device_id = %device.id, command = command.as_str(), "no command bus attached, dropping device command");
        Ok(())
    }

    async fn send_to_instance_devices(
        &self,
        team: TeamId,
        instance: InstanceId,
        command: DeviceCommand,
        _payload: Value,
    ) -> Result<(), StoreError> {
        warn!(%team, instance_id = %instance, command = command.as_str(), "no command bus attached, dropping instance device command");
        Ok(())
    }
}

#[async_trait]
impl FlowRuntime for DetachedRuntime {
    async fn restart_flows(&self, instance: &Instance) -> Result<(), StoreError> {
        warn!(instance_id = %instance.id, "no runtime attached, skipping flow restart");
        Ok(())
    }
}
