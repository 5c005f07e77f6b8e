//! Engine configuration.

/// Tuning knobs for the pipeline engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Also make a deployed snapshot the target of the target instance's
    /// devices.
    pub deploy_to_devices: bool,
    /// Env keys starting with this prefix are platform-owned. They are
    /// stripped on export/upload and synthesised on read.
    pub reserved_env_prefix: String,
    /// `chrono` format of the timestamp in generated deploy snapshot names.
    pub snapshot_timestamp_format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deploy_to_devices: false,
            reserved_env_prefix: "FF_".into(),
            snapshot_timestamp_format: "%Y-%m-%d %H:%M:%S".into(),
        }
    }
}
