//! Shared fixtures for engine unit tests.

use std::sync::Arc;

use ports::mock::{MemoryPlatform, RecordingAudit, RecordingCommands, RecordingRuntime};
use ports::{
    ApplicationId, InstanceState, Pipeline, PipelineStore, StageAction, TeamId,
};

use crate::{EngineConfig, EngineContext};

pub(crate) struct Harness {
    pub ctx: EngineContext,
    pub platform: Arc<MemoryPlatform>,
    pub audit: Arc<RecordingAudit>,
    pub commands: Arc<RecordingCommands>,
    pub runtime: Arc<RecordingRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(EngineConfig::default(), RecordingRuntime::new())
    }

    pub fn with(config: EngineConfig, runtime: RecordingRuntime) -> Self {
        let platform = Arc::new(MemoryPlatform::new());
        let audit = Arc::new(RecordingAudit::new());
        let commands = Arc::new(RecordingCommands::new());
        let runtime = Arc::new(runtime);
        let ctx = EngineContext::new(
            platform.clone(),
            commands.clone(),
            runtime.clone(),
            audit.clone(),
            config,
        );
        Self { ctx, platform, audit, commands, runtime }
    }

    pub async fn pipeline(&self) -> Pipeline {
        let pipeline = Pipeline::new("release", ApplicationId::new());
        self.ctx.pipelines.create_pipeline(&pipeline).await.unwrap();
        pipeline
    }

    pub fn team(&self) -> TeamId {
        self.platform.add_team("team").id
    }

    pub fn running_instance(&self, name: &str, team: TeamId) -> ports::Instance {
        self.platform.add_instance(name, Some(team), InstanceState::Running)
    }
}

pub(crate) fn action(a: &str) -> StageAction {
    StageAction::from(a.to_string())
}
