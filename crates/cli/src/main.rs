//! `snapshot-pipeline` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`          — run pending database migrations.
//! - `stages`           — print a pipeline's stages in chain order.
//! - `validate-deploy`  — dry-run the deploy checks for a source stage.
//! - `deploy`           — deploy a source stage to the stage after it.
//! - `export-snapshot`  — print a snapshot re-encrypted under a given secret.
//! - `audit`            — print the most recent audit log entries.
//!
//! No command bus or Node-RED runtime is attached, so device commands and
//! flow restarts issued by `deploy` are logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use db::{PgAuditSink, PgStores, PoolConfig};
use engine::{EngineConfig, EngineContext, ExportOptions};
use ports::detached::DetachedRuntime;
use ports::{PipelineId, PipelineStore, SnapshotId, StageId, UserId};
use queue::{QueueConfig, TaskQueue};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "snapshot-pipeline",
    about = "Snapshot deployment pipeline for Node-RED instances and devices",
    version
)]
struct Cli {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DatabaseArgs {
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    max_connections: u32,

    /// Seconds to wait for a free connection.
    #[arg(long, default_value_t = 5, global = true)]
    acquire_timeout: u64,
}

impl DatabaseArgs {
    fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let Some(url) = self.database_url.clone() else {
            bail!("DATABASE_URL is not set (pass --database-url or set the env var)");
        };
        Ok(PoolConfig {
            url,
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
        })
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate,
    /// Print a pipeline's stages in chain order.
    Stages {
        #[arg(long)]
        pipeline: PipelineId,
    },
    /// Check whether a stage can be deployed to its successor.
    ValidateDeploy {
        #[arg(long)]
        pipeline: PipelineId,
        #[arg(long)]
        stage: StageId,
    },
    /// Deploy a stage to the stage after it and wait for the result.
    Deploy {
        #[arg(long)]
        pipeline: PipelineId,
        #[arg(long)]
        stage: StageId,
        /// Snapshot to deploy, for `prompt` stages.
        #[arg(long)]
        snapshot: Option<SnapshotId>,
        /// User recorded in the audit log.
        #[arg(long)]
        user: UserId,
        /// Also make the copied snapshot the target of the instance's devices.
        #[arg(long)]
        deploy_to_devices: bool,
    },
    /// Print a snapshot with its credentials sealed under `--credential-secret`.
    ExportSnapshot {
        #[arg(long)]
        id: SnapshotId,
        #[arg(long, env = "EXPORT_CREDENTIAL_SECRET")]
        credential_secret: String,
    },
    /// Print the most recent audit log entries.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let pool = db::create_pool(&cli.database.pool_config()?)
        .await
        .context("failed to connect to database")?;

    let context = |config: EngineConfig| {
        let detached = Arc::new(DetachedRuntime);
        EngineContext::new(
            Arc::new(PgStores::new(pool.clone())),
            detached.clone(),
            detached,
            Arc::new(PgAuditSink::new(pool.clone())),
            config,
        )
    };

    match cli.command {
        Command::Migrate => {
            db::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
        }
        Command::Stages { pipeline } => {
            let ctx = context(EngineConfig::default());
            let stages = engine::list_pipeline_stages(&ctx, pipeline).await?;
            for (position, stage) in stages.iter().enumerate() {
                println!(
                    "{position}: {} [{}] id={} instances={:?} devices={:?}",
                    stage.name, stage.action, stage.id, stage.instances, stage.devices
                );
            }
        }
        Command::ValidateDeploy { pipeline, stage } => {
            let ctx = context(EngineConfig::default());
            let pipeline = ctx
                .pipelines
                .get_pipeline(pipeline)
                .await?
                .with_context(|| format!("pipeline {pipeline} not found"))?;
            let source = ctx.pipelines.get_stage(stage).await?;

            match engine::validate_source_stage_for_deploy(&ctx, &pipeline, source.as_ref()).await {
                Ok(targets) => println!("ok: deploys to stage '{}'", targets.target_stage.name),
                Err(e) => {
                    eprintln!("{} ({}): {e}", e.code(), e.status());
                    std::process::exit(1);
                }
            }
        }
        Command::Deploy { pipeline, stage, snapshot, user, deploy_to_devices } => {
            let ctx = context(EngineConfig { deploy_to_devices, ..EngineConfig::default() });
            let queue = TaskQueue::start(QueueConfig::default());

            match engine::deploy_pipeline_stage(&ctx, &queue, pipeline, stage, snapshot, user).await? {
                engine::DeployOutcome::Instance { instance, handle } => {
                    info!(%instance, job = %handle.id(), "waiting for deploy to finish");
                    let copy = handle.join().await??;
                    println!("instance {instance} now runs snapshot {} ({})", copy.id, copy.name);
                }
                engine::DeployOutcome::Device { device, snapshot } => {
                    println!("device {device} now targets snapshot {snapshot}");
                }
            }
        }
        Command::ExportSnapshot { id, credential_secret } => {
            let ctx = context(EngineConfig::default());
            let snapshot = engine::get_snapshot(&ctx, id).await?;
            let options = ExportOptions {
                credential_secret: Some(credential_secret),
                ..ExportOptions::default()
            };
            let Some(exported) = engine::export_snapshot(&ctx, &snapshot, options).await? else {
                bail!("snapshot {id} has no owner to export from");
            };
            println!("{}", serde_json::to_string_pretty(&exported)?);
        }
        Command::Audit { limit } => {
            for row in db::repository::audit::list_recent(&pool, limit).await? {
                println!(
                    "{} {} actor={} error={}",
                    row.created_at.to_rfc3339(),
                    row.event,
                    row.actor,
                    row.error.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
