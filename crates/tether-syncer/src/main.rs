//! Tether syncer - serves one SyncTarget

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, CustomResourceExt};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use tether_common::crd::SyncTarget;
use tether_common::kube_utils::{apply_crd, create_client};
use tether_common::retry::{retry_with_backoff, RetryConfig};
use tether_common::telemetry::{init_telemetry, TelemetryConfig};
use tether_syncer::lifecycle::agent::KubeAgentDeployer;
use tether_syncer::lifecycle::{error_policy, reconcile, Context, SyncEngine};
use tether_syncer::store::{KubeStore, Side};
use tether_syncer::{SyncRuntime, SyncerConfig};

/// Tether syncer - keeps a physical cluster in sync with a logical workspace
#[derive(Parser, Debug)]
#[command(name = "tether-syncer", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the syncer for one SyncTarget (default)
    Run,

    /// Print the SyncTarget CRD and exit
    Crd,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to a YAML config file
    #[arg(short = 'c', long = "config", env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// SyncTarget served by this process
    #[arg(long, env = "TETHER_SYNC_TARGET")]
    sync_target: Option<String>,

    /// Kubeconfig for the logical workspace
    #[arg(long, env = "TETHER_LOGICAL_KUBECONFIG")]
    logical_kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the physical cluster
    #[arg(long, env = "TETHER_PHYSICAL_KUBECONFIG")]
    physical_kubeconfig: Option<PathBuf>,

    /// Worker tasks per resource type
    #[arg(long, env = "TETHER_WORKERS")]
    workers: Option<usize>,

    /// Full resync period in seconds
    #[arg(long, env = "TETHER_RESYNC_PERIOD_SECS")]
    resync_period_secs: Option<u64>,

    /// Heartbeat period in seconds
    #[arg(long, env = "TETHER_HEARTBEAT_PERIOD_SECS")]
    heartbeat_period_secs: Option<u64>,
}

impl RunArgs {
    fn load(&self) -> anyhow::Result<SyncerConfig> {
        let mut config = match &self.config {
            Some(path) => SyncerConfig::from_file(path)?,
            None => SyncerConfig::default(),
        };
        if let Some(target) = &self.sync_target {
            config.sync_target = target.clone();
        }
        if let Some(path) = &self.logical_kubeconfig {
            config.logical_kubeconfig = Some(path.clone());
        }
        if let Some(path) = &self.physical_kubeconfig {
            config.physical_kubeconfig = Some(path.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.resync_period_secs {
            config.resync_period_secs = secs;
        }
        if let Some(secs) = self.heartbeat_period_secs {
            config.heartbeat_period_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Crd) = cli.command {
        let crd = serde_yaml::to_string(&SyncTarget::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = cli.run.load()?;
    init_telemetry(
        TelemetryConfig::default().with_attribute("tether.sync_target", &config.sync_target),
    )?;
    run(Arc::new(config)).await
}

async fn run(config: Arc<SyncerConfig>) -> anyhow::Result<()> {
    let logical = create_client(config.logical_kubeconfig.as_deref()).await?;
    let physical = create_client(config.physical_kubeconfig.as_deref()).await?;

    retry_with_backoff(&RetryConfig::infinite(), "apply_crd", || async {
        apply_crd(&logical, &SyncTarget::crd()).await
    })
    .await?;

    let root = CancellationToken::new();
    let runtime = Arc::new(SyncRuntime::new(
        config.clone(),
        Arc::new(KubeStore::new(logical.clone(), Side::Logical)),
        Arc::new(KubeStore::new(physical.clone(), Side::Physical)),
        &root,
    ));
    let proposals = WatchStream::new(runtime.subscribe()).map(|_| ());

    let ctx = Arc::new(
        Context::builder(
            logical.clone(),
            runtime.clone(),
            Arc::new(KubeAgentDeployer::new(physical, config.call_timeout())),
        )
        .backoff(config.backoff())
        .build(),
    );

    let targets: Api<SyncTarget> = Api::all(logical);
    let watcher = WatcherConfig::default().fields(&format!("metadata.name={}", config.sync_target));

    tracing::info!(sync_target = %config.sync_target, "Starting SyncTarget controller");
    Controller::new(targets, watcher)
        .reconcile_all_on(proposals)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "SyncTarget reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "SyncTarget reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Shutting down sync runtime");
    runtime.stop().await;
    root.cancel();
    Ok(())
}
