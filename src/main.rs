//! Updraft operator - metric-driven replica autoscaling for Kubernetes

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{controller, reflector, watcher, Controller};
use kube::{Api, Client, CustomResourceExt};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use updraft::config::ControllerConfig;
use updraft::controller::{error_policy, reconcile, Context};
use updraft::crd::ReplicaAutoscaler;
use updraft::engine::{builtin_registry, Engine, PluginServices};
use updraft::metrics::RestMetricsClient;
use updraft::pods::StorePodLister;
use updraft::FIELD_MANAGER;

/// Updraft - replica autoscaling controller
#[derive(Parser, Debug)]
#[command(name = "updraft", version, about, long_about = None)]
struct Cli {
    /// Print the ReplicaAutoscaler CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Controller configuration file
    #[arg(long, default_value = "/etc/updraft/config.yaml")]
    config: PathBuf,

    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ReplicaAutoscaler::crd())
            .map_err(|err| anyhow::anyhow!("failed to serialize CRD: {err}"))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli).await
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let mut config = if cli.config.exists() {
        ControllerConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        ControllerConfig::default()
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|err| anyhow::anyhow!("failed to create Kubernetes client: {err}"))?;

    // Shared pod cache; scalers and the exhaustion detector read from it
    // without touching the API server.
    let pods: Api<Pod> = Api::all(client.clone());
    let (pod_store, writer) = reflector::store();
    let pod_reflector = reflector::reflector(writer, watcher(pods, watcher::Config::default()));
    tokio::spawn(async move {
        pod_reflector
            .for_each(|event| async {
                if let Err(err) = event {
                    warn!(error = %err, "pod watch error");
                }
            })
            .await;
    });
    info!("waiting for pod cache to sync");
    pod_store
        .wait_until_ready()
        .await
        .map_err(|err| anyhow::anyhow!("pod cache never became ready: {err}"))?;

    let services = PluginServices {
        pod_lister: Arc::new(StorePodLister::new(pod_store)),
        metrics: Arc::new(RestMetricsClient::new(client.clone())),
    };
    let engine = Arc::new(Engine::new(&builtin_registry(), &config.plugins, services)?);
    let ctx = Arc::new(Context::new(client.clone(), engine, FIELD_MANAGER));

    let autoscalers: Api<ReplicaAutoscaler> = Api::all(client);
    info!(workers = config.workers, "starting ReplicaAutoscaler controller");
    Controller::new(autoscalers, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.workers as u16))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(reference) => debug!(?reference, "reconciliation completed"),
                Err(err) => warn!(error = %err, "reconciliation error"),
            }
        })
        .await;

    info!("controller shutting down");
    Ok(())
}
