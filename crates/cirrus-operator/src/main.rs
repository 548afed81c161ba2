//! Cirrus Operator - cluster compute control loop

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cirrus_common::crd::CirrusCluster;
use cirrus_common::kube_utils::create_client;
use cirrus_common::store::FIELD_MANAGER;
use cirrus_common::OperatorConfig;
use cirrus_operator::controller::Context;
use cirrus_operator::controller_runner::build_cluster_controller;

/// Cirrus - converges cloud instance groups and cluster networks toward
/// CirrusCluster descriptors
#[derive(Parser, Debug)]
#[command(name = "cirrus", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches CirrusCluster descriptors and runs one reconciliation pass
    /// per descriptor on every change and every pass interval.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&CirrusCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Install the CirrusCluster CRD with server-side apply so its version
/// always matches the operator
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing CirrusCluster CRD...");
    crds.patch(
        "cirrusclusters.cirrus.dev",
        &params,
        &Patch::Apply(&CirrusCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install CirrusCluster CRD: {}", e))?;
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    tracing::info!(
        installation = %config.installation_name,
        pool = %config.ipam_network_range,
        mask_bits = config.allocated_mask_bits,
        pass_interval_secs = config.pass_interval_secs,
        "Starting Cirrus controller"
    );

    let client = create_client(None)
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;
    ensure_crd_installed(&client).await?;

    let ctx = Context::builder(client.clone(), config)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build controller context: {}", e))?;

    tracing::info!("Starting controllers:");
    build_cluster_controller(client, Arc::new(ctx)).await;

    tracing::info!("Controller shut down");
    Ok(())
}
