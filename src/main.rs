//! Machine Approver - automated approval of node certificate signing requests

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use machine_approver::config::{ApproverConfig, CaBundle};
use machine_approver::controller::{error_policy, reconcile, Context};

/// Machine Approver - automated approver for node CSRs
#[derive(Parser, Debug)]
#[command(name = "machine-approver", version, about, long_about = None)]
struct Cli {
    /// Path to the approver config YAML
    #[arg(long, env = "APPROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a PEM bundle used to verify kubelet serving certs.
    /// When given, serving CSRs are first checked as renewals of the
    /// certificate the node currently presents.
    #[arg(long, env = "KUBELET_CA_BUNDLE")]
    kubelet_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ApproverConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?,
        None => ApproverConfig::default(),
    };

    if let Some(path) = &cli.kubelet_ca {
        let bundle = CaBundle::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load kubelet CA bundle: {e}"))?;
        config = config.with_kubelet_ca(bundle);
        tracing::info!(path = %path.display(), "kubelet CA bundle loaded, serving renewals enabled");
    } else {
        tracing::info!("no kubelet CA bundle, serving CSRs use machine-api correlation only");
    }

    if config.node_client_cert.disabled {
        tracing::warn!("node client cert flow is disabled by configuration");
    }

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e}"))?;

    // Cancel in-flight kubelet probes promptly on shutdown
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let ctx = Arc::new(Context::new(client.clone(), config, shutdown));

    let csrs: Api<CertificateSigningRequest> = Api::all(client);

    tracing::info!("Starting CSR approver controller...");

    Controller::new(csrs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Machine approver shutting down");
    Ok(())
}
