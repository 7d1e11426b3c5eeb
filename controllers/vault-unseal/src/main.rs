//! Vault Unseal Controller
//!
//! Keeps HashiCorp Vault pods unsealed without human intervention.
//!
//! This controller reconciles `VaultUnseal` CRDs: for every pod matched by the
//! resource's label selector it checks the seal status and, when sealed,
//! submits the key shares stored in Kubernetes Secrets until Vault reports
//! itself unsealed. Results land in the resource status and in Prometheus
//! metrics served on `METRICS_PORT`.

mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod metrics;
mod reconciler;
mod selector;
mod server;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use controller::Controller;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // kube and the Vault client both build rustls configs from the process default
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Vault Unseal Controller");

    let config = ControllerConfig::from_env();
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Metrics port: {}", config.metrics_port);
    info!("  Reconcile concurrency: {}", config.reconcile_concurrency);
    info!("  Cycle timeout: {:?}", config.cycle_timeout);

    let metrics = Arc::new(Metrics::new()?);

    let controller = Controller::new(config, metrics).await?;
    controller.run().await?;

    Ok(())
}
