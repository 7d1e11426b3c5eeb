//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the reconciler to
//! the cluster, then runs the VaultUnseal watcher and the metrics/probe
//! server side by side.

use crate::cluster::{KubePodLister, KubeSecretSource, KubeStatusStore};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::reconciler::capabilities::HttpVaultClientFactory;
use crate::server::{self, ServerState};
use crate::watcher::Watcher;
use kube::Client;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main controller for Vault unsealing.
pub struct Controller {
    vault_unseal_watcher: JoinHandle<Result<(), ControllerError>>,
    server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig, metrics: Arc<Metrics>) -> Result<Self, ControllerError> {
        info!("Initializing Vault Unseal Controller");

        let kube_client = Client::try_default().await?;

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubeSecretSource::new(kube_client.clone())),
            Arc::new(KubePodLister::new(kube_client.clone())),
            Arc::new(KubeStatusStore::new(kube_client.clone())),
            Arc::new(HttpVaultClientFactory),
            metrics.clone(),
            config.clone(),
        ));

        let server_state = ServerState::new(metrics);
        let port = config.metrics_port;
        let server = {
            let state = server_state.clone();
            tokio::spawn(async move { server::serve(port, state).await })
        };

        let watcher = Watcher::new(kube_client, reconciler, config);
        let vault_unseal_watcher = tokio::spawn(async move { watcher.watch_vault_unseals().await });

        server_state.mark_ready();

        Ok(Self {
            vault_unseal_watcher,
            server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Vault Unseal Controller running");

        // The watcher returns on SIGTERM/SIGINT; the server only on failure
        tokio::select! {
            result = &mut self.vault_unseal_watcher => {
                self.server.abort();
                result.map_err(|e| ControllerError::Watch(format!("VaultUnseal watcher panicked: {}", e)))??;
            }
            result = &mut self.server => {
                warn!("Metrics server exited, stopping controller");
                self.vault_unseal_watcher.abort();
                result.map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))??;
            }
        }

        info!("Vault Unseal Controller stopped");
        Ok(())
    }
}
