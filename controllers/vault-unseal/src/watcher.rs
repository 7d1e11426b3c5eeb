//! Kubernetes resource watchers.
//!
//! Runs a `kube_runtime::Controller` over VaultUnseal resources. Pod changes
//! are mapped back to every VaultUnseal whose selector matches the pod, so a
//! restarted (and therefore sealed) Vault pod is picked up without waiting
//! for the next periodic cycle.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::selector::LabelSelector;
use crds::VaultUnseal;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{self, Action, Config as RuntimeConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watches VaultUnseal resources and the pods they select.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    vault_unseal_api: Api<VaultUnseal>,
    pod_api: Api<Pod>,
    config: ControllerConfig,
}

impl Watcher {
    /// Creates a new watcher, scoped to `config.watch_namespace` when set.
    pub fn new(client: Client, reconciler: Arc<Reconciler>, config: ControllerConfig) -> Self {
        let (vault_unseal_api, pod_api) = match config.watch_namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client, ns),
            ),
            None => (Api::all(client.clone()), Api::all(client)),
        };
        Self {
            reconciler,
            vault_unseal_api,
            pod_api,
            config,
        }
    }

    /// Runs until the process receives SIGTERM or SIGINT.
    pub async fn watch_vault_unseals(self) -> Result<(), ControllerError> {
        info!(
            "Starting VaultUnseal watcher (debounce {:?}, concurrency {})",
            self.config.debounce, self.config.reconcile_concurrency
        );

        let controller = Controller::new(self.vault_unseal_api, watcher::Config::default());
        let store = controller.store();

        let reconcile = |resource: Arc<VaultUnseal>, ctx: Arc<Reconciler>| async move {
            ctx.reconcile(&resource).await
        };
        let error_policy = |resource: Arc<VaultUnseal>, error: &ControllerError, ctx: Arc<Reconciler>| -> Action {
            ctx.error_policy(&resource, error)
        };

        let reconciler = self.reconciler.clone();
        let runtime_config = RuntimeConfig::default()
            .debounce(self.config.debounce)
            .concurrency(self.config.reconcile_concurrency);

        controller
            .watches(self.pod_api, watcher::Config::default(), move |pod: Pod| {
                resources_selecting(&pod, &store.state())
            })
            .with_config(runtime_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.reconciler)
            .for_each(|res| {
                let reconciler = reconciler.clone();
                async move {
                    match res {
                        Ok((obj, _)) => debug!("Reconciled VaultUnseal {}", obj),
                        // A requeue fired for a resource deleted since its last cycle
                        Err(controller::Error::ObjectNotFound(obj)) => {
                            reconciler.forget(obj.namespace.as_deref().unwrap_or_default(), &obj.name);
                        }
                        Err(e) => warn!("VaultUnseal controller error: {}", e),
                    }
                }
            })
            .await;

        info!("VaultUnseal watcher stopped");
        Ok(())
    }
}

/// VaultUnseal resources in the pod's namespace whose selector matches the pod
fn resources_selecting(pod: &Pod, resources: &[Arc<VaultUnseal>]) -> Vec<ObjectRef<VaultUnseal>> {
    let Some(pod_namespace) = pod.metadata.namespace.as_deref() else {
        return Vec::new();
    };
    let empty = BTreeMap::new();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);

    resources
        .iter()
        .filter(|r| r.namespace().as_deref() == Some(pod_namespace))
        .filter(|r| match r.spec.selector.parse::<LabelSelector>() {
            Ok(selector) => selector.matches(labels),
            Err(e) => {
                // Surfaced as InvalidSpec by the reconciler itself
                debug!("Ignoring VaultUnseal {} with bad selector: {}", r.name_any(), e);
                false
            }
        })
        .map(|r| ObjectRef::from_obj(r.as_ref()))
        .collect()
}
