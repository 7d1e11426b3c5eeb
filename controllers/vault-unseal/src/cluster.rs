//! Kubernetes-backed capabilities.
//!
//! Thin adapters from the reconciler's capability traits onto `kube::Api`.
//! Nothing here caches: every cycle sees the current Secrets, pods and status.

use crate::error::{ControllerError, StatusStoreError};
use crate::reconciler::capabilities::{PodLister, SecretSource, StatusSnapshot, StatusStore};
use crate::reconciler::targets::{PodTarget, pod_target_from};
use crate::selector::LabelSelector;
use async_trait::async_trait;
use crds::{VaultUnseal, VaultUnsealStatus};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Reads Secrets through the API server
#[derive(Clone)]
pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };

        // `stringData` is write-only; the API server folds it into `data`
        let data = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect();
        Ok(Some(data))
    }
}

/// Lists pods through the API server
#[derive(Clone)]
pub struct KubePodLister {
    client: Client,
}

impl KubePodLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PodTarget>, ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(selector.as_str()))
            .await?;
        debug!(
            "Selector '{}' matched {} pod(s) in {}",
            selector,
            pods.items.len(),
            namespace
        );
        Ok(pods.items.iter().filter_map(pod_target_from).collect())
    }
}

/// Reads and merge-patches the VaultUnseal status subresource
#[derive(Clone)]
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<VaultUnseal> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatusSnapshot>, StatusStoreError> {
        let resource = self.api(namespace).get_opt(name).await.map_err(status_error)?;
        Ok(resource.map(|r| StatusSnapshot {
            status: r.status,
            resource_version: r.metadata.resource_version,
        }))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &VaultUnsealStatus,
    ) -> Result<(), StatusStoreError> {
        // A resourceVersion in a merge patch turns it into a precondition
        let patch = match resource_version {
            Some(rv) => json!({
                "metadata": { "resourceVersion": rv },
                "status": status,
            }),
            None => json!({ "status": status }),
        };

        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(status_error)?;
        Ok(())
    }
}

fn status_error(error: kube::Error) -> StatusStoreError {
    match error {
        kube::Error::Api(api_err) if api_err.code == 409 => StatusStoreError::Conflict,
        kube::Error::Api(api_err) if api_err.code == 404 => StatusStoreError::NotFound,
        other => StatusStoreError::Api(other.to_string()),
    }
}
