//! Test utilities for unit testing the reconciler
//!
//! In-memory fakes for the capability traits plus helpers for building test
//! resources and pods.

use crate::config::ControllerConfig;
use crate::error::{ControllerError, StatusStoreError};
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::reconciler::capabilities::{
    PodLister, SecretSource, StatusSnapshot, StatusStore, VaultClientFactory,
};
use crate::reconciler::policy::UnsealPolicy;
use crate::reconciler::targets::{PodTarget, pod_target_from};
use crate::selector::LabelSelector;
use async_trait::async_trait;
use crds::{SecretKeyReference, VaultUnseal, VaultUnsealSpec, VaultUnsealStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use vault_client::{MockVaultClient, VaultClientTrait, VaultError};

/// Helper to create a test VaultUnseal selecting `app=vault`
pub fn create_test_vault_unseal(name: &str, namespace: &str, secret_names: &[&str]) -> VaultUnseal {
    VaultUnseal {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            generation: Some(1),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: VaultUnsealSpec {
            vault: Default::default(),
            tls: None,
            selector: "app=vault".to_string(),
            unseal_keys: secret_names
                .iter()
                .map(|n| SecretKeyReference::new(*n))
                .collect(),
            key_threshold: None,
            ha_enabled: true,
            reconcile_interval: "30s".to_string(),
            request_timeout_seconds: None,
            max_concurrent_pods: None,
        },
        status: None,
    }
}

/// Helper to create a running Vault pod labelled `app=vault`
pub fn create_test_pod(name: &str, namespace: &str, ip: Option<&str>, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), "vault".to_string())])),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: ip.map(str::to_string),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Secrets held in memory
#[derive(Default)]
pub struct FakeSecretSource {
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, Vec<u8>>>>,
    reads: Mutex<usize>,
}

impl FakeSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, name: &str, entries: &[(&str, &str)]) {
        let data = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn insert_raw(&self, namespace: &str, name: &str, key: &str, value: Vec<u8>) {
        self.secrets
            .lock()
            .unwrap()
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn reads(&self) -> usize {
        *self.reads.lock().unwrap()
    }
}

#[async_trait]
impl SecretSource for FakeSecretSource {
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError> {
        *self.reads.lock().unwrap() += 1;
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/// Pods held in memory, filtered like the API server would
#[derive(Default)]
pub struct FakePodLister {
    pods: Mutex<Vec<Pod>>,
    fail: Mutex<bool>,
}

impl FakePodLister {
    pub fn new(pods: Vec<Pod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            fail: Mutex::new(false),
        }
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl PodLister for FakePodLister {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PodTarget>, ControllerError> {
        if *self.fail.lock().unwrap() {
            return Err(ControllerError::Watch("pods is forbidden".to_string()));
        }
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| selector.matches(p.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())))
            .filter_map(pod_target_from)
            .collect())
    }
}

/// Status subresource held in memory
#[derive(Default)]
pub struct FakeStatusStore {
    snapshots: Mutex<HashMap<String, StatusSnapshot>>,
    writes: Mutex<Vec<VaultUnsealStatus>>,
    conflicts_remaining: Mutex<u32>,
    deleted: Mutex<bool>,
    api_error: Mutex<Option<String>>,
}

impl FakeStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` writes fail with a conflict
    pub fn fail_with_conflicts(&self, n: u32) {
        *self.conflicts_remaining.lock().unwrap() = n;
    }

    pub fn mark_deleted(&self) {
        *self.deleted.lock().unwrap() = true;
    }

    pub fn fail_with_api_error(&self, msg: &str) {
        *self.api_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Seed the stored state a conflict re-read returns
    pub fn seed(&self, namespace: &str, name: &str, snapshot: StatusSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(format!("{}/{}", namespace, name), snapshot);
    }

    pub fn writes(&self) -> Vec<VaultUnsealStatus> {
        self.writes.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> Option<VaultUnsealStatus> {
        self.writes.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StatusStore for FakeStatusStore {
    async fn get_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatusSnapshot>, StatusStoreError> {
        if *self.deleted.lock().unwrap() {
            return Ok(None);
        }
        Ok(Some(
            self.snapshots
                .lock()
                .unwrap()
                .get(&format!("{}/{}", namespace, name))
                .cloned()
                .unwrap_or_default(),
        ))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        _resource_version: Option<&str>,
        status: &VaultUnsealStatus,
    ) -> Result<(), StatusStoreError> {
        if *self.deleted.lock().unwrap() {
            return Err(StatusStoreError::NotFound);
        }
        if let Some(msg) = self.api_error.lock().unwrap().clone() {
            return Err(StatusStoreError::Api(msg));
        }
        {
            let mut conflicts = self.conflicts_remaining.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(StatusStoreError::Conflict);
            }
        }
        self.writes.lock().unwrap().push(status.clone());
        self.snapshots.lock().unwrap().insert(
            format!("{}/{}", namespace, name),
            StatusSnapshot {
                status: Some(status.clone()),
                resource_version: Some("2".to_string()),
            },
        );
        Ok(())
    }
}

/// Hands out one shared `MockVaultClient`
#[derive(Default)]
pub struct MockClientFactory {
    pub client: MockVaultClient,
    pub tls_error: Option<String>,
    pub last_ca: Mutex<Option<Vec<u8>>>,
}

impl VaultClientFactory for MockClientFactory {
    fn client_for(
        &self,
        _policy: &UnsealPolicy,
        ca_pem: Option<Vec<u8>>,
    ) -> Result<Arc<dyn VaultClientTrait>, VaultError> {
        *self.last_ca.lock().unwrap() = ca_pem;
        if let Some(msg) = &self.tls_error {
            return Err(VaultError::Tls(msg.clone()));
        }
        Ok(Arc::new(self.client.clone()))
    }
}

/// A reconciler wired to in-memory fakes
pub struct TestHarness {
    pub reconciler: Reconciler,
    pub secrets: Arc<FakeSecretSource>,
    pub pods: Arc<FakePodLister>,
    pub status: Arc<FakeStatusStore>,
    pub factory: Arc<MockClientFactory>,
    pub vault: MockVaultClient,
    pub metrics: Arc<Metrics>,
}

impl TestHarness {
    pub fn new(pods: Vec<Pod>) -> Self {
        Self::with_factory(pods, MockClientFactory::default())
    }

    pub fn with_factory(pods: Vec<Pod>, factory: MockClientFactory) -> Self {
        let config = ControllerConfig {
            min_cycle_spacing: std::time::Duration::ZERO,
            ..ControllerConfig::default()
        };
        Self::build(pods, factory, config)
    }

    pub fn build(pods: Vec<Pod>, factory: MockClientFactory, config: ControllerConfig) -> Self {
        let secrets = Arc::new(FakeSecretSource::new());
        let pods = Arc::new(FakePodLister::new(pods));
        let status = Arc::new(FakeStatusStore::new());
        let vault = factory.client.clone();
        let factory = Arc::new(factory);
        let metrics = Arc::new(Metrics::new().unwrap());

        let reconciler = Reconciler::new(
            secrets.clone(),
            pods.clone(),
            status.clone(),
            factory.clone(),
            metrics.clone(),
            config,
        );

        Self {
            reconciler,
            secrets,
            pods,
            status,
            factory,
            vault,
            metrics,
        }
    }
}
