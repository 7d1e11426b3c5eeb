//! Narrow capability traits the reconciler depends on.
//!
//! The Kubernetes-backed implementations live in `crate::cluster`; tests use
//! the in-memory fakes from `crate::test_utils`.

use crate::error::{ControllerError, StatusStoreError};
use crate::reconciler::policy::UnsealPolicy;
use crate::reconciler::targets::PodTarget;
use crate::selector::LabelSelector;
use async_trait::async_trait;
use crds::VaultUnsealStatus;
use std::collections::BTreeMap;
use std::sync::Arc;
use vault_client::{VaultClient, VaultClientConfig, VaultClientTrait, VaultError};

/// Read access to Secret data
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Raw data entries of a Secret, or `None` when it does not exist
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError>;
}

/// Lists candidate Vault pods
#[async_trait]
pub trait PodLister: Send + Sync {
    /// Pods matching `selector` in `namespace`, excluding terminating and
    /// finished pods. Order is unspecified and `address` is left unset.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<PodTarget>, ControllerError>;
}

/// Latest stored state of a VaultUnseal resource
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub status: Option<VaultUnsealStatus>,
    pub resource_version: Option<String>,
}

/// Read/write access to the VaultUnseal status subresource
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// `Ok(None)` when the resource no longer exists
    async fn get_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatusSnapshot>, StatusStoreError>;

    /// Write the status. With `resource_version` set, the write is rejected
    /// with `Conflict` when the stored object has moved on.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &VaultUnsealStatus,
    ) -> Result<(), StatusStoreError>;
}

/// Builds the Vault client used for one cycle
pub trait VaultClientFactory: Send + Sync {
    fn client_for(
        &self,
        policy: &UnsealPolicy,
        ca_pem: Option<Vec<u8>>,
    ) -> Result<Arc<dyn VaultClientTrait>, VaultError>;
}

/// Builds real HTTP clients
#[derive(Debug, Clone, Default)]
pub struct HttpVaultClientFactory;

impl VaultClientFactory for HttpVaultClientFactory {
    fn client_for(
        &self,
        policy: &UnsealPolicy,
        ca_pem: Option<Vec<u8>>,
    ) -> Result<Arc<dyn VaultClientTrait>, VaultError> {
        let client = VaultClient::new(VaultClientConfig {
            scheme: policy.scheme.as_str().to_string(),
            port: policy.port,
            timeout: policy.request_timeout,
            ca_pem,
            skip_verify: policy.tls.skip_verify,
        })?;
        Ok(Arc::new(client))
    }
}
