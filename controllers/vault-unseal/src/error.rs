//! Controller-specific error types.
//!
//! This module defines error types specific to the Vault Unseal Controller
//! that are not covered by upstream library errors.

use thiserror::Error;
use kube::Error as KubeError;
use vault_client::VaultError;

/// Errors that can occur in the Vault Unseal Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Vault API error
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// Unseal key shares missing, unreadable, or fewer than the threshold
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    /// VaultUnseal spec cannot be turned into an unseal policy
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// CA bundle missing or unusable
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Target pods could not be listed
    #[error("Target resolution failed: {0}")]
    Targets(String),

    /// Invalid process configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Status could not be persisted
    #[error("Status update failed: {0}")]
    Status(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics/probe server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

/// Errors returned by the status store.
#[derive(Debug, Error)]
pub enum StatusStoreError {
    /// The resource changed since it was read (HTTP 409)
    #[error("resource version conflict")]
    Conflict,

    /// The resource no longer exists
    #[error("resource not found")]
    NotFound,

    /// Any other API failure
    #[error("{0}")]
    Api(String),
}
