//! VaultClient trait for mocking
//!
//! The concrete `VaultClient` implements this trait, and tests use `MockVaultClient`.

use crate::error::VaultError;
use crate::models::SealStatus;

/// Seal operations against a single Vault node.
///
/// `address` is the host part of the node URL (pod IP or DNS name); scheme,
/// port and TLS settings belong to the client.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait VaultClientTrait: Send + Sync {
    /// Query the seal status of a node
    async fn seal_status(&self, address: &str) -> Result<SealStatus, VaultError>;

    /// Submit one unseal key share to a node
    async fn submit_key_share(&self, address: &str, share: &str) -> Result<SealStatus, VaultError>;
}
