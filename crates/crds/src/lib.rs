//! VaultUnseal CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Vault unseal controller.

pub mod conditions;
pub mod references;
pub mod vault_unseal;

pub use conditions::*;
pub use references::*;
pub use vault_unseal::*;
