//! Vault Seal API Client
//!
//! A small client for the HashiCorp Vault endpoints involved in unsealing a
//! node: seal status and key share submission.
//!
//! # Example
//!
//! ```no_run
//! use vault_client::{VaultClient, VaultClientConfig, VaultClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = VaultClient::new(VaultClientConfig::default())?;
//!
//! let status = client.seal_status("10.0.0.12").await?;
//! if status.sealed {
//!     let status = client.submit_key_share("10.0.0.12", "share-1").await?;
//!     println!("progress {}/{}", status.progress, status.threshold);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Errors
//!
//! Failures are split into connection errors (nothing answered), protocol
//! errors (the answer was not understood) and rejected shares (Vault refused
//! the key share). The client never retries.

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod vault_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{VaultClient, VaultClientConfig};
pub use error::VaultError;
pub use models::*;
pub use vault_trait::VaultClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockCall, MockNode, MockVaultClient};
