//! Vault API models
//!
//! These models match the `sys/seal-status` and `sys/unseal` endpoints.
//! See: https://developer.hashicorp.com/vault/api-docs/system/unseal

use serde::{Deserialize, Serialize};
use std::fmt;

/// Seal status as returned by `GET /v1/sys/seal-status` and `PUT /v1/sys/unseal`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealStatus {
    /// Seal type (e.g. "shamir")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub seal_type: Option<String>,

    #[serde(default)]
    pub initialized: bool,

    pub sealed: bool,

    /// Shares required to unseal
    #[serde(rename = "t", default)]
    pub threshold: u32,

    /// Total number of shares
    #[serde(rename = "n", default)]
    pub shares: u32,

    /// Shares accepted so far in the current unseal attempt
    #[serde(default)]
    pub progress: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

impl SealStatus {
    /// Unsealed node with the given threshold
    pub fn unsealed(threshold: u32) -> Self {
        Self {
            seal_type: Some("shamir".to_string()),
            initialized: true,
            sealed: false,
            threshold,
            shares: threshold,
            progress: 0,
            version: None,
            cluster_name: None,
        }
    }

    /// Sealed node with the given threshold and progress
    pub fn sealed(threshold: u32, progress: u32) -> Self {
        Self {
            sealed: true,
            progress,
            ..Self::unsealed(threshold)
        }
    }
}

/// Request body for `PUT /v1/sys/unseal`
#[derive(Clone, Serialize)]
pub struct UnsealRequest<'a> {
    pub key: &'a str,
}

impl fmt::Debug for UnsealRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealRequest").field("key", &"<redacted>").finish()
    }
}

/// Error body returned by Vault on non-2xx responses
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorResponse {
    #[serde(default)]
    pub errors: Vec<String>,
}
