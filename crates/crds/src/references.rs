//! Secret references used by the VaultUnseal CRD
//!
//! Follows the Kubernetes `SecretKeySelector` pattern with an optional namespace
//! so that unseal keys can live outside the namespace of the Vault deployment.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a Kubernetes Secret (and optionally a single key inside it)
///
/// - With `key` set, only that data entry is read. The entry may hold several
///   key shares, one per line.
/// - Without `key`, every data entry of the Secret is treated as one key share.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Name of the Secret
    pub name: String,

    /// Namespace of the Secret (defaults to the namespace of the VaultUnseal resource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Data key inside the Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SecretKeyReference {
    /// Create a reference to a whole Secret in the same namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            key: None,
        }
    }

    /// Create a reference to a single key of a Secret in the same namespace
    pub fn with_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            key: Some(key.into()),
        }
    }

    /// Namespace to read the Secret from, falling back to `default_namespace`
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_namespace)
    }
}

impl fmt::Display for SecretKeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}/", ns)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(key) = &self.key {
            write!(f, "[{}]", key)?;
        }
        Ok(())
    }
}
