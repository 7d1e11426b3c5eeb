//! VaultUnseal CRD
//!
//! Declares a Vault deployment (by pod label selector), where its unseal key
//! shares live, and how the controller should unseal it.

use crate::conditions::Condition;
use crate::references::SecretKeyReference;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default spacing between automatic reconcile cycles
pub const DEFAULT_RECONCILE_INTERVAL: &str = "30s";
/// Default Vault API port
pub const DEFAULT_VAULT_PORT: u16 = 8200;
/// Default per-request timeout toward Vault, in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 5;
/// Default number of pods driven in parallel within one cycle
pub const DEFAULT_MAX_CONCURRENT_PODS: u32 = 4;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "VaultUnseal",
    namespaced,
    status = "VaultUnsealStatus",
    shortname = "vu",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Unsealed","type":"string","jsonPath":".status.unsealedPods"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultUnsealSpec {
    /// How to reach the Vault API on each pod
    #[serde(default)]
    pub vault: VaultEndpointSpec,

    /// TLS settings for the Vault API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<VaultTlsSpec>,

    /// Label selector identifying Vault pods (e.g. "app.kubernetes.io/name=vault")
    pub selector: String,

    /// Secrets holding unseal key shares, in the order they are tried
    pub unseal_keys: Vec<SecretKeyReference>,

    /// Distinct key shares required to unseal one Vault node.
    /// Defaults to every loaded share.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_threshold: Option<u32>,

    /// When true every matching pod is an independent Vault node.
    /// When false only the first matching pod (by name) is unsealed.
    #[serde(default)]
    pub ha_enabled: bool,

    /// Minimum interval between automatic reconciliations (e.g. "30s", "5m")
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,

    /// Per-request timeout toward Vault, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_seconds: Option<u64>,

    /// Maximum number of pods handled in parallel within one reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_pods: Option<u32>,
}

fn default_reconcile_interval() -> String {
    DEFAULT_RECONCILE_INTERVAL.to_string()
}

/// Vault API endpoint on each pod
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultEndpointSpec {
    /// URL scheme
    #[serde(default)]
    pub scheme: VaultScheme,

    /// API port
    #[serde(default = "default_vault_port")]
    pub port: u16,

    /// Headless service name. When set pods are addressed as
    /// `<pod>.<serviceName>.<namespace>.svc`, otherwise by pod IP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

impl Default for VaultEndpointSpec {
    fn default() -> Self {
        Self {
            scheme: VaultScheme::default(),
            port: DEFAULT_VAULT_PORT,
            service_name: None,
        }
    }
}

fn default_vault_port() -> u16 {
    DEFAULT_VAULT_PORT
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VaultScheme {
    #[default]
    Http,
    Https,
}

impl VaultScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            VaultScheme::Http => "http",
            VaultScheme::Https => "https",
        }
    }
}

/// TLS settings for the Vault API
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VaultTlsSpec {
    /// Secret key holding a PEM CA bundle trusted for the Vault API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<SecretKeyReference>,

    /// Skip certificate and hostname verification
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultUnsealStatus {
    /// Overall phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<UnsealPhase>,

    /// Every pod resolved in the last reconciliation
    #[serde(default)]
    pub pods_checked: Vec<String>,

    /// Pods confirmed unsealed in the last reconciliation (subset of podsChecked)
    #[serde(default)]
    pub unsealed_pods: Vec<String>,

    /// Outcome per pod in the last reconciliation
    #[serde(default)]
    pub pod_statuses: Vec<PodUnsealStatus>,

    /// Conditions, at most one per type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation observed by the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Next scheduled reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_reconcile_time: Option<DateTime<Utc>>,
}

/// Outcome recorded for one pod
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodUnsealStatus {
    /// Pod name
    pub name: String,

    /// Outcome (already_unsealed, unsealed, partially_unsealed, unreachable, failed, skipped)
    pub outcome: String,

    /// Key shares accepted by Vault for this pod in the last reconciliation
    #[serde(default)]
    pub shares_applied: u32,

    /// Detail for failed outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall phase
///
/// Serializes as PascalCase ("Ready", "Degraded", ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum UnsealPhase {
    /// Not reconciled yet
    #[default]
    Pending,

    /// Every checked pod is unsealed (or there was nothing to unseal)
    Ready,

    /// Some pods are unreachable, failed, or still sealed
    Degraded,

    /// Reconciliation could not start (invalid spec or key material)
    Failed,
}
