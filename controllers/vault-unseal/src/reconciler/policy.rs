//! Unseal policy derived from a `VaultUnseal` spec.
//!
//! Validation happens here, before any secret read or network call, so a bad
//! spec fails the cycle fast with an `InvalidSpec` reason.

use crate::error::ControllerError;
use crate::selector::LabelSelector;
use crds::{
    DEFAULT_MAX_CONCURRENT_PODS, DEFAULT_REQUEST_TIMEOUT_SECONDS, SecretKeyReference, VaultScheme,
    VaultTlsSpec, VaultUnseal,
};
use kube::ResourceExt;
use regex::Regex;
use std::time::Duration;

/// Immutable per-cycle unseal policy
#[derive(Debug, Clone)]
pub struct UnsealPolicy {
    /// Namespace of the VaultUnseal resource; default for secret references
    pub namespace: String,
    pub scheme: VaultScheme,
    pub port: u16,
    /// Headless service used for per-pod DNS addressing
    pub service_name: Option<String>,
    pub tls: VaultTlsSpec,
    pub selector: LabelSelector,
    pub key_sources: Vec<SecretKeyReference>,
    /// Configured threshold; `None` means every loaded share is required
    pub threshold: Option<u32>,
    pub ha_mode: bool,
    pub reconcile_interval: Duration,
    pub request_timeout: Duration,
    pub max_concurrent_pods: usize,
}

impl UnsealPolicy {
    /// Build and validate the policy for one resource
    pub fn from_resource(resource: &VaultUnseal) -> Result<Self, ControllerError> {
        let namespace = resource.namespace().ok_or_else(|| {
            ControllerError::InvalidSpec("VaultUnseal has no namespace".to_string())
        })?;
        let spec = &resource.spec;

        let selector: LabelSelector = spec
            .selector
            .parse()
            .map_err(|e| ControllerError::InvalidSpec(format!("selector: {}", e)))?;

        if spec.unseal_keys.is_empty() {
            return Err(ControllerError::InvalidSpec(
                "unsealKeys must reference at least one secret".to_string(),
            ));
        }
        if let Some(source) = spec.unseal_keys.iter().find(|r| r.name.trim().is_empty()) {
            return Err(ControllerError::InvalidSpec(format!(
                "unsealKeys entry has an empty secret name ({})",
                source
            )));
        }

        if spec.key_threshold == Some(0) {
            return Err(ControllerError::InvalidSpec(
                "keyThreshold must be at least 1".to_string(),
            ));
        }

        if spec.vault.port == 0 {
            return Err(ControllerError::InvalidSpec("vault.port must not be 0".to_string()));
        }

        let reconcile_interval = parse_kubernetes_duration(&spec.reconcile_interval)
            .map_err(|e| ControllerError::InvalidSpec(format!("reconcileInterval: {}", e)))?;

        let request_timeout = match spec.request_timeout_seconds {
            Some(0) => {
                return Err(ControllerError::InvalidSpec(
                    "requestTimeoutSeconds must be at least 1".to_string(),
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        };

        let max_concurrent_pods = match spec.max_concurrent_pods {
            Some(0) => {
                return Err(ControllerError::InvalidSpec(
                    "maxConcurrentPods must be at least 1".to_string(),
                ));
            }
            Some(n) => n as usize,
            None => DEFAULT_MAX_CONCURRENT_PODS as usize,
        };

        Ok(Self {
            namespace,
            scheme: spec.vault.scheme,
            port: spec.vault.port,
            service_name: spec
                .vault
                .service_name
                .clone()
                .filter(|s| !s.trim().is_empty()),
            tls: spec.tls.clone().unwrap_or_default(),
            selector,
            key_sources: spec.unseal_keys.clone(),
            threshold: spec.key_threshold,
            ha_mode: spec.ha_enabled,
            reconcile_interval,
            request_timeout,
            max_concurrent_pods,
        })
    }
}

/// Parse a Kubernetes duration string into a `Duration`.
///
/// Format is `<number><unit>` with unit one of `s`, `m`, `h`, `d`
/// (case-insensitive). Zero durations are rejected.
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration, String> {
    let trimmed = duration_str.trim();
    if trimmed.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }

    let duration_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$")
        .map_err(|e| format!("failed to compile regex: {e}"))?;

    let lower = trimmed.to_lowercase();
    let captures = duration_regex.captures(&lower).ok_or_else(|| {
        format!(
            "invalid duration format '{}'. Expected <number><unit> (e.g. '30s', '5m', '1h')",
            trimmed
        )
    })?;

    let number: u64 = captures
        .name("number")
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|e| format!("invalid number in duration '{}': {}", trimmed, e))?;
    if number == 0 {
        return Err(format!("duration '{}' must be greater than zero", trimmed));
    }

    let multiplier = match captures.name("unit").map(|m| m.as_str()) {
        Some("s") => 1,
        Some("m") => 60,
        Some("h") => 3600,
        Some("d") => 86400,
        _ => return Err(format!("invalid unit in duration '{}'", trimmed)),
    };

    number
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", trimmed))
}
