//! Target resolution: which pods to unseal and how to reach them.

use crate::error::ControllerError;
use crate::reconciler::capabilities::PodLister;
use crate::reconciler::policy::UnsealPolicy;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

/// A candidate Vault pod for one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub name: String,
    pub namespace: String,
    pub ip: Option<String>,
    /// Pod `Ready` condition. Sealed Vault pods usually report not ready.
    pub ready: bool,
    /// Host used to reach the Vault API; `None` when the pod has no address yet
    pub address: Option<String>,
}

/// Convert a Pod into a target, skipping terminating and finished pods
pub fn pod_target_from(pod: &Pod) -> Option<PodTarget> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }

    let status = pod.status.as_ref();
    if matches!(
        status.and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    ) {
        return None;
    }

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let ip = status
        .and_then(|s| s.pod_ip.clone())
        .filter(|ip| !ip.is_empty());

    Some(PodTarget {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        ip,
        ready,
        address: None,
    })
}

/// Resolve the ordered target list of a policy.
///
/// Pods are sorted by name. With a headless service configured, pods are
/// addressed by DNS (`<pod>.<service>.<namespace>.svc`); otherwise by IP. A pod
/// without an IP keeps `address: None` and is reported unreachable.
pub async fn resolve_targets(
    pods: &dyn PodLister,
    policy: &UnsealPolicy,
) -> Result<Vec<PodTarget>, ControllerError> {
    let mut targets = pods.list_pods(&policy.namespace, &policy.selector).await?;
    targets.sort_by(|a, b| a.name.cmp(&b.name));
    targets.dedup_by(|a, b| a.name == b.name);

    for target in &mut targets {
        target.address = target.ip.as_ref().map(|ip| match &policy.service_name {
            Some(service) => format!("{}.{}.{}.svc", target.name, service, target.namespace),
            None => ip.clone(),
        });
    }

    debug!(
        "Resolved {} target pod(s) for selector '{}' in {}",
        targets.len(),
        policy.selector,
        policy.namespace
    );
    Ok(targets)
}
