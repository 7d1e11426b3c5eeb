//! Reconciliation logic for VaultUnseal resources.
//!
//! One call to `Reconciler::reconcile` is one unseal cycle for one resource:
//! validate the policy, load key material, resolve target pods, drive every
//! pod, aggregate, publish metrics, write status, and pick the next requeue.
//!
//! - `policy`: spec validation into an immutable per-cycle policy
//! - `keys`: key share loading and threshold checks
//! - `targets`: pod discovery and addressing
//! - `driver`: per-pod unseal state machine
//! - `status`: aggregation and status projection
//! - `capabilities`: traits over the Kubernetes API and the Vault client

pub mod capabilities;
pub mod driver;
pub mod keys;
pub mod policy;
pub mod status;
pub mod targets;

#[cfg(test)]
mod reconciler_test;

use crate::backoff::BackoffState;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, StatusStoreError};
use crate::metrics::Metrics;
use capabilities::{PodLister, SecretSource, StatusStore, VaultClientFactory};
use crds::{VaultUnseal, VaultUnsealStatus};
use driver::{DriveResult, PodOutcome, drive_pod};
use futures::StreamExt;
use keys::{KeyShare, load_ca_bundle, load_key_material};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use policy::UnsealPolicy;
use status::{AbortReason, PodResult, ReconcileResult, is_redundant_write};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use targets::{PodTarget, resolve_targets};
use tracing::{debug, error, info, warn};

/// Reconciles VaultUnseal resources.
pub struct Reconciler {
    secrets: Arc<dyn SecretSource>,
    pods: Arc<dyn PodLister>,
    status_store: Arc<dyn StatusStore>,
    clients: Arc<dyn VaultClientFactory>,
    metrics: Arc<Metrics>,
    config: ControllerConfig,
    /// Error count tracking per resource (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        secrets: Arc<dyn SecretSource>,
        pods: Arc<dyn PodLister>,
        status_store: Arc<dyn StatusStore>,
        clients: Arc<dyn VaultClientFactory>,
        metrics: Arc<Metrics>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            secrets,
            pods,
            status_store,
            clients,
            metrics,
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one unseal cycle for a resource.
    ///
    /// Per-pod failures never fail the cycle. An `Err` is returned only when
    /// the status could not be written; the caller's error policy then backs off.
    pub async fn reconcile(&self, resource: &VaultUnseal) -> Result<Action, ControllerError> {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_any();
        let key = format!("{}/{}", namespace, name);

        if let Some(wait) = self.recently_reconciled(resource) {
            debug!(
                "VaultUnseal {} was reconciled moments ago, next cycle in {:?}",
                key, wait
            );
            return Ok(Action::requeue(wait));
        }

        let started = Instant::now();
        info!("Reconciling VaultUnseal {}", key);

        let result = match self.run_cycle(resource, &key).await {
            Ok(result) => result,
            Err((reason, err)) => {
                warn!("Unseal cycle for {} aborted: {}", key, err);
                ReconcileResult::aborted(reason, err.to_string())
            }
        };

        let next = self.next_requeue(&key, &result);
        self.publish_metrics(&namespace, &name, &result, started.elapsed());

        self.write_status(resource, &result, next).await?;

        info!(
            "VaultUnseal {}: {:?}, {}/{} pod(s) unsealed, {} share(s) accepted, next cycle in {:?}",
            key,
            result.phase,
            result.unsealed_pods.len(),
            result.pods_checked.len(),
            result.shares_applied(),
            next
        );
        Ok(Action::requeue(next))
    }

    /// Error policy for the controller runtime: log, count and back off
    pub fn error_policy(&self, resource: &VaultUnseal, error: &ControllerError) -> Action {
        let key = format!(
            "{}/{}",
            resource.namespace().unwrap_or_default(),
            resource.name_any()
        );
        let (backoff, error_count) = self.record_failure(&key);
        error!(
            "Reconciliation error for VaultUnseal {} (attempt {}): {}, retrying in {:?}",
            key, error_count, error, backoff
        );
        self.metrics.record_error("reconcile");
        self.metrics.record_requeue("error");
        Action::requeue(backoff)
    }

    /// Drop per-resource state of a VaultUnseal that no longer exists
    pub fn forget(&self, namespace: &str, name: &str) {
        debug!("Forgetting deleted VaultUnseal {}/{}", namespace, name);
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(&format!("{}/{}", namespace, name));
        }
        self.metrics.forget_resource(namespace, name);
    }

    /// Everything between validation and aggregation. `Err` means the cycle
    /// stopped before any submission.
    async fn run_cycle(
        &self,
        resource: &VaultUnseal,
        key: &str,
    ) -> Result<ReconcileResult, (AbortReason, ControllerError)> {
        let policy =
            UnsealPolicy::from_resource(resource).map_err(|e| (AbortReason::InvalidSpec, e))?;

        let material = load_key_material(self.secrets.as_ref(), &policy)
            .await
            .map_err(|e| (AbortReason::KeyMaterial, e))?;
        debug!(
            "Loaded {} distinct key share(s) for {} (threshold {})",
            material.len(),
            key,
            material.threshold()
        );
        for (source, shares) in material.by_source() {
            debug!("  {} share(s) from {}", shares.len(), source);
        }

        let ca_pem = load_ca_bundle(self.secrets.as_ref(), &policy)
            .await
            .map_err(|e| (AbortReason::Tls, e))?;
        let client = self
            .clients
            .client_for(&policy, ca_pem)
            .map_err(|e| (AbortReason::Tls, ControllerError::Tls(e.to_string())))?;

        let targets = resolve_targets(self.pods.as_ref(), &policy)
            .await
            .map_err(|e| (AbortReason::Targets, ControllerError::Targets(e.to_string())))?;
        if targets.is_empty() {
            info!("No pods match selector '{}' for {}", policy.selector, key);
        }

        let (driven, skipped) = split_targets(targets, policy.ha_mode);
        let shares: Arc<[KeyShare]> = material.into_shares().into();

        let deadline = tokio::time::Instant::now() + self.config.cycle_timeout;
        let drive_results: Vec<(PodTarget, DriveResult)> =
            futures::stream::iter(driven.into_iter().map(|target| {
                let client = client.clone();
                let shares = shares.clone();
                async move {
                    let submitted = AtomicU32::new(0);
                    let result = tokio::time::timeout_at(
                        deadline,
                        drive_pod(client.as_ref(), &target, &shares, &submitted),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        warn!("Cycle deadline exceeded while unsealing pod {}", target.name);
                        DriveResult::deadline_exceeded(submitted.load(Ordering::Relaxed))
                    });
                    (target, result)
                }
            }))
            .buffered(policy.max_concurrent_pods)
            .collect()
            .await;

        let mut submissions = 0u64;
        let mut pod_results = Vec::with_capacity(drive_results.len() + skipped.len());
        for (target, drive) in drive_results {
            submissions += u64::from(drive.submissions);
            for kind in &drive.error_kinds {
                self.metrics.record_error(kind);
            }
            pod_results.push(PodResult {
                name: target.name,
                outcome: drive.outcome,
            });
        }
        for target in skipped {
            pod_results.push(PodResult {
                name: target.name,
                outcome: PodOutcome::Skipped,
            });
        }
        pod_results.sort_by(|a, b| a.name.cmp(&b.name));

        let namespace = resource.namespace().unwrap_or_default();
        self.metrics
            .record_share_submissions(&namespace, &resource.name_any(), submissions);

        let mut result = ReconcileResult::from_outcomes(pod_results);
        result.reconcile_interval = Some(policy.reconcile_interval);
        Ok(result)
    }

    /// Next requeue for a finished cycle. Also resets or advances the
    /// per-resource backoff.
    fn next_requeue(&self, key: &str, result: &ReconcileResult) -> Duration {
        if result.aborted.is_some() {
            let (backoff, _) = self.record_failure(key);
            self.metrics.record_requeue("backoff");
            return backoff;
        }

        self.reset_backoff(key);
        let interval = result
            .reconcile_interval
            .unwrap_or(self.config.degraded_requeue);
        if result.degraded {
            self.metrics.record_requeue("degraded");
            interval.min(self.config.degraded_requeue)
        } else {
            self.metrics.record_requeue("healthy");
            interval
        }
    }

    fn publish_metrics(
        &self,
        namespace: &str,
        name: &str,
        result: &ReconcileResult,
        elapsed: Duration,
    ) {
        let outcome = match (&result.aborted, result.degraded) {
            (Some(reason), _) => {
                self.metrics.record_error(reason.kind());
                "aborted"
            }
            (None, true) => "degraded",
            (None, false) => "success",
        };
        self.metrics.record_reconciliation(namespace, name, outcome);
        self.metrics.observe_duration(namespace, name, elapsed.as_secs_f64());

        if result.aborted.is_none() {
            self.metrics.set_pod_counts(
                namespace,
                name,
                result.pods_checked.len(),
                result.unsealed_pods.len(),
            );
            let pods: Vec<(String, &str)> = result
                .pod_results
                .iter()
                .map(|r| (r.name.clone(), r.outcome.label()))
                .collect();
            self.metrics.set_pod_statuses(namespace, name, &pods);
        }
    }

    /// Persist the cycle result, retrying on resource version conflicts.
    ///
    /// A resource deleted mid-cycle is not an error. A result that matches the
    /// stored status in everything but its timestamps is not written until the
    /// stored `nextReconcileTime` has passed, so the watch event of our own
    /// write does not lead to another write.
    async fn write_status(
        &self,
        resource: &VaultUnseal,
        result: &ReconcileResult,
        next: Duration,
    ) -> Result<(), ControllerError> {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_any();
        let generation = resource.metadata.generation;

        let mut previous: Option<VaultUnsealStatus> = resource.status.clone();
        let mut resource_version = resource.metadata.resource_version.clone();

        for attempt in 1..=self.config.status_write_retries {
            let now = chrono::Utc::now();
            let status = result.to_status(previous.as_ref(), generation, now, next);
            if let Some(stored) = previous.as_ref()
                && is_redundant_write(stored, &status, now)
            {
                debug!("Status of {}/{} unchanged, skipping write", namespace, name);
                return Ok(());
            }
            match self
                .status_store
                .patch_status(&namespace, &name, resource_version.as_deref(), &status)
                .await
            {
                Ok(()) => return Ok(()),
                Err(StatusStoreError::NotFound) => {
                    debug!("VaultUnseal {}/{} deleted before status write", namespace, name);
                    self.forget(&namespace, &name);
                    return Ok(());
                }
                Err(StatusStoreError::Conflict) => {
                    debug!(
                        "Status conflict for {}/{} (attempt {}), re-reading",
                        namespace, name, attempt
                    );
                    match self.status_store.get_status(&namespace, &name).await {
                        Ok(Some(latest)) => {
                            previous = latest.status;
                            resource_version = latest.resource_version;
                        }
                        Ok(None) => {
                            self.forget(&namespace, &name);
                            return Ok(());
                        }
                        Err(e) => {
                            return Err(ControllerError::Status(format!(
                                "failed to re-read {}/{}: {}",
                                namespace, name, e
                            )));
                        }
                    }
                }
                Err(StatusStoreError::Api(msg)) => {
                    error!("Failed to update status for {}/{}: {}", namespace, name, msg);
                    self.metrics.record_error("status");
                    return Err(ControllerError::Status(msg));
                }
            }
        }

        self.metrics.record_error("status");
        Err(ControllerError::Status(format!(
            "gave up on {}/{} after {} conflicting writes",
            namespace, name, self.config.status_write_retries
        )))
    }

    /// Time left of `min_cycle_spacing` when the resource was reconciled
    /// moments ago at the same generation. Events in that window (our own
    /// status write, pod restarts) are deferred to the end of it, not dropped.
    fn recently_reconciled(&self, resource: &VaultUnseal) -> Option<Duration> {
        let status = resource.status.as_ref()?;
        if status.observed_generation != resource.metadata.generation {
            return None;
        }
        let last = status.last_reconcile_time?;
        let now = chrono::Utc::now();
        let since_last = (now - last).to_std().ok()?;
        if since_last >= self.config.min_cycle_spacing {
            return None;
        }

        Some(self.config.min_cycle_spacing - since_last)
    }

    fn record_failure(&self, key: &str) -> (Duration, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(key.to_string()).or_default();
                let backoff = state.record_failure();
                (backoff, state.error_count())
            }
            Err(_) => (BackoffState::default().record_failure(), 1),
        }
    }

    fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock()
            && let Some(state) = states.get_mut(key)
        {
            state.reset();
        }
    }
}

/// Split resolved targets into the pods to drive and the pods to skip.
///
/// With HA off only the first pod (by name) is driven.
fn split_targets(targets: Vec<PodTarget>, ha_mode: bool) -> (Vec<PodTarget>, Vec<PodTarget>) {
    if ha_mode {
        return (targets, Vec::new());
    }
    let mut targets = targets.into_iter();
    let driven: Vec<PodTarget> = targets.next().into_iter().collect();
    (driven, targets.collect())
}
