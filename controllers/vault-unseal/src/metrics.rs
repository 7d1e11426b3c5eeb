//! # Controller Metrics
//!
//! Prometheus metrics for unseal cycles: attempts, share submissions, errors
//! by kind, pod gauges, cycle duration and requeues.
//!
//! One `Metrics` value owns its own `Registry`. It is built once in `main`,
//! shared with the reconciler and the HTTP server, and never touched through
//! globals so tests can build as many as they like.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const NAMESPACE: &str = "vault_unseal";

/// Metrics for the Vault Unseal Controller
pub struct Metrics {
    registry: Registry,
    reconciliations_total: IntCounterVec,
    share_submissions_total: IntCounterVec,
    errors_total: IntCounterVec,
    pods_unsealed: IntGaugeVec,
    pods_checked: IntGaugeVec,
    reconcile_duration: HistogramVec,
    pod_status: IntGaugeVec,
    requeues_total: IntCounterVec,
    /// Pods that currently have a `pod_status` series, per `namespace/name`
    known_pods: Mutex<HashMap<String, HashSet<String>>>,
}

impl Metrics {
    /// Create and register every metric on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new("reconciliations_total", "Total number of unseal cycles by result")
                .namespace(NAMESPACE),
            &["namespace", "name", "result"],
        )?;
        let share_submissions_total = IntCounterVec::new(
            Opts::new("share_submissions_total", "Total number of key shares submitted to Vault")
                .namespace(NAMESPACE),
            &["namespace", "name"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Total number of errors by kind").namespace(NAMESPACE),
            &["kind"],
        )?;
        let pods_unsealed = IntGaugeVec::new(
            Opts::new("pods_unsealed", "Pods reported unsealed by the last cycle")
                .namespace(NAMESPACE),
            &["namespace", "name"],
        )?;
        let pods_checked = IntGaugeVec::new(
            Opts::new("pods_checked", "Pods considered by the last cycle").namespace(NAMESPACE),
            &["namespace", "name"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Duration of one unseal cycle in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["namespace", "name"],
        )?;
        let pod_status = IntGaugeVec::new(
            Opts::new(
                "pod_status",
                "1 for the outcome each pod reached in the last cycle, 0 otherwise",
            )
            .namespace(NAMESPACE),
            &["namespace", "name", "pod", "status"],
        )?;
        let requeues_total = IntCounterVec::new(
            Opts::new("requeues_total", "Total number of requeues by reason").namespace(NAMESPACE),
            &["reason"],
        )?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(share_submissions_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(pods_unsealed.clone()))?;
        registry.register(Box::new(pods_checked.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(pod_status.clone()))?;
        registry.register(Box::new(requeues_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            share_submissions_total,
            errors_total,
            pods_unsealed,
            pods_checked,
            reconcile_duration,
            pod_status,
            requeues_total,
            known_pods: Mutex::new(HashMap::new()),
        })
    }

    pub fn record_reconciliation(&self, namespace: &str, name: &str, result: &str) {
        self.reconciliations_total
            .with_label_values(&[namespace, name, result])
            .inc();
    }

    pub fn record_share_submissions(&self, namespace: &str, name: &str, count: u64) {
        if count > 0 {
            self.share_submissions_total
                .with_label_values(&[namespace, name])
                .inc_by(count);
        }
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn set_pod_counts(&self, namespace: &str, name: &str, checked: usize, unsealed: usize) {
        self.pods_checked
            .with_label_values(&[namespace, name])
            .set(checked as i64);
        self.pods_unsealed
            .with_label_values(&[namespace, name])
            .set(unsealed as i64);
    }

    pub fn observe_duration(&self, namespace: &str, name: &str, seconds: f64) {
        self.reconcile_duration
            .with_label_values(&[namespace, name])
            .observe(seconds);
    }

    pub fn record_requeue(&self, reason: &str) {
        self.requeues_total.with_label_values(&[reason]).inc();
    }

    /// Publish the per-pod outcome gauges of one cycle.
    ///
    /// Every known status label is written for every pod so that exactly one
    /// series per pod reads 1. Series are labelled with the owning resource,
    /// so two resources selecting the same pod keep separate series. Series
    /// for pods that disappeared since the previous cycle of the same
    /// resource are removed.
    pub fn set_pod_statuses(&self, namespace: &str, name: &str, pods: &[(String, &str)]) {
        let current: HashSet<String> = pods.iter().map(|(pod, _)| pod.clone()).collect();

        for (pod, status) in pods {
            for &label in POD_STATUS_LABELS {
                let value = i64::from(label == *status);
                self.pod_status
                    .with_label_values(&[namespace, name, pod.as_str(), label])
                    .set(value);
            }
        }

        let Ok(mut known) = self.known_pods.lock() else {
            return;
        };
        let previous = known.insert(format!("{}/{}", namespace, name), current.clone());
        for stale in previous.unwrap_or_default().difference(&current) {
            self.remove_pod_status(namespace, name, stale);
        }
    }

    /// Drop every per-resource series of a VaultUnseal that no longer exists
    pub fn forget_resource(&self, namespace: &str, name: &str) {
        let labels = [namespace, name];
        // Missing series are fine
        let _ = self.pods_checked.remove_label_values(&labels);
        let _ = self.pods_unsealed.remove_label_values(&labels);
        let _ = self.reconcile_duration.remove_label_values(&labels);
        let _ = self.share_submissions_total.remove_label_values(&labels);
        for &result in RECONCILE_RESULTS {
            let _ = self
                .reconciliations_total
                .remove_label_values(&[namespace, name, result]);
        }

        let Ok(mut known) = self.known_pods.lock() else {
            return;
        };
        for pod in known.remove(&format!("{}/{}", namespace, name)).unwrap_or_default() {
            self.remove_pod_status(namespace, name, &pod);
        }
    }

    fn remove_pod_status(&self, namespace: &str, name: &str, pod: &str) {
        for &label in POD_STATUS_LABELS {
            let _ = self
                .pod_status
                .remove_label_values(&[namespace, name, pod, label]);
        }
    }

    /// Encode every metric in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Values of the `result` label on `reconciliations_total`
pub const RECONCILE_RESULTS: &[&str] = &["success", "degraded", "aborted"];

/// Outcome labels used by the `pod_status` gauge
pub const POD_STATUS_LABELS: &[&str] = &[
    "already_unsealed",
    "unsealed",
    "partially_unsealed",
    "unreachable",
    "failed",
    "skipped",
];
