//! Aggregation of per-pod outcomes and projection into `VaultUnsealStatus`.

use crate::reconciler::driver::PodOutcome;
use chrono::{DateTime, Utc};
use crds::{
    CONDITION_KEY_MATERIAL_ERROR, CONDITION_PARTIAL_UNSEAL, CONDITION_READY,
    CONDITION_VAULT_UNREACHABLE, Condition, ConditionStatus, PodUnsealStatus, UnsealPhase,
    VaultUnsealStatus, set_condition,
};
use std::time::Duration;

pub const REASON_ALL_UNSEALED: &str = "AllUnsealed";
pub const REASON_PODS_SEALED: &str = "PodsSealed";
pub const REASON_NO_TARGETS: &str = "NoTargets";
pub const REASON_KEYS_LOADED: &str = "KeysLoaded";
pub const REASON_KEY_MATERIAL_ERROR: &str = "KeyMaterialError";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_TLS_CONFIG_ERROR: &str = "TLSConfigError";
pub const REASON_TARGET_RESOLUTION_FAILED: &str = "TargetResolutionFailed";
pub const REASON_PODS_UNREACHABLE: &str = "PodsUnreachable";
pub const REASON_ALL_REACHABLE: &str = "AllReachable";
pub const REASON_INSUFFICIENT_SHARES: &str = "InsufficientShares";
pub const REASON_NO_PARTIAL_UNSEAL: &str = "NoPartialUnseal";

/// Outcome of one pod, by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodResult {
    pub name: String,
    pub outcome: PodOutcome,
}

/// Why a cycle stopped before reaching any pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    InvalidSpec,
    KeyMaterial,
    Tls,
    Targets,
}

impl AbortReason {
    pub fn reason(&self) -> &'static str {
        match self {
            AbortReason::InvalidSpec => REASON_INVALID_SPEC,
            AbortReason::KeyMaterial => REASON_KEY_MATERIAL_ERROR,
            AbortReason::Tls => REASON_TLS_CONFIG_ERROR,
            AbortReason::Targets => REASON_TARGET_RESOLUTION_FAILED,
        }
    }

    /// Metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            AbortReason::InvalidSpec => "invalid_spec",
            AbortReason::KeyMaterial => "key_material",
            AbortReason::Tls => "tls",
            AbortReason::Targets => "targets",
        }
    }
}

/// Aggregated result of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    pub pods_checked: Vec<String>,
    pub unsealed_pods: Vec<String>,
    pub pod_results: Vec<PodResult>,
    pub conditions: Vec<Condition>,
    pub phase: UnsealPhase,
    /// Some pod is partially unsealed, unreachable or failed
    pub degraded: bool,
    pub aborted: Option<AbortReason>,
    /// Interval of the policy this result was produced under
    pub reconcile_interval: Option<Duration>,
}

impl ReconcileResult {
    /// Aggregate the per-pod outcomes of a completed cycle
    pub fn from_outcomes(pod_results: Vec<PodResult>) -> Self {
        let pods_checked: Vec<String> = pod_results.iter().map(|r| r.name.clone()).collect();
        let unsealed_pods: Vec<String> = pod_results
            .iter()
            .filter(|r| r.outcome.is_unsealed())
            .map(|r| r.name.clone())
            .collect();

        let driven: Vec<&PodResult> = pod_results
            .iter()
            .filter(|r| r.outcome != PodOutcome::Skipped)
            .collect();
        let unreachable = names_where(&driven, |o| matches!(o, PodOutcome::Unreachable(_)));
        let partial = names_where(&driven, |o| matches!(o, PodOutcome::PartiallyUnsealed { .. }));
        let failed = names_where(&driven, |o| matches!(o, PodOutcome::Failed(_)));
        let degraded = driven.iter().any(|r| r.outcome.is_degraded());

        let mut conditions = vec![Condition::new(
            CONDITION_KEY_MATERIAL_ERROR,
            ConditionStatus::False,
            REASON_KEYS_LOADED,
            "Key shares loaded",
        )];

        conditions.push(if unreachable.is_empty() {
            Condition::new(
                CONDITION_VAULT_UNREACHABLE,
                ConditionStatus::False,
                REASON_ALL_REACHABLE,
                "",
            )
        } else {
            Condition::new(
                CONDITION_VAULT_UNREACHABLE,
                ConditionStatus::True,
                REASON_PODS_UNREACHABLE,
                format!("Unreachable pods: {}", unreachable.join(", ")),
            )
        });

        conditions.push(if partial.is_empty() {
            Condition::new(
                CONDITION_PARTIAL_UNSEAL,
                ConditionStatus::False,
                REASON_NO_PARTIAL_UNSEAL,
                "",
            )
        } else {
            Condition::new(
                CONDITION_PARTIAL_UNSEAL,
                ConditionStatus::True,
                REASON_INSUFFICIENT_SHARES,
                format!("Still sealed after every share: {}", partial.join(", ")),
            )
        });

        let (ready, phase) = if driven.is_empty() {
            (
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    REASON_NO_TARGETS,
                    "No pods match the selector",
                ),
                UnsealPhase::Pending,
            )
        } else if driven.iter().all(|r| r.outcome.is_unsealed()) {
            (
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::True,
                    REASON_ALL_UNSEALED,
                    format!("{} pod(s) unsealed", driven.len()),
                ),
                UnsealPhase::Ready,
            )
        } else {
            let mut problems = Vec::new();
            if !partial.is_empty() {
                problems.push(format!("partially unsealed: {}", partial.join(", ")));
            }
            if !unreachable.is_empty() {
                problems.push(format!("unreachable: {}", unreachable.join(", ")));
            }
            if !failed.is_empty() {
                problems.push(format!("failed: {}", failed.join(", ")));
            }
            (
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    REASON_PODS_SEALED,
                    problems.join("; "),
                ),
                UnsealPhase::Degraded,
            )
        };
        conditions.push(ready);

        Self {
            pods_checked,
            unsealed_pods,
            pod_results,
            conditions,
            phase,
            degraded,
            aborted: None,
            reconcile_interval: None,
        }
    }

    /// Result of a cycle that stopped before any Vault call
    pub fn aborted(reason: AbortReason, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut conditions = Vec::new();
        if reason == AbortReason::KeyMaterial {
            conditions.push(Condition::new(
                CONDITION_KEY_MATERIAL_ERROR,
                ConditionStatus::True,
                REASON_KEY_MATERIAL_ERROR,
                message.clone(),
            ));
        }
        conditions.push(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            reason.reason(),
            message,
        ));

        Self {
            pods_checked: Vec::new(),
            unsealed_pods: Vec::new(),
            pod_results: Vec::new(),
            conditions,
            phase: UnsealPhase::Failed,
            degraded: false,
            aborted: Some(reason),
            reconcile_interval: None,
        }
    }

    /// Accepted shares across every pod
    pub fn shares_applied(&self) -> u32 {
        self.pod_results
            .iter()
            .map(|r| r.outcome.shares_applied())
            .sum()
    }

    /// Project onto a status, merging conditions into `previous`.
    ///
    /// Conditions are replaced by type and keep their transition time when the
    /// status did not change. Conditions this result does not mention keep
    /// their previous value.
    pub fn to_status(
        &self,
        previous: Option<&VaultUnsealStatus>,
        generation: Option<i64>,
        now: DateTime<Utc>,
        next_reconcile: Duration,
    ) -> VaultUnsealStatus {
        let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();
        for condition in &self.conditions {
            let mut condition = condition.clone();
            condition.last_transition_time = Some(now);
            set_condition(&mut conditions, condition);
        }

        let next = chrono::Duration::from_std(next_reconcile)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        VaultUnsealStatus {
            phase: Some(self.phase),
            pods_checked: self.pods_checked.clone(),
            unsealed_pods: self.unsealed_pods.clone(),
            pod_statuses: self
                .pod_results
                .iter()
                .map(|r| PodUnsealStatus {
                    name: r.name.clone(),
                    outcome: r.outcome.label().to_string(),
                    shares_applied: r.outcome.shares_applied(),
                    message: r.outcome.message(),
                })
                .collect(),
            conditions,
            observed_generation: generation,
            last_reconcile_time: Some(now),
            next_reconcile_time: next,
        }
    }
}

/// True when `status` differs from `stored` only in its timestamps and the
/// stored `nextReconcileTime` is still ahead of `now`.
pub fn is_redundant_write(stored: &VaultUnsealStatus, status: &VaultUnsealStatus, now: DateTime<Utc>) -> bool {
    if stored.next_reconcile_time.is_none_or(|next| next <= now) {
        return false;
    }
    let mut restamped = status.clone();
    restamped.last_reconcile_time = stored.last_reconcile_time;
    restamped.next_reconcile_time = stored.next_reconcile_time;
    restamped == *stored
}

fn names_where(results: &[&PodResult], predicate: impl Fn(&PodOutcome) -> bool) -> Vec<String> {
    results
        .iter()
        .filter(|r| predicate(&r.outcome))
        .map(|r| r.name.clone())
        .collect()
}
