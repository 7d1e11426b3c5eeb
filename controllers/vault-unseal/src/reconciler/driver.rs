//! Per-pod unseal driver.
//!
//! Drives one pod from `Checking` to a terminal outcome:
//!
//! ```text
//! Checking --unsealed--> AlreadyUnsealed
//! Checking --sealed----> Submitting(n) --sealed: false--> Unsealed
//!                                      --shares exhausted--> PartiallyUnsealed
//!                                      --connection/protocol error--> Failed
//! Checking --no answer-> Unreachable
//! ```
//!
//! Shares go out one at a time and submission stops at the first response
//! reporting `sealed: false`. The threshold Vault reports is informational
//! only; the driver keeps going until Vault says unsealed or shares run out.

use crate::reconciler::keys::KeyShare;
use crate::reconciler::targets::PodTarget;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};
use vault_client::{VaultClientTrait, VaultError};

/// Terminal state of one pod for one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodOutcome {
    AlreadyUnsealed,
    Unsealed { shares_applied: u32 },
    PartiallyUnsealed { shares_applied: u32 },
    Unreachable(String),
    Failed(String),
    /// Not driven because HA is off and this is not the primary pod
    Skipped,
}

impl PodOutcome {
    /// Snake-case label used by metrics and status
    pub fn label(&self) -> &'static str {
        match self {
            PodOutcome::AlreadyUnsealed => "already_unsealed",
            PodOutcome::Unsealed { .. } => "unsealed",
            PodOutcome::PartiallyUnsealed { .. } => "partially_unsealed",
            PodOutcome::Unreachable(_) => "unreachable",
            PodOutcome::Failed(_) => "failed",
            PodOutcome::Skipped => "skipped",
        }
    }

    pub fn is_unsealed(&self) -> bool {
        matches!(self, PodOutcome::AlreadyUnsealed | PodOutcome::Unsealed { .. })
    }

    /// Whether this outcome shortens the requeue interval
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            PodOutcome::PartiallyUnsealed { .. } | PodOutcome::Unreachable(_) | PodOutcome::Failed(_)
        )
    }

    pub fn shares_applied(&self) -> u32 {
        match self {
            PodOutcome::Unsealed { shares_applied } | PodOutcome::PartiallyUnsealed { shares_applied } => {
                *shares_applied
            }
            _ => 0,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            PodOutcome::Unreachable(reason) | PodOutcome::Failed(reason) => Some(reason.clone()),
            PodOutcome::PartiallyUnsealed { shares_applied } => Some(format!(
                "still sealed after {} accepted share(s)",
                shares_applied
            )),
            PodOutcome::Skipped => Some("HA disabled, not the primary pod".to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for PodOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "{} ({})", self.label(), message),
            None => f.write_str(self.label()),
        }
    }
}

/// Outcome of one pod plus what it took to get there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveResult {
    pub outcome: PodOutcome,
    /// Unseal calls made, accepted or not
    pub submissions: u32,
    /// Error kinds seen along the way, for metrics
    pub error_kinds: Vec<&'static str>,
}

impl DriveResult {
    fn new(outcome: PodOutcome, submissions: u32, error_kinds: Vec<&'static str>) -> Self {
        Self {
            outcome,
            submissions,
            error_kinds,
        }
    }

    /// A driver stopped by the cycle deadline after `submissions` unseal calls
    pub fn deadline_exceeded(submissions: u32) -> Self {
        Self::new(
            PodOutcome::Failed("cycle deadline exceeded".to_string()),
            submissions,
            vec!["timeout"],
        )
    }
}

/// Drive one pod to a terminal outcome.
///
/// `submitted` is bumped before every unseal call, so a caller that cancels
/// this future still knows how many calls went out.
pub async fn drive_pod(
    client: &dyn VaultClientTrait,
    target: &PodTarget,
    shares: &[KeyShare],
    submitted: &AtomicU32,
) -> DriveResult {
    let Some(address) = target.address.as_deref() else {
        debug!("Pod {} has no address yet", target.name);
        return DriveResult::new(
            PodOutcome::Unreachable("pod has no IP address".to_string()),
            0,
            vec!["connection"],
        );
    };

    let status = match client.seal_status(address).await {
        Ok(status) => status,
        Err(e) if is_unreachable(&e) => {
            warn!("Vault pod {} is unreachable: {}", target.name, e);
            return DriveResult::new(PodOutcome::Unreachable(e.to_string()), 0, vec![e.kind()]);
        }
        Err(e) => {
            warn!("Seal status of pod {} failed: {}", target.name, e);
            return DriveResult::new(PodOutcome::Failed(e.to_string()), 0, vec![e.kind()]);
        }
    };

    if !status.sealed {
        debug!("Pod {} is already unsealed", target.name);
        return DriveResult::new(PodOutcome::AlreadyUnsealed, 0, Vec::new());
    }

    debug!(
        "Pod {} is sealed (progress {}/{}), submitting up to {} share(s)",
        target.name,
        status.progress,
        status.threshold,
        shares.len()
    );

    let mut shares_applied = 0u32;
    let mut error_kinds = Vec::new();

    for share in shares {
        let submissions = submitted.fetch_add(1, Ordering::Relaxed) + 1;
        match client.submit_key_share(address, share.expose()).await {
            Ok(status) => {
                shares_applied += 1;
                if !status.sealed {
                    info!(
                        "Unsealed pod {} with {} share(s)",
                        target.name, shares_applied
                    );
                    return DriveResult::new(
                        PodOutcome::Unsealed { shares_applied },
                        submissions,
                        error_kinds,
                    );
                }
                debug!(
                    "Pod {} progress {}/{}",
                    target.name, status.progress, status.threshold
                );
            }
            Err(VaultError::RejectedShare(reason)) => {
                warn!(
                    "Pod {} rejected a share from {}: {}",
                    target.name,
                    share.source(),
                    reason
                );
                error_kinds.push("rejected_share");
            }
            Err(e) => {
                warn!("Unsealing pod {} failed mid-sequence: {}", target.name, e);
                error_kinds.push(e.kind());
                return DriveResult::new(PodOutcome::Failed(e.to_string()), submissions, error_kinds);
            }
        }
    }

    warn!(
        "Pod {} still sealed after {} accepted share(s)",
        target.name, shares_applied
    );
    DriveResult::new(
        PodOutcome::PartiallyUnsealed { shares_applied },
        submitted.load(Ordering::Relaxed),
        error_kinds,
    )
}

fn is_unreachable(error: &VaultError) -> bool {
    matches!(
        error,
        VaultError::Connection(_) | VaultError::Tls(_) | VaultError::Http(_)
    )
}
