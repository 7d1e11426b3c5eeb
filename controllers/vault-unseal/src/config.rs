//! # Controller Configuration
//!
//! Process-level settings loaded from environment variables. Everything that
//! varies per Vault deployment lives on the `VaultUnseal` resource instead.

use std::time::Duration;

pub const DEFAULT_METRICS_PORT: u16 = 8080;
pub const DEFAULT_RECONCILE_CONCURRENCY: u16 = 4;
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DEGRADED_REQUEUE_SECS: u64 = 10;
pub const DEFAULT_STATUS_WRITE_RETRIES: u32 = 5;
pub const DEFAULT_MIN_CYCLE_SPACING_SECS: u64 = 5;
pub const DEFAULT_DEBOUNCE_SECS: u64 = 2;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches every namespace
    pub watch_namespace: Option<String>,
    /// HTTP port for metrics and health probes
    pub metrics_port: u16,
    /// Maximum number of VaultUnseal resources reconciled at once
    pub reconcile_concurrency: u16,
    /// Deadline for one whole cycle across every pod
    pub cycle_timeout: Duration,
    /// Requeue ceiling while some pod is sealed or unreachable
    pub degraded_requeue: Duration,
    /// Attempts for a status write that keeps hitting conflicts
    pub status_write_retries: u32,
    /// A resource whose status was written less than this long ago, for the
    /// current generation, is not cycled again
    pub min_cycle_spacing: Duration,
    /// Quiet period before a burst of watch events triggers a reconcile
    pub debounce: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            metrics_port: DEFAULT_METRICS_PORT,
            reconcile_concurrency: DEFAULT_RECONCILE_CONCURRENCY,
            cycle_timeout: Duration::from_secs(DEFAULT_CYCLE_TIMEOUT_SECS),
            degraded_requeue: Duration::from_secs(DEFAULT_DEGRADED_REQUEUE_SECS),
            status_write_retries: DEFAULT_STATUS_WRITE_RETRIES,
            min_cycle_spacing: Duration::from_secs(DEFAULT_MIN_CYCLE_SPACING_SECS),
            debounce: Duration::from_secs(DEFAULT_DEBOUNCE_SECS),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.trim().is_empty()),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            reconcile_concurrency: env_var_or_default(
                "RECONCILE_CONCURRENCY",
                DEFAULT_RECONCILE_CONCURRENCY,
            )
            .max(1),
            cycle_timeout: Duration::from_secs(env_var_or_default(
                "CYCLE_TIMEOUT_SECS",
                DEFAULT_CYCLE_TIMEOUT_SECS,
            )),
            degraded_requeue: Duration::from_secs(env_var_or_default(
                "DEGRADED_REQUEUE_SECS",
                DEFAULT_DEGRADED_REQUEUE_SECS,
            )),
            status_write_retries: env_var_or_default(
                "STATUS_WRITE_RETRIES",
                DEFAULT_STATUS_WRITE_RETRIES,
            )
            .max(1),
            min_cycle_spacing: Duration::from_secs(env_var_or_default(
                "MIN_CYCLE_SPACING_SECS",
                DEFAULT_MIN_CYCLE_SPACING_SECS,
            )),
            debounce: Duration::from_secs(env_var_or_default(
                "RECONCILE_DEBOUNCE_SECS",
                DEFAULT_DEBOUNCE_SECS,
            )),
        }
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
