//! Status conditions
//!
//! Conditions are keyed by type: a resource carries at most one condition of
//! each type and writing a condition replaces the previous one of that type.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Resource has been reconciled and every checked pod is unsealed
pub const CONDITION_READY: &str = "Ready";
/// Unseal key shares could not be loaded or are insufficient
pub const CONDITION_KEY_MATERIAL_ERROR: &str = "KeyMaterialError";
/// At least one Vault pod could not be reached
pub const CONDITION_VAULT_UNREACHABLE: &str = "VaultUnreachable";
/// At least one Vault pod is still sealed after all key shares were applied
pub const CONDITION_PARTIAL_UNSEAL: &str = "PartialUnseal";

/// Condition status as used by Kubernetes conventions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

/// Condition represents one observation of the resource state
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, KeyMaterialError, VaultUnreachable, PartialUnseal)
    pub r#type: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason in CamelCase
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status of this condition changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Insert or replace a condition by type.
///
/// When a condition of the same type already exists with the same status, its
/// `lastTransitionTime` is kept. The relative order of existing types is kept
/// and new types are appended.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}
