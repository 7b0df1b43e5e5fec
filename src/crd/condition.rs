//! Status conditions with last-transition-time semantics
//!
//! A condition's `lastTransitionTime` moves only when its status or reason
//! changes; refreshing the message alone leaves the timestamp untouched.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition categories reported on a ReplicaAutoscaler
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// The autoscaler resolved its target and completed its last pass
    Ready,
    /// An annotation-borne replica patch currently overrides the bounds
    ReplicaPatched,
    /// The desired value was clamped to the effective bounds
    ScaleLimited,
    /// Short-cadence reconciliation triggered by a growth burst
    PanicMode,
    /// Too many target pods have been pending for too long
    Exhausted,
}

/// Condition state, one of True, False, Unknown
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// One observed condition of the autoscaler
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition
    pub status: ConditionStatus,

    /// One-word CamelCase reason for the condition's last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message with transition details
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned from one status to another
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Build a condition; the transition time is stamped by [`set_condition`]
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Upsert `condition`, stamping `lastTransitionTime` at `now` only when
/// the status or reason actually changed
pub fn set_condition_at(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    for existing in conditions.iter_mut() {
        if existing.type_ == condition.type_ {
            if existing.status != condition.status || existing.reason != condition.reason {
                existing.last_transition_time = now;
            }
            existing.status = condition.status;
            existing.reason = condition.reason;
            existing.message = condition.message;
            return;
        }
    }
    condition.last_transition_time = now;
    conditions.push(condition);
}

/// Upsert `condition` using the wall clock
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    set_condition_at(conditions, condition, Utc::now());
}

/// Look up a condition by type
pub fn get_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
