//! ReplicaAutoscaler Custom Resource Definition
//!
//! A ReplicaAutoscaler binds one scalable workload to a set of metric
//! targets. Scalers turn each target into a replica recommendation, a
//! replicator aggregates them, and the controller commits the stabilized
//! result to the workload's `scale` sub-resource.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{get_condition, set_condition, Condition, ConditionStatus, ConditionType};
use super::types::{CrossVersionObjectReference, IntOrPercent, TargetStatus};
use crate::error::Error;
use crate::{DRY_RUN_ANNOTATION, REPLICA_PATCHES_ANNOTATION};

/// Replicator used when the spec does not name one
pub const DEFAULT_REPLICATOR: &str = "simple";

/// Specification for a ReplicaAutoscaler
///
/// When `minReplicas` is absent the policy is *static*: the target is
/// pinned to `maxReplicas` and no scaler or tuner is consulted.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "updraft.dev",
    version = "v1alpha1",
    kind = "ReplicaAutoscaler",
    plural = "replicaautoscalers",
    shortname = "ra",
    status = "ReplicaAutoscalerStatus",
    namespaced,
    printcolumn = r#"{"name":"Reference","type":"string","jsonPath":".spec.scaleTargetRef.name"}"#,
    printcolumn = r#"{"name":"Min","type":"string","jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"Max","type":"string","jsonPath":".spec.maxReplicas"}"#,
    printcolumn = r#"{"name":"Replicas","type":"string","jsonPath":".status.currentReplicas"}"#,
    printcolumn = r#"{"name":"LastScaleTime","type":"string","jsonPath":".status.lastScaleTime"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"PanicMode","type":"string","jsonPath":".status.conditions[?(@.type==\"PanicMode\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaAutoscalerSpec {
    /// Points to the resource to scale and to the pods metrics are
    /// collected for
    pub scale_target_ref: CrossVersionObjectReference,

    /// Lower bound for autoscaling; absent pins the target to `maxReplicas`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound for autoscaling; must not be less than `minReplicas`
    pub max_replicas: i32,

    /// Replicator aggregating scaler outputs into the final decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicator: Option<String>,

    /// Opaque configuration consumed by the selected replicator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicator_settings: Option<serde_json::Value>,

    /// Metric targets feeding the scaling decision, evaluated in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<ReplicaAutoscalerTarget>,

    /// Scaling strategy knobs (panic mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Exhaustion detection settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhaust: Option<Exhaust>,
}

impl ReplicaAutoscalerSpec {
    /// Validate the autoscaler specification
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(min) = self.min_replicas {
            if min < 0 {
                return Err(Error::validation("minReplicas must be non-negative"));
            }
            if self.max_replicas < min {
                return Err(Error::validation(format!(
                    "maxReplicas ({}) must not be less than minReplicas ({})",
                    self.max_replicas, min
                )));
            }
        }
        for target in &self.targets {
            if target.metric.is_empty() {
                return Err(Error::validation("target metric name must not be empty"));
            }
        }
        if let Some(exhaust) = &self.exhaust {
            if exhaust.type_ == ExhaustType::Pending && exhaust.pending.is_none() {
                return Err(Error::validation(
                    "exhaust type Pending requires the pending settings block",
                ));
            }
        }
        Ok(())
    }

    /// The replicator name, falling back to the default
    pub fn replicator_name(&self) -> &str {
        self.replicator.as_deref().unwrap_or(DEFAULT_REPLICATOR)
    }
}

/// Strategy knobs deciding how scaling decisions are made
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// How long panic mode lasts after being entered, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic_window_seconds: Option<i32>,

    /// Growth ratio of desired over current replicas that triggers panic
    /// mode, e.g. 1.1 means desired reached 110% of current
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic_threshold: Option<f64>,
}

/// One metric target: which scaler to consult and with what settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaAutoscalerTarget {
    /// Scaler plugin presenting the utilization stat
    pub metric: String,

    /// Whether the metric is Utilization, Value, or AverageValue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<super::MetricTargetType>,

    /// Default settings plus scheduled overlays
    pub settings: TargetSettings,
}

/// Default settings payload plus time-windowed overlays
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TargetSettings {
    /// Settings used outside every schedule window; the scaler interprets
    /// the payload
    pub default: serde_json::Value,

    /// Ordered overlay windows; the first matching schedule wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<ScheduleTargetSettings>,
}

/// A schedule window carrying a settings fragment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ScheduleTargetSettings {
    /// IANA timezone the window is evaluated in
    pub timezone: String,
    /// Window start: 5-field cron or `YYYY-MM-DD HH:MM`
    pub start: String,
    /// Window end, same format as `start`
    pub end: String,
    /// Fragment merged over the default payload while the window is active
    pub settings: serde_json::Value,
}

/// Exhaustion detection settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exhaust {
    /// Exhaust mode, only `Pending` is currently supported
    #[serde(rename = "type")]
    pub type_: ExhaustType,

    /// Pending-pod exhaustion settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<ExhaustPending>,
}

/// Supported exhaustion modes
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExhaustType {
    Pending,
}

/// The workload is exhausted when at least `threshold` pods have been
/// pending for longer than the timeout
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExhaustPending {
    /// Pending pod count, absolute or a percentage of current replicas
    pub threshold: IntOrPercent,

    /// Minimum age of the oldest pending pod before flagging, in seconds
    pub timeout_seconds: i32,
}

/// Observed state of a ReplicaAutoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaAutoscalerStatus {
    /// Most recent generation observed by this autoscaler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the autoscaler changed the workload's replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,

    /// Replicas of the managed object as last seen by the autoscaler
    #[serde(default)]
    pub current_replicas: i32,

    /// Replicas last calculated by the autoscaler
    #[serde(default)]
    pub desired_replicas: i32,

    /// State of the targets used by this autoscaler
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetStatus>,

    /// Conditions required for this autoscaler to scale its target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ReplicaAutoscalerStatus {
    /// Upsert a condition, preserving `lastTransitionTime` semantics
    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        set_condition(
            &mut self.conditions,
            Condition::new(type_, status, reason, message),
        );
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        get_condition(&self.conditions, type_)
    }

    /// True when the condition exists with status True
    pub fn condition_is_true(&self, type_: ConditionType) -> bool {
        self.condition(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Replace the target record with the same name or append a new one
    pub fn set_target_status(&mut self, target_status: TargetStatus) {
        for existing in self.targets.iter_mut() {
            if existing.target == target_status.target {
                *existing = target_status;
                return;
            }
        }
        self.targets.push(target_status);
    }

    /// Look up a target record by its stable name
    pub fn target_status(&self, target: &str) -> Option<&TargetStatus> {
        self.targets.iter().find(|t| t.target == target)
    }
}

/// Time-windowed override of the autoscaler's replica bounds, carried in
/// the replica-patches annotation. Start and end are either both calendar
/// stamps or both cron expressions, never mixed within one record.
/// Static autoscalers ignore patches.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaPatch {
    /// IANA timezone the window is evaluated in
    pub timezone: String,

    /// Window start: cron expression or `YYYY-MM-DD HH:MM` stamp
    pub start: String,

    /// Window end, same format as `start`
    pub end: String,

    /// Calendar patches only: how long after `end` the record is kept
    /// before being purged from the annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_seconds: Option<i64>,

    /// Lower replica bound while the window is active
    pub min_replicas: i32,

    /// Upper replica bound while the window is active
    pub max_replicas: i32,
}

impl ReplicaAutoscaler {
    /// Process-wide key for per-policy state, `name/namespace`
    pub fn key(&self) -> String {
        format!("{}/{}", self.name_any(), self.namespace().unwrap_or_default())
    }

    /// True when scale commits are suppressed by the dry-run annotation
    pub fn dry_run(&self) -> bool {
        self.annotations()
            .get(DRY_RUN_ANNOTATION)
            .map(|value| value != "false")
            .unwrap_or(false)
    }

    /// Decode the replica patch list from the annotation, if present
    pub fn replica_patches(&self) -> Result<Option<Vec<ReplicaPatch>>, Error> {
        let Some(raw) = self.annotations().get(REPLICA_PATCHES_ANNOTATION) else {
            return Ok(None);
        };
        let patches: Vec<ReplicaPatch> = serde_json::from_str(raw).map_err(|err| {
            Error::serialization(format!("invalid replica-patches annotation: {err}"))
        })?;
        Ok(Some(patches))
    }

    /// Encode the replica patch list back into the annotation; an empty
    /// list removes the annotation
    pub fn set_replica_patches(&mut self, patches: &[ReplicaPatch]) -> Result<(), Error> {
        let annotations = self
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new);
        if patches.is_empty() {
            annotations.remove(REPLICA_PATCHES_ANNOTATION);
        } else {
            annotations.insert(
                REPLICA_PATCHES_ANNOTATION.to_string(),
                serde_json::to_string(patches)?,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MetricTarget;
    use kube::core::ObjectMeta;

    fn sample_autoscaler(name: &str) -> ReplicaAutoscaler {
        ReplicaAutoscaler {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ReplicaAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    kind: "Deployment".into(),
                    name: "api".into(),
                    api_version: None,
                },
                min_replicas: Some(1),
                max_replicas: 10,
                replicator: None,
                replicator_settings: None,
                targets: Vec::new(),
                strategy: None,
                exhaust: None,
            },
            status: None,
        }
    }

    mod spec_validation {
        use super::*;

        #[test]
        fn accepts_well_formed_specs() {
            assert!(sample_autoscaler("ok").spec.validate().is_ok());
        }

        #[test]
        fn rejects_inverted_bounds() {
            let mut autoscaler = sample_autoscaler("inverted");
            autoscaler.spec.min_replicas = Some(20);
            let err = autoscaler.spec.validate().unwrap_err();
            assert!(err.to_string().contains("must not be less than"));
        }

        #[test]
        fn rejects_negative_min() {
            let mut autoscaler = sample_autoscaler("negative");
            autoscaler.spec.min_replicas = Some(-1);
            assert!(autoscaler.spec.validate().is_err());
        }

        #[test]
        fn rejects_unnamed_target_metric() {
            let mut autoscaler = sample_autoscaler("unnamed");
            autoscaler.spec.targets.push(ReplicaAutoscalerTarget {
                metric: String::new(),
                metric_type: None,
                settings: TargetSettings {
                    default: serde_json::json!({}),
                    schedules: Vec::new(),
                },
            });
            assert!(autoscaler.spec.validate().is_err());
        }

        #[test]
        fn pending_exhaust_requires_settings() {
            let mut autoscaler = sample_autoscaler("exhaust");
            autoscaler.spec.exhaust = Some(Exhaust {
                type_: ExhaustType::Pending,
                pending: None,
            });
            assert!(autoscaler.spec.validate().is_err());
        }

        #[test]
        fn static_mode_has_no_min() {
            let mut autoscaler = sample_autoscaler("static");
            autoscaler.spec.min_replicas = None;
            assert!(autoscaler.spec.validate().is_ok());
        }

        #[test]
        fn replicator_defaults_to_simple() {
            let autoscaler = sample_autoscaler("default-replicator");
            assert_eq!(autoscaler.spec.replicator_name(), "simple");

            let mut named = sample_autoscaler("named-replicator");
            named.spec.replicator = Some("weighted".into());
            assert_eq!(named.spec.replicator_name(), "weighted");
        }
    }

    mod annotations {
        use super::*;
        use std::collections::BTreeMap;

        #[test]
        fn dry_run_defaults_to_live_commits() {
            assert!(!sample_autoscaler("live").dry_run());
        }

        #[test]
        fn dry_run_annotation_values() {
            let mut autoscaler = sample_autoscaler("annotated");
            let mut annotations = BTreeMap::new();
            annotations.insert(DRY_RUN_ANNOTATION.to_string(), "true".to_string());
            autoscaler.metadata.annotations = Some(annotations.clone());
            assert!(autoscaler.dry_run());

            annotations.insert(DRY_RUN_ANNOTATION.to_string(), "anything".to_string());
            autoscaler.metadata.annotations = Some(annotations.clone());
            assert!(autoscaler.dry_run());

            annotations.insert(DRY_RUN_ANNOTATION.to_string(), "false".to_string());
            autoscaler.metadata.annotations = Some(annotations);
            assert!(!autoscaler.dry_run());
        }

        #[test]
        fn replica_patches_round_trip() {
            let mut autoscaler = sample_autoscaler("patched");
            assert!(autoscaler.replica_patches().unwrap().is_none());

            let patches = vec![ReplicaPatch {
                timezone: "UTC".into(),
                start: "2024-01-01 00:00".into(),
                end: "2024-01-02 00:00".into(),
                retention_seconds: Some(3600),
                min_replicas: 5,
                max_replicas: 5,
            }];
            autoscaler.set_replica_patches(&patches).unwrap();
            assert_eq!(autoscaler.replica_patches().unwrap().unwrap(), patches);

            autoscaler.set_replica_patches(&[]).unwrap();
            assert!(autoscaler.replica_patches().unwrap().is_none());
        }

        #[test]
        fn garbage_patch_annotation_is_an_error() {
            let mut autoscaler = sample_autoscaler("garbage");
            let mut annotations = BTreeMap::new();
            annotations.insert(
                REPLICA_PATCHES_ANNOTATION.to_string(),
                "not json".to_string(),
            );
            autoscaler.metadata.annotations = Some(annotations);
            assert!(autoscaler.replica_patches().is_err());
        }
    }

    mod status_helpers {
        use super::*;

        #[test]
        fn key_is_name_slash_namespace() {
            assert_eq!(sample_autoscaler("api-scaler").key(), "api-scaler/default");
        }

        #[test]
        fn target_status_replaces_by_name() {
            let mut status = ReplicaAutoscalerStatus::default();
            status.set_target_status(TargetStatus {
                target: "cpu".into(),
                scaler: "cpu".into(),
                desired_replicas: 3,
                metric: MetricTarget::default(),
            });
            status.set_target_status(TargetStatus {
                target: "cpu".into(),
                scaler: "cpu".into(),
                desired_replicas: 5,
                metric: MetricTarget::default(),
            });
            status.set_target_status(TargetStatus {
                target: "prometheus/abc".into(),
                scaler: "prometheus".into(),
                desired_replicas: 2,
                metric: MetricTarget::default(),
            });

            assert_eq!(status.targets.len(), 2);
            assert_eq!(status.target_status("cpu").unwrap().desired_replicas, 5);
        }

        #[test]
        fn condition_is_true_reads_current_state() {
            let mut status = ReplicaAutoscalerStatus::default();
            assert!(!status.condition_is_true(ConditionType::PanicMode));
            status.set_condition(
                ConditionType::PanicMode,
                ConditionStatus::True,
                "BurstDetected",
                "",
            );
            assert!(status.condition_is_true(ConditionType::PanicMode));
        }
    }

    #[test]
    fn spec_serializes_camel_case() {
        let autoscaler = sample_autoscaler("serde");
        let json = serde_json::to_value(&autoscaler.spec).unwrap();
        assert_eq!(json["scaleTargetRef"]["kind"], "Deployment");
        assert_eq!(json["minReplicas"], 1);
        assert_eq!(json["maxReplicas"], 10);
        assert!(json.get("targets").is_none());
    }
}
