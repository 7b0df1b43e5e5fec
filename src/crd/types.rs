//! Shared API types: metric targets, target references and kind resolution

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How a metric value relates to its target threshold
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MetricTargetType {
    /// Average resource utilization across pods, as a percentage of requests
    #[default]
    Utilization,
    /// A raw metric value
    Value,
    /// The metric averaged across all relevant pods
    AverageValue,
}

/// The target value, average value or average utilization of a metric
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    /// Whether the metric is Utilization, Value, or AverageValue
    #[serde(rename = "type")]
    pub type_: MetricTargetType,

    /// Raw target value of the metric (quantity string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Target value averaged across all relevant pods (quantity string)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<String>,

    /// Average resource utilization across pods as a percentage of requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<i32>,
}

/// Running status of one scaling target, keyed by a stable name the
/// owning scaler chooses
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    /// Stable record name, chosen by the scaler
    pub target: String,

    /// Scaler that produced this record
    pub scaler: String,

    /// Replicas this target asked for in the last cycle
    pub desired_replicas: i32,

    /// Key metric values the scaler derived the decision from
    pub metric: MetricTarget,
}

/// Reference identifying the scalable workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    /// Kind of the referent
    pub kind: String,
    /// Name of the referent
    pub name: String,
    /// API version of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Resolved group/version/kind plus the plural resource name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupVersionKindResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resource: String,
}

impl GroupVersionKindResource {
    /// `group/version.Kind` for diagnostics
    pub fn gvk_string(&self) -> String {
        format!("{}/{}.{}", self.group, self.version, self.kind)
    }

    /// `apiVersion` form, `version` alone for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// `resource.group` cache key, `resource` alone for the core group
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

/// A plain integer or an integer percentage string such as `"50%"`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

impl IntOrPercent {
    /// Resolve against a total; percentages round up when `round_up`
    pub fn resolve(&self, total: i32, round_up: bool) -> Result<i32, Error> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::Percent(raw) => {
                let digits = raw.strip_suffix('%').ok_or_else(|| {
                    Error::validation(format!("invalid percentage value `{raw}`"))
                })?;
                let percent: i64 = digits.trim().parse().map_err(|_| {
                    Error::validation(format!("invalid percentage value `{raw}`"))
                })?;
                let scaled = percent * i64::from(total);
                let resolved = if round_up {
                    (scaled + 99) / 100
                } else {
                    scaled / 100
                };
                Ok(resolved as i32)
            }
        }
    }
}
