//! Replicator plugin contract

use std::collections::HashMap;

use super::scaler::ScalerOutput;
use crate::error::Error;

/// Inputs for aggregating scaler outputs into one decision
pub struct ReplicatorContext<'a> {
    /// Per-policy key, `name/namespace`
    pub key: &'a str,

    /// Replicas currently requested on the workload's scale spec
    pub current_replicas: i32,

    /// Opaque replicator settings from the autoscaler spec
    pub settings: Option<&'a serde_json::Value>,

    /// Scaler outputs keyed by target metric name
    pub scalers_output: &'a HashMap<String, ScalerOutput>,
}

/// A replicator aggregates scaler outputs and applies its tuners
pub trait Replicator: Send + Sync {
    /// The aggregated, tuned desired replica count
    fn desired_replicas(&self, ctx: ReplicatorContext<'_>) -> Result<i32, Error>;

    /// Record the decision the controller actually committed so tuner
    /// memories track reality rather than raw recommendations
    fn accept(&self, _key: &str, _current_replicas: i32, _committed_replicas: i32) {}

    /// Drop per-policy state; invoked from the finalizer path
    fn forget(&self, _key: &str) {}
}
