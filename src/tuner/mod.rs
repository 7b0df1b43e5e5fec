//! Tuners damp raw replica recommendations before they are committed
//!
//! A tuner is a pure-ish function over bounded replica history: given the
//! current and desired replica count for one policy key it returns a
//! stabilized recommendation, and is told afterwards which value was
//! actually committed.

mod flux;
mod memory;
mod stabilizer;

pub use flux::{
    FluxOptions, FluxPreference, FluxRule, FluxRuleSet, FluxTuner, RuleStrategy, RuleType,
};
pub use memory::{ReplicaMemory, ReplicaSnapshot};
pub use stabilizer::{Stabilizer, StabilizerPreference};

/// A replica recommendation tuner
pub trait Tuner: Send + Sync {
    /// Tuner name for logging
    fn name(&self) -> &'static str;

    /// Produce a stabilized recommendation for `key`. `preference` is an
    /// opaque per-policy document each tuner interprets on its own.
    fn recommend(
        &self,
        key: &str,
        current_replicas: i32,
        desired_replicas: i32,
        preference: Option<&serde_json::Value>,
    ) -> i32;

    /// Record the decision that was actually committed
    fn accept(&self, key: &str, current_replicas: i32, committed_replicas: i32);

    /// Drop all memory held for `key`
    fn forget(&self, key: &str);
}
