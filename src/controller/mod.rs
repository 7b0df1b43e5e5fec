//! ReplicaAutoscaler controller: boundary collaborators and reconciler

mod context;
mod reconcile;

pub use context::{
    group_resource_known_scalable, set_group_resource_scalable, Context, ControllerSettings,
    DiscoveryTargetResolver, EventSink, KubePolicyClient, KubeScaleBridge, PolicyClient,
    RecorderEventSink, Requeue, ScaleBridge, TargetResolver,
};
pub use reconcile::{error_policy, reconcile};

#[cfg(test)]
pub use context::{MockEventSink, MockPolicyClient, MockScaleBridge, MockTargetResolver};

/// Well-known event reason strings
pub mod reasons {
    /// Replica count changed in either direction
    pub const SCALING: &str = "Scaling";
    /// Panic mode entered or left
    pub const PANIC_MODE: &str = "PanicMode";
}

/// Well-known event action strings
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Replica count mutation
    pub const SCALE: &str = "Scale";
}
