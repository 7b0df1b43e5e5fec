//! ReplicaAutoscaler Custom Resource Definition and companion types

mod autoscaler;
mod condition;
mod types;

pub use autoscaler::{
    Exhaust, ExhaustPending, ExhaustType, ReplicaAutoscaler, ReplicaAutoscalerSpec,
    ReplicaAutoscalerStatus, ReplicaAutoscalerTarget, ReplicaPatch, ScheduleTargetSettings,
    Strategy, TargetSettings, DEFAULT_REPLICATOR,
};
pub use condition::{
    get_condition, set_condition, set_condition_at, Condition, ConditionStatus, ConditionType,
};
pub use types::{
    CrossVersionObjectReference, GroupVersionKindResource, IntOrPercent, MetricTarget,
    MetricTargetType, TargetStatus,
};
