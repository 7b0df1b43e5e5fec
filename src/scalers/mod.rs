//! Scaler plugins shipped with the operator

pub mod pod_resource;
pub mod prometheus;
pub mod rabbitmq;
