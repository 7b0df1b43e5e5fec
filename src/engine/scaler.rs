//! Scaler plugin contract

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::crd::ReplicaAutoscalerStatus;
use crate::error::Error;
use crate::metrics::MetricsClient;
use crate::pods::PodLister;

/// What a scaler hands back for one target
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScalerOutput {
    /// Replicas this target asks for
    pub desired_replicas: i32,

    /// Stable status record names the scaler wrote this cycle; records
    /// not named by any scaler are purged from the status afterwards
    pub managed_target_status: Vec<String>,
}

/// Everything a scaler may consult while computing a recommendation
pub struct ScalerContext<'a> {
    /// Replicas currently requested on the workload's scale spec
    pub current_replicas: i32,

    /// Merged (default + scheduled overlay) settings payload
    pub raw_settings: serde_json::Value,

    /// Namespace of the autoscaler and its workload
    pub namespace: &'a str,

    /// Label selector of the scaled workload
    pub selector: &'a crate::pods::Selector,

    /// Autoscaler status, writable for target status records
    pub status: &'a mut ReplicaAutoscalerStatus,

    /// Shared pod cache
    pub pod_lister: &'a dyn PodLister,

    /// Shared resource metrics client
    pub metrics: &'a dyn MetricsClient,
}

impl ScalerContext<'_> {
    /// Decode the merged settings payload into the scaler's own type
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.raw_settings.clone()).map_err(|err| {
            Error::validation(format!(
                "invalid settings `{}`: {err}",
                self.raw_settings
            ))
        })
    }
}

/// A scaler turns one metric target into a desired replica count
#[async_trait]
pub trait Scaler: Send + Sync {
    async fn get(&self, ctx: ScalerContext<'_>) -> Result<ScalerOutput, Error>;
}
