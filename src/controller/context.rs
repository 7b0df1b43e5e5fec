//! Boundary collaborators of the reconciler
//!
//! Every Kubernetes interaction goes through a trait so the reconciler
//! can run against mocks in tests: policy patches, scale sub-resource
//! access, target kind resolution and event recording.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::{GroupVersionKindResource, ReplicaAutoscaler, ReplicaAutoscalerStatus};
use crate::engine::Engine;
use crate::error::Error;
use crate::FIELD_MANAGER;

/// Tunable cadences of the controller
#[derive(Clone, Copy, Debug)]
pub struct ControllerSettings {
    /// Minimum gap between two replica changes outside panic mode
    pub scaling_cooldown: Duration,
    /// Requeue delay after an uneventful pass
    pub default_requeue: Duration,
    /// Requeue delay after a transient failure
    pub error_requeue: Duration,
    /// Requeue delay while panic mode is active
    pub panic_requeue: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            scaling_cooldown: Duration::from_secs(30),
            default_requeue: Duration::from_secs(60),
            error_requeue: Duration::from_secs(30),
            panic_requeue: Duration::from_secs(15),
        }
    }
}

/// Requeue decision of one reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for a spec change; the policy cannot make progress on its own
    Never,
    Default,
    PanicState,
    ErrorState,
}

impl Requeue {
    pub fn into_action(self, settings: &ControllerSettings) -> Action {
        match self {
            Self::Never => Action::await_change(),
            Self::Default => Action::requeue(settings.default_requeue),
            Self::PanicState => Action::requeue(settings.panic_requeue),
            Self::ErrorState => Action::requeue(settings.error_requeue),
        }
    }
}

/// Writes back to the ReplicaAutoscaler object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// Merge-patch the status sub-resource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ReplicaAutoscalerStatus,
    ) -> Result<(), Error>;

    /// Merge-patch annotations; `None` values delete their key
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error>;
}

/// Reads and writes the workload's scale sub-resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleBridge: Send + Sync {
    async fn get_scale(
        &self,
        gvkr: &GroupVersionKindResource,
        namespace: &str,
        name: &str,
    ) -> Result<Scale, Error>;

    /// Set `spec.replicas` on the scale sub-resource
    async fn patch_replicas(
        &self,
        gvkr: &GroupVersionKindResource,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error>;

    /// Does the referenced object exist at all?
    async fn target_exists(
        &self,
        gvkr: &GroupVersionKindResource,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error>;
}

/// Resolves a target reference to a group/version/kind/resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Resolve an `apiVersion`/`kind` pair; empty strings select the
    /// defaults (`apps/v1` `Deployment`)
    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<GroupVersionKindResource, Error>;
}

/// Publishes Kubernetes events. Fire-and-forget: a lost event must never
/// break reconciliation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    );
}

fn api_resource(gvkr: &GroupVersionKindResource) -> ApiResource {
    ApiResource {
        group: gvkr.group.clone(),
        version: gvkr.version.clone(),
        api_version: gvkr.api_version(),
        kind: gvkr.kind.clone(),
        plural: gvkr.resource.clone(),
    }
}

/// Production policy client
pub struct KubePolicyClient {
    client: Client,
}

impl KubePolicyClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PolicyClient for KubePolicyClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ReplicaAutoscalerStatus,
    ) -> Result<(), Error> {
        let api: Api<ReplicaAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error> {
        let api: Api<ReplicaAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Production scale bridge over dynamic APIs
pub struct KubeScaleBridge {
    client: Client,
}

impl KubeScaleBridge {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, gvkr: &GroupVersionKindResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(gvkr))
    }
}

#[async_trait]
impl ScaleBridge for KubeScaleBridge {
    async fn get_scale(
        &self,
        gvkr: &GroupVersionKindResource,
        namespace: &str,
        name: &str,
    ) -> Result<Scale, Error> {
        Ok(self.api(gvkr, namespace).get_scale(name).await?)
    }

    async fn patch_replicas(
        &self,
        gvkr: &GroupVersionKindResource,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.api(gvkr, namespace)
            .patch_scale(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn target_exists(
        &self,
        gvkr: &GroupVersionKindResource,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        match self.api(gvkr, namespace).get_metadata_opt(name).await {
            Ok(found) => Ok(found.is_some()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolver with fast paths for the common workload kinds and API
/// discovery for the rest
pub struct DiscoveryTargetResolver {
    client: Client,
}

impl DiscoveryTargetResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

const DEFAULT_GROUP: &str = "apps";
const DEFAULT_VERSION: &str = "v1";
const DEFAULT_KIND: &str = "Deployment";
const DEFAULT_RESOURCE: &str = "deployments";

/// Split `apiVersion` into group and version, defaulting to `apps/v1`
fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version {
        "" => (DEFAULT_GROUP.to_string(), DEFAULT_VERSION.to_string()),
        value => match value.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            // Core group, e.g. "v1"
            None => (String::new(), value.to_string()),
        },
    }
}

#[async_trait]
impl TargetResolver for DiscoveryTargetResolver {
    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<GroupVersionKindResource, Error> {
        let (group, version) = parse_api_version(api_version);
        let kind = if kind.is_empty() { DEFAULT_KIND } else { kind };

        // Fast paths for the kinds nearly every policy targets
        let resource = match kind {
            DEFAULT_KIND => Some(DEFAULT_RESOURCE.to_string()),
            "StatefulSet" => Some("statefulsets".to_string()),
            _ => None,
        };
        let resource = match resource {
            Some(resource) => resource,
            None => {
                let api_group = kube::discovery::group(&self.client, &group)
                    .await
                    .map_err(Error::Kube)?;
                api_group
                    .versioned_resources(&version)
                    .into_iter()
                    .find(|(ar, _)| ar.kind == kind)
                    .map(|(ar, _)| ar.plural)
                    .ok_or_else(|| {
                        Error::validation(format!(
                            "unable to resolve resource for {group}/{version} kind {kind}"
                        ))
                    })?
            }
        };

        Ok(GroupVersionKindResource {
            group,
            version,
            kind: kind.to_string(),
            resource,
        })
    }
}

/// Production event sink over the kube event recorder
pub struct RecorderEventSink {
    recorder: Recorder,
}

impl RecorderEventSink {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for RecorderEventSink {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, reference).await {
            warn!(reason, action, error = %err, "failed to publish event");
        }
    }
}

// Process-wide cache of group-resources known to expose a scale
// sub-resource, prefilled with the core workload kinds.
static SCALABLE_KINDS: Lazy<RwLock<HashMap<String, bool>>> = Lazy::new(|| {
    RwLock::new(HashMap::from([
        ("deployments.apps".to_string(), true),
        ("statefulsets.apps".to_string(), true),
    ]))
});

/// Look up whether a `resource.group` is known to be scalable
pub fn group_resource_known_scalable(group_resource: &str) -> Option<bool> {
    SCALABLE_KINDS.read().get(group_resource).copied()
}

/// Record whether a `resource.group` is scalable
pub fn set_group_resource_scalable(group_resource: &str, scalable: bool) {
    SCALABLE_KINDS
        .write()
        .insert(group_resource.to_string(), scalable);
}

/// Shared state for all reconcile invocations
pub struct Context {
    pub policy: Arc<dyn PolicyClient>,
    pub scale: Arc<dyn ScaleBridge>,
    pub resolver: Arc<dyn TargetResolver>,
    pub events: Arc<dyn EventSink>,
    pub engine: Arc<Engine>,
    pub settings: ControllerSettings,
}

impl Context {
    /// Production wiring over one kube client
    pub fn new(client: Client, engine: Arc<Engine>, controller_name: &str) -> Self {
        Self {
            policy: Arc::new(KubePolicyClient::new(client.clone())),
            scale: Arc::new(KubeScaleBridge::new(client.clone())),
            resolver: Arc::new(DiscoveryTargetResolver::new(client.clone())),
            events: Arc::new(RecorderEventSink::new(client, controller_name)),
            engine,
            settings: ControllerSettings::default(),
        }
    }

    /// Custom wiring, primarily for tests
    pub fn with_collaborators(
        policy: Arc<dyn PolicyClient>,
        scale: Arc<dyn ScaleBridge>,
        resolver: Arc<dyn TargetResolver>,
        events: Arc<dyn EventSink>,
        engine: Arc<Engine>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            policy,
            scale,
            resolver,
            events,
            engine,
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_maps_to_actions() {
        let settings = ControllerSettings::default();
        assert_eq!(
            Requeue::Default.into_action(&settings),
            Action::requeue(Duration::from_secs(60))
        );
        assert_eq!(
            Requeue::ErrorState.into_action(&settings),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            Requeue::PanicState.into_action(&settings),
            Action::requeue(Duration::from_secs(15))
        );
        assert_eq!(Requeue::Never.into_action(&settings), Action::await_change());
    }

    #[test]
    fn api_version_parsing_covers_core_and_named_groups() {
        assert_eq!(
            parse_api_version("apps/v1"),
            ("apps".to_string(), "v1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(
            parse_api_version(""),
            ("apps".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn scalable_cache_is_prefilled_and_writable() {
        assert_eq!(group_resource_known_scalable("deployments.apps"), Some(true));
        assert_eq!(group_resource_known_scalable("statefulsets.apps"), Some(true));
        assert_eq!(group_resource_known_scalable("widgets.example.com"), None);

        set_group_resource_scalable("widgets.example.com", true);
        assert_eq!(
            group_resource_known_scalable("widgets.example.com"),
            Some(true)
        );
    }
}
