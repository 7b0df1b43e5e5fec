//! ReplicaAutoscaler reconciliation
//!
//! One pass over one policy: resolve the target workload, gather scaler
//! outputs under the scheduled settings, aggregate and tune them, apply
//! replica patches and bounds, commit the result to the scale
//! sub-resource, refresh status and conditions, and pick the next
//! requeue delay. All object writes happen once at the end, and only for
//! fields that actually changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::context::{
    group_resource_known_scalable, set_group_resource_scalable, Context, EventSink, PolicyClient,
    Requeue, ScaleBridge, TargetResolver,
};
use super::{actions, reasons};
use crate::crd::{
    ConditionStatus, ConditionType, GroupVersionKindResource, ReplicaAutoscaler,
    ReplicaAutoscalerSpec, ReplicaAutoscalerStatus, ReplicaPatch,
};
use crate::engine::{Replicator, ReplicatorContext, Scaler, ScalerContext, ScalerOutput};
use crate::error::Error;
use crate::exhaustion;
use crate::panic_mode;
use crate::pods::{PodLister, Selector};
use crate::scheduling::{active_replica_patch, purge_expired_patches, scheduled_settings};

fn scale_spec_replicas(scale: &Scale) -> i32 {
    scale
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0)
}

fn scale_status_replicas(scale: &Scale) -> i32 {
    scale.status.as_ref().map(|status| status.replicas).unwrap_or(0)
}

fn object_reference(autoscaler: &ReplicaAutoscaler) -> ObjectReference {
    ObjectReference {
        api_version: Some("updraft.dev/v1alpha1".to_string()),
        kind: Some("ReplicaAutoscaler".to_string()),
        name: autoscaler.metadata.name.clone(),
        namespace: autoscaler.metadata.namespace.clone(),
        uid: autoscaler.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Entry point wired into the kube controller
#[instrument(skip_all, fields(
    namespace = %autoscaler.namespace().unwrap_or_default(),
    autoscaler = %autoscaler.name_any(),
))]
pub async fn reconcile(
    autoscaler: Arc<ReplicaAutoscaler>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    debug!("reconciling");
    let mut working = (*autoscaler).clone();

    let requeue = match reconcile_policy(&mut working, &ctx).await {
        Ok(requeue) => requeue,
        Err(err) => {
            warn!(error = %err, "reconciliation pass failed");
            Requeue::ErrorState
        }
    };

    // Whatever the pass managed to compute is committed, even on errors:
    // conditions written before a failure must reach the API server.
    commit_object_changes(&autoscaler, &working, &ctx).await?;

    Ok(requeue.into_action(&ctx.settings))
}

/// Error policy for the controller: commit failures and other errors
/// escaping `reconcile` retry at the error-state cadence
pub fn error_policy(
    autoscaler: Arc<ReplicaAutoscaler>,
    err: &Error,
    ctx: Arc<Context>,
) -> Action {
    error!(
        error = %err,
        autoscaler = %autoscaler.name_any(),
        "reconciliation failed"
    );
    Requeue::ErrorState.into_action(&ctx.settings)
}

async fn reconcile_policy(
    working: &mut ReplicaAutoscaler,
    ctx: &Context,
) -> Result<Requeue, Error> {
    if working.metadata.deletion_timestamp.is_some() {
        return finalize(working, ctx);
    }

    let spec = working.spec.clone();
    let namespace = working.namespace().unwrap_or_default();
    let key = working.key();
    let dry_run = working.dry_run();
    let generation = working.metadata.generation;
    let object_ref = object_reference(working);
    let now = Utc::now();

    let patches = match working.replica_patches() {
        Ok(patches) => patches,
        Err(err) => {
            warn!(error = %err, "ignoring unreadable replica patches");
            None
        }
    };

    let requeue = {
        let status = working.status.get_or_insert_with(Default::default);

        if let Err(err) = spec.validate() {
            warn!(error = %err, "invalid autoscaler spec");
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                "InvalidSpecification",
                err.to_string(),
            );
            return Ok(Requeue::Never);
        }

        let target_ref = &spec.scale_target_ref;
        if target_ref.name.is_empty() || target_ref.kind.is_empty() {
            info!("scaleTargetRef.name or scaleTargetRef.kind missing");
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                "FailedToGetScaleTarget",
                "scaleTargetRef must carry both kind and name",
            );
            return Ok(Requeue::Never);
        }

        let gvkr = ctx
            .resolver
            .resolve(
                target_ref.api_version.as_deref().unwrap_or_default(),
                &target_ref.kind,
            )
            .await?;

        let scale = match fetch_scale(ctx, &gvkr, &namespace, &target_ref.name).await {
            Ok(scale) => scale,
            Err(err) if err.is_target_unusable() => {
                warn!(target = %gvkr.gvk_string(), error = %err, "target unusable");
                status.set_condition(
                    ConditionType::Ready,
                    ConditionStatus::False,
                    "FailedToGetScaleTarget",
                    err.to_string(),
                );
                return Ok(Requeue::Never);
            }
            Err(err) => return Err(err),
        };

        if let Some(exhaust) = &spec.exhaust {
            if let Some(pending) = &exhaust.pending {
                let selector_raw = scale
                    .status
                    .as_ref()
                    .and_then(|s| s.selector.clone())
                    .unwrap_or_default();
                let selector = Selector::parse(&selector_raw)?;
                let pods = ctx.engine.pod_lister.list(&namespace, &selector)?;
                let verdict =
                    exhaustion::evaluate_pending(pending, &pods, scale_status_replicas(&scale))?;
                if verdict.exhausted {
                    status.set_condition(
                        ConditionType::Exhausted,
                        ConditionStatus::True,
                        "PendingOverThreshold",
                        format!(
                            "{} pods pending, oldest for {}s",
                            verdict.pending_count,
                            verdict.oldest_pending_seconds.unwrap_or(0)
                        ),
                    );
                } else {
                    status.set_condition(
                        ConditionType::Exhausted,
                        ConditionStatus::False,
                        "WithinThreshold",
                        format!("{} pods pending", verdict.pending_count),
                    );
                }
            }
        }

        status.observed_generation = generation;
        status.current_replicas = scale_status_replicas(&scale);

        if spec.min_replicas.is_none() {
            // Static mode: pin the target to maxReplicas, no scalers
            debug!("setting static replicas");
            apply_replicas(
                ctx,
                &gvkr,
                &namespace,
                &spec.scale_target_ref.name,
                &object_ref,
                &scale,
                spec.max_replicas,
                dry_run,
                status,
            )
            .await?;
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::True,
                "StaticReplicas",
                "replicas pinned to maxReplicas",
            );
            Requeue::Default
        } else {
            let (requeue, completed) = autoscale(
                ctx,
                &key,
                &namespace,
                &object_ref,
                &spec,
                patches.as_deref(),
                dry_run,
                &gvkr,
                &scale,
                status,
                now,
            )
            .await?;
            if completed {
                status.set_condition(
                    ConditionType::Ready,
                    ConditionStatus::True,
                    "AutoscalerReady",
                    "",
                );
            }
            requeue
        }
    };

    purge_replica_patches(working, now);
    Ok(requeue)
}

/// Recovery hook for terminating policies: per-policy tuner memories are
/// dropped so long-lived processes do not accumulate state for deleted
/// objects
fn finalize(working: &ReplicaAutoscaler, ctx: &Context) -> Result<Requeue, Error> {
    debug!("finalizing terminating autoscaler");
    ctx.engine.forget(&working.key());
    Ok(Requeue::Default)
}

/// Fetch the scale sub-resource, probing object existence on failure to
/// distinguish a deleted target from an unscalable one. Scalability is
/// cached per group-resource.
async fn fetch_scale(
    ctx: &Context,
    gvkr: &GroupVersionKindResource,
    namespace: &str,
    name: &str,
) -> Result<Scale, Error> {
    match ctx.scale.get_scale(gvkr, namespace, name).await {
        Ok(scale) => {
            let group_resource = gvkr.group_resource();
            if group_resource_known_scalable(&group_resource) != Some(true) {
                set_group_resource_scalable(&group_resource, true);
            }
            Ok(scale)
        }
        Err(err) => match ctx.scale.target_exists(gvkr, namespace, name).await {
            Ok(false) => Err(Error::TargetMissing(format!(
                "{} {namespace}/{name}",
                gvkr.gvk_string()
            ))),
            Ok(true) => {
                set_group_resource_scalable(&gvkr.group_resource(), false);
                Err(Error::TargetNotScalable(format!(
                    "{} {namespace}/{name}",
                    gvkr.gvk_string()
                )))
            }
            Err(_) => Err(err),
        },
    }
}

/// The autoscaling pass. Returns the requeue decision plus whether the
/// pass completed (a halted pass has already written its own failing
/// Ready condition).
#[allow(clippy::too_many_arguments)]
async fn autoscale(
    ctx: &Context,
    key: &str,
    namespace: &str,
    object_ref: &ObjectReference,
    spec: &ReplicaAutoscalerSpec,
    patches: Option<&[ReplicaPatch]>,
    dry_run: bool,
    gvkr: &GroupVersionKindResource,
    scale: &Scale,
    status: &mut ReplicaAutoscalerStatus,
    now: DateTime<Utc>,
) -> Result<(Requeue, bool), Error> {
    let selector_raw = scale
        .status
        .as_ref()
        .and_then(|s| s.selector.clone())
        .unwrap_or_default();
    let selector = Selector::parse(&selector_raw)?;
    let strategy = spec.strategy.as_ref();

    // Cooldown gates normal scaling; panic mode intentionally bypasses it
    if let Some(last_scale) = status.last_scale_time {
        if now - last_scale
            < chrono::Duration::from_std(ctx.settings.scaling_cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(30))
            && !panic_mode::still_in(status, strategy)
        {
            debug!("still in scaling cooldown period");
            return Ok((Requeue::Default, true));
        }
    }

    let current_replicas = scale_spec_replicas(scale);

    let mut outputs: HashMap<String, ScalerOutput> = HashMap::new();
    let mut managed_targets: BTreeSet<String> = BTreeSet::new();
    for target in &spec.targets {
        let merged_settings = scheduled_settings(now, &target.settings);

        let Some(scaler) = ctx.engine.scaler(&target.metric) else {
            warn!(scaler = %target.metric, "scaler not exists for target");
            status.set_condition(
                ConditionType::Ready,
                ConditionStatus::False,
                "ScalerNotExists",
                format!("scaler `{}` not exists for target", target.metric),
            );
            return Ok((Requeue::Default, false));
        };

        let output = scaler
            .get(ScalerContext {
                current_replicas,
                raw_settings: merged_settings,
                namespace,
                selector: &selector,
                status: &mut *status,
                pod_lister: &*ctx.engine.pod_lister,
                metrics: &*ctx.engine.metrics,
            })
            .await?;
        managed_targets.extend(output.managed_target_status.iter().cloned());
        outputs.insert(target.metric.clone(), output);
    }

    // Target status records are exactly what this cycle's scalers claimed
    status
        .targets
        .retain(|target| managed_targets.contains(&target.target));

    let replicator_name = spec.replicator_name();
    let Some(replicator) = ctx.engine.replicator(replicator_name) else {
        warn!(replicator = %replicator_name, "replicator not exists");
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::False,
            "ReplicatorNotExists",
            format!("replicator `{replicator_name}` not exists"),
        );
        return Ok((Requeue::Never, false));
    };

    let mut desired = replicator.desired_replicas(ReplicatorContext {
        key,
        current_replicas,
        settings: spec.replicator_settings.as_ref(),
        scalers_output: &outputs,
    })?;

    // An active replica patch temporarily replaces the spec bounds
    let (mut min_replicas, mut max_replicas) =
        (spec.min_replicas.unwrap_or(0), spec.max_replicas);
    match patches.and_then(|patches| active_replica_patch(now, patches)) {
        Some(patch) => {
            min_replicas = patch.min_replicas;
            max_replicas = patch.max_replicas;
            status.set_condition(
                ConditionType::ReplicaPatched,
                ConditionStatus::True,
                format!("ReplicaPatchApplied[{min_replicas},{max_replicas}]"),
                format!("applied replica patch [{min_replicas},{max_replicas}]"),
            );
        }
        None => {
            status.set_condition(
                ConditionType::ReplicaPatched,
                ConditionStatus::False,
                "NoActivePatch",
                "",
            );
        }
    }

    if desired > max_replicas {
        desired = max_replicas;
        status.set_condition(
            ConditionType::ScaleLimited,
            ConditionStatus::True,
            "ReachMaxReplicas",
            format!("desired replicas clamped to maxReplicas {max_replicas}"),
        );
    } else if desired < min_replicas {
        desired = min_replicas;
        status.set_condition(
            ConditionType::ScaleLimited,
            ConditionStatus::True,
            "ReachMinimalReplicas",
            format!("desired replicas raised to minReplicas {min_replicas}"),
        );
    } else {
        status.set_condition(
            ConditionType::ScaleLimited,
            ConditionStatus::False,
            "WithinBounds",
            "",
        );
    }

    apply_replicas(
        ctx,
        gvkr,
        namespace,
        &spec.scale_target_ref.name,
        object_ref,
        scale,
        desired,
        dry_run,
        status,
    )
    .await?;
    replicator.accept(key, current_replicas, desired);

    // Panic is judged on the final desired value against the replicas
    // the cycle started from
    if panic_mode::should_enter(strategy, desired, current_replicas) {
        let was_panicking = status.condition_is_true(ConditionType::PanicMode);
        status.set_condition(
            ConditionType::PanicMode,
            ConditionStatus::True,
            "BurstDetected",
            format!("desired replicas {desired} outgrew current {current_replicas}"),
        );
        if !was_panicking {
            ctx.events
                .publish(
                    object_ref,
                    EventType::Warning,
                    reasons::PANIC_MODE,
                    actions::RECONCILE,
                    format!(
                        "entering panic mode: desired replicas {desired}, current {current_replicas}"
                    ),
                )
                .await;
        }
        return Ok((Requeue::PanicState, true));
    }
    if status.condition_is_true(ConditionType::PanicMode)
        && !panic_mode::still_in(status, strategy)
    {
        status.set_condition(
            ConditionType::PanicMode,
            ConditionStatus::False,
            "Stabilized",
            "",
        );
        ctx.events
            .publish(
                object_ref,
                EventType::Warning,
                reasons::PANIC_MODE,
                actions::RECONCILE,
                "leaving panic mode".to_string(),
            )
            .await;
    }

    Ok((Requeue::Default, true))
}

/// Commit a replica change to the scale sub-resource. Emits the scaling
/// event, honors dry-run, and moves `lastScaleTime` only when the
/// replica count actually changed.
#[allow(clippy::too_many_arguments)]
async fn apply_replicas(
    ctx: &Context,
    gvkr: &GroupVersionKindResource,
    namespace: &str,
    target_name: &str,
    object_ref: &ObjectReference,
    scale: &Scale,
    desired_replicas: i32,
    dry_run: bool,
    status: &mut ReplicaAutoscalerStatus,
) -> Result<bool, Error> {
    let current = scale_spec_replicas(scale);
    status.desired_replicas = desired_replicas;
    if current == desired_replicas {
        debug!("current replicas already as desired, nothing to do");
        return Ok(false);
    }

    let direction = if desired_replicas > current {
        "scale-up"
    } else {
        "scale-down"
    };
    info!(
        current,
        desired = desired_replicas,
        dry_run,
        "scaling replicas"
    );
    ctx.events
        .publish(
            object_ref,
            EventType::Normal,
            reasons::SCALING,
            actions::SCALE,
            format!("{direction} replicas {current} -> {desired_replicas}"),
        )
        .await;

    if !dry_run {
        ctx.scale
            .patch_replicas(gvkr, namespace, target_name, desired_replicas)
            .await?;
    }
    status.last_scale_time = Some(Utc::now());
    Ok(true)
}

/// Drop expired calendar patches from the annotation
fn purge_replica_patches(working: &mut ReplicaAutoscaler, now: DateTime<Utc>) {
    let patches = match working.replica_patches() {
        Ok(Some(patches)) => patches,
        Ok(None) => return,
        Err(err) => {
            warn!(error = %err, "unable to purge replica patches");
            return;
        }
    };
    let (kept, changed) = purge_expired_patches(patches, now);
    if changed {
        if let Err(err) = working.set_replica_patches(&kept) {
            warn!(error = %err, "unable to store purged replica patches");
        }
    }
}

/// Patch status and annotations when the pass changed them
async fn commit_object_changes(
    observed: &ReplicaAutoscaler,
    working: &ReplicaAutoscaler,
    ctx: &Context,
) -> Result<(), Error> {
    let namespace = working.namespace().unwrap_or_default();
    let name = working.name_any();

    if observed.status != working.status {
        if let Some(status) = &working.status {
            debug!("patching status");
            ctx.policy.patch_status(&namespace, &name, status).await?;
        }
    }

    let observed_annotations = observed.annotations();
    let working_annotations = working.annotations();
    if observed_annotations != working_annotations {
        debug!("patching annotations");
        let mut patch: BTreeMap<String, Option<String>> = working_annotations
            .iter()
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();
        for removed in observed_annotations.keys() {
            if !working_annotations.contains_key(removed) {
                patch.insert(removed.clone(), None);
            }
        }
        ctx.policy
            .patch_annotations(&namespace, &name, &patch)
            .await?;
    }
    Ok(())
}
