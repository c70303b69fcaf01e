//! Main reconciler for OpenldapCluster resources
//!
//! Implements the controller pattern using kube-rs runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::election::ElectionEngine;
use super::events::{reasons, EventRecorder, EventType, KubeEventRecorder};
use super::resources::ENABLE_TLS_KEY;
use super::store::{KubeStore, ObjectStore};
use super::sync::RECONCILE_ORDER;
use super::Context;
use crate::config::OperatorConfig;
use crate::crd::OpenldapCluster;
use crate::error::{Error, Result};

/// Consecutive failures per cluster, keyed by `namespace/name`
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    /// Count a failure and return how many preceded it
    pub fn record(&self, key: &str) -> u32 {
        match self.counts.lock() {
            Ok(mut counts) => {
                let count = counts.entry(key.to_string()).or_insert(0);
                let previous = *count;
                *count = count.saturating_add(1);
                previous
            }
            Err(_) => 0,
        }
    }

    pub fn reset(&self, key: &str) {
        if let Ok(mut counts) = self.counts.lock() {
            counts.remove(key);
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub store: KubeStore,
    pub recorder: KubeEventRecorder,
    pub config: Arc<OperatorConfig>,
    pub is_leader: Arc<AtomicBool>,
    pub failures: FailureTracker,
}

impl ControllerState {
    pub fn new(client: kube::Client, config: Arc<OperatorConfig>, is_leader: Arc<AtomicBool>) -> Self {
        Self {
            store: KubeStore::new(client.clone(), config.field_manager.clone()),
            recorder: KubeEventRecorder::new(client, &config.field_manager),
            config,
            is_leader,
            failures: FailureTracker::default(),
        }
    }

    fn context(&self) -> Context<'_, KubeStore, KubeEventRecorder> {
        Context {
            store: &self.store,
            recorder: &self.recorder,
            config: &self.config,
        }
    }
}

fn cluster_key(cluster: &OpenldapCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_else(|| "default".to_string()),
        cluster.name_any()
    )
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.store.client().clone();
    let clusters: Api<OpenldapCluster> = Api::all(client.clone());

    info!("Starting OpenldapCluster controller");

    // Verify CRD exists
    match clusters.list(&Default::default()).await {
        Ok(_) => info!("OpenldapCluster CRD is available"),
        Err(e) => {
            error!(
                "OpenldapCluster CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "OpenldapCluster CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(clusters, Config::default())
        // Watch owned resources for changes
        .owns::<StatefulSet>(Api::all(client.clone()), Config::default())
        .owns::<Service>(Api::all(client.clone()), Config::default())
        .owns::<ConfigMap>(Api::all(client.clone()), Config::default())
        .owns::<ServiceAccount>(Api::all(client.clone()), Config::default())
        .owns::<Role>(Api::all(client.clone()), Config::default())
        .owns::<RoleBinding>(Api::all(client.clone()), Config::default())
        .owns::<Job>(Api::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Reconciliation function called by the controller runtime
///
/// This function is called whenever:
/// - An OpenldapCluster is created or updated
/// - An owned resource (StatefulSet, Service, Job, ...) changes
/// - The requeue timer expires
#[instrument(skip(obj, state), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn reconcile(obj: Arc<OpenldapCluster>, state: Arc<ControllerState>) -> Result<Action> {
    if !state.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(state.config.requeue.long));
    }

    let action = reconcile_cluster(&state.context(), &obj).await?;
    state.failures.reset(&cluster_key(&obj));
    Ok(action)
}

/// One reconcile pass for a cluster, independent of the controller runtime.
///
/// The first synchronizer that writes ends the pass; the election engine only
/// runs once every child object has converged.
pub async fn reconcile_cluster<S, R>(
    ctx: &Context<'_, S, R>,
    obj: &OpenldapCluster,
) -> Result<Action>
where
    S: ObjectStore,
    R: EventRecorder,
{
    match converge(ctx, obj).await {
        Err(e) if !e.is_conflict() => {
            ctx.recorder
                .publish(obj, EventType::Warning, reasons::RECONCILE_FAILED, &e.to_string())
                .await;
            Err(e)
        }
        other => other,
    }
}

async fn converge<S, R>(ctx: &Context<'_, S, R>, obj: &OpenldapCluster) -> Result<Action>
where
    S: ObjectStore,
    R: EventRecorder,
{
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    // The watch cache may lag; the election needs the latest resource version
    let Some(mut cluster) = ctx
        .store
        .get::<OpenldapCluster>(&namespace, &name)
        .await?
    else {
        info!("OpenldapCluster {}/{} no longer exists", namespace, name);
        return Ok(Action::await_change());
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        // Children carry owner references and are garbage collected
        debug!("OpenldapCluster {}/{} is being deleted", namespace, name);
        return Ok(Action::await_change());
    }

    let mut spec = cluster.spec.clone();
    if spec.apply_defaults(&name) {
        warn!(
            "Admission controllers (webhooks) appear to have been disabled, applying defaults to {}/{}",
            namespace, name
        );
        let patch = serde_json::json!({ "spec": spec });
        cluster = ctx
            .store
            .merge_patch::<OpenldapCluster>(&namespace, &name, &patch)
            .await?;
        ctx.recorder
            .publish(
                &cluster,
                EventType::Normal,
                reasons::DEFAULTS_APPLIED,
                "Applied default values to the cluster spec",
            )
            .await;
    }

    // TLS mode is fixed once the ConfigMap exists; a change is reported, not rejected
    let built_with_tls = ctx
        .store
        .get::<ConfigMap>(&namespace, &cluster.config_map_name())
        .await?
        .and_then(|cm| cm.data)
        .and_then(|data| data.get(ENABLE_TLS_KEY).map(|v| v == "yes"));
    let validation = match built_with_tls {
        Some(tls_was_enabled) => cluster.spec.validate_update(tls_was_enabled),
        None => cluster.spec.validate(),
    };
    if let Err(errors) = validation {
        for e in &errors {
            warn!("Invalid spec for {}/{}: {}", namespace, name, e);
        }
    }

    for resource in RECONCILE_ORDER {
        if resource.ensure(ctx, &cluster).await? {
            debug!("{} changed, requeueing", resource.as_str());
            return Ok(Action::requeue(ctx.config.requeue.short));
        }
    }

    let step = ElectionEngine::new(*ctx, &cluster).run(cluster).await?;
    debug!(?step, "Election pass finished");
    Ok(Action::requeue(step.requeue_after(&ctx.config.requeue)))
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(5));
    base.saturating_mul(factor).min(max)
}

/// Error policy determines how to handle reconciliation errors
pub fn error_policy(cluster: Arc<OpenldapCluster>, error: &Error, state: Arc<ControllerState>) -> Action {
    let requeue = &state.config.requeue;

    if error.is_conflict() {
        debug!("Conflict while reconciling {}: {}", cluster.name_any(), error);
        return Action::requeue(requeue.short);
    }

    let attempt = state.failures.record(&cluster_key(&cluster));
    let retry_duration = if error.is_retriable() {
        calculate_backoff(attempt, requeue.short, state.config.max_backoff)
    } else {
        state.config.max_backoff
    };

    error!(
        "Reconciliation error for {} (attempt {}), retrying in {:?}: {:?}",
        cluster.name_any(),
        attempt + 1,
        retry_duration,
        error
    );
    Action::requeue(retry_duration)
}
