//! Master election engine
//!
//! Each call evaluates the guards below in order and takes the first action
//! that applies; everything after it waits for the next pass.
//!
//! 1. no conditions: seed them and pick unit 0 as the desired master
//! 2. no desired master: pick unit 0
//! 3. desired pod missing while bringing up: wait
//! 4. desired pod missing: failover
//! 5. desired pod unhealthy: wait while bringing up, otherwise failover and delete it
//! 6. desired pod restarted: failover and delete it
//! 7. not elected: drive the promotion job
//! 8. desired pod not yet serving as master: relabel once promotion succeeded
//! 9. not ready: mark the cluster ready
//! 10. steady state
//!
//! The status subresource is the only state. Every write carries the resource
//! version read at the start of the pass, so a concurrent writer makes the
//! pass fail with a conflict instead of overwriting.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::conditions::{
    find_condition, initial_conditions, is_condition_true, remove_condition, set_condition_bool,
    CONDITION_TYPE_ELECTED, CONDITION_TYPE_INITIALIZED, CONDITION_TYPE_READY,
};
use super::events::{reasons, EventRecorder, EventType};
use super::health::{is_pod_restarted, PodHealth};
use super::promotion::{self, PromotionState};
use super::store::ObjectStore;
use super::Context;
use crate::config::RequeueDelays;
use crate::crd::{OpenldapCluster, LABEL_COMPONENT, LABEL_NAME, ROLE_MASTER, ROLE_SLAVE};
use crate::error::{Error, Result};

/// Elected reason while a failover is under way
const FAILOVER_REASON: &str = "Failover";

/// Outcome of one election pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionStep {
    DesiredMasterAssigned,
    AwaitingMasterPod,
    AwaitingPodHealth,
    FailoverStarted,
    PromotionStarted,
    PromotionPending,
    PromotionFailed,
    StalePromotionRemoved,
    MasterLabeled,
    ElectionRestarted,
    ClusterReady,
    Steady,
}

impl ElectionStep {
    pub fn requeue_after(self, delays: &RequeueDelays) -> Duration {
        match self {
            ElectionStep::DesiredMasterAssigned
            | ElectionStep::FailoverStarted
            | ElectionStep::StalePromotionRemoved
            | ElectionStep::ElectionRestarted => delays.short,
            ElectionStep::AwaitingMasterPod
            | ElectionStep::PromotionStarted
            | ElectionStep::PromotionPending
            | ElectionStep::PromotionFailed
            | ElectionStep::MasterLabeled
            | ElectionStep::ClusterReady => delays.medium,
            ElectionStep::AwaitingPodHealth => delays.wait,
            ElectionStep::Steady => delays.long,
        }
    }
}

fn has_master_label(pod: &Pod) -> bool {
    pod.labels().get(LABEL_COMPONENT).map(String::as_str) == Some(ROLE_MASTER)
}

pub struct ElectionEngine<'a, S, R> {
    ctx: Context<'a, S, R>,
    namespace: String,
}

impl<'a, S, R> ElectionEngine<'a, S, R>
where
    S: ObjectStore,
    R: EventRecorder,
{
    pub fn new(ctx: Context<'a, S, R>, cluster: &OpenldapCluster) -> Self {
        Self {
            ctx,
            namespace: cluster.namespace().unwrap_or_else(|| "default".to_string()),
        }
    }

    /// Run one pass of the state machine against a freshly read cluster
    #[instrument(skip(self, cluster), fields(name = %cluster.name_any(), namespace = %self.namespace))]
    pub async fn run(&self, mut cluster: OpenldapCluster) -> Result<ElectionStep> {
        // 1 + 2
        if cluster.conditions().is_empty() || cluster.desired_master().is_empty() {
            let first = cluster.pod_name(0);
            let status = cluster.status.get_or_insert_with(Default::default);
            if status.conditions.is_empty() {
                status.conditions = initial_conditions();
            }
            if status.desired_master.is_empty() {
                status.desired_master = first;
            }
            let desired = status.desired_master.clone();
            self.persist(&mut cluster).await?;
            info!("Desired master set to {}", desired);
            self.event(
                &cluster,
                EventType::Normal,
                reasons::DESIRED_MASTER_CREATED,
                &format!("Desired master set to {}", desired),
            )
            .await;
            return Ok(ElectionStep::DesiredMasterAssigned);
        }

        let desired = cluster.desired_master().to_string();
        let bringing_up = is_condition_true(cluster.conditions(), CONDITION_TYPE_INITIALIZED);

        // 3 + 4
        let Some(pod) = self.ctx.store.get::<Pod>(&self.namespace, &desired).await? else {
            if bringing_up {
                info!("Waiting for master pod {} to be created", desired);
                return Ok(ElectionStep::AwaitingMasterPod);
            }
            warn!("Master pod {} is gone", desired);
            self.failover(&mut cluster, &desired).await?;
            return Ok(ElectionStep::FailoverStarted);
        };

        // 5
        let health = PodHealth::classify(&pod);
        if !health.is_healthy() {
            if bringing_up {
                info!(?health, "Waiting for master pod {} to become ready", desired);
                return Ok(ElectionStep::AwaitingPodHealth);
            }
            warn!(?health, "Master pod {} is unhealthy", desired);
            self.failover(&mut cluster, &desired).await?;
            if cluster.spec.replicas > 1 {
                self.delete_pod(&desired).await?;
            }
            return Ok(ElectionStep::FailoverStarted);
        }

        // 6
        if is_pod_restarted(&pod) {
            warn!("Master pod {} has restarted, replacing it", desired);
            self.failover(&mut cluster, &desired).await?;
            self.delete_pod(&desired).await?;
            return Ok(ElectionStep::FailoverStarted);
        }

        // 7
        if !is_condition_true(cluster.conditions(), CONDITION_TYPE_ELECTED) {
            match promotion::inspect(self.ctx.store, &cluster, &pod).await? {
                PromotionState::Missing => {
                    promotion::create(self.ctx.store, &cluster, &pod, self.ctx.config).await?;
                    self.set_condition(
                        &mut cluster,
                        CONDITION_TYPE_ELECTED,
                        true,
                        "PromotionStarted",
                        &format!("Promoting {}", desired),
                    );
                    self.persist(&mut cluster).await?;
                    self.event(
                        &cluster,
                        EventType::Normal,
                        reasons::PROMOTION_STARTED,
                        &format!("Started promotion of {}", desired),
                    )
                    .await;
                    return Ok(ElectionStep::PromotionStarted);
                }
                PromotionState::Stale => {
                    promotion::delete(self.ctx.store, &cluster).await?;
                    return Ok(ElectionStep::StalePromotionRemoved);
                }
                PromotionState::Running => {
                    info!("Promotion of {} is still running", desired);
                    return Ok(ElectionStep::PromotionPending);
                }
                PromotionState::Failed => {
                    self.report_failed_promotion(&mut cluster, &desired).await?;
                    return Ok(ElectionStep::PromotionFailed);
                }
                PromotionState::Succeeded => {
                    // Job from this cycle finished before Elected was recorded
                    self.set_condition(
                        &mut cluster,
                        CONDITION_TYPE_ELECTED,
                        true,
                        "PromotionSucceeded",
                        &format!("Promoted {}", desired),
                    );
                    self.persist(&mut cluster).await?;
                }
            }
        }

        // 8
        if cluster.current_master() != desired || !has_master_label(&pod) {
            match promotion::inspect(self.ctx.store, &cluster, &pod).await? {
                PromotionState::Succeeded => {
                    self.label_master(&cluster, &desired).await?;
                    if let Some(status) = cluster.status.as_mut() {
                        status.current_master = desired.clone();
                    }
                    self.persist(&mut cluster).await?;
                    info!("Master is now {}", desired);
                    self.event(
                        &cluster,
                        EventType::Normal,
                        reasons::ELECTION_COMPLETED,
                        &format!("{} promoted to master", desired),
                    )
                    .await;
                    return Ok(ElectionStep::MasterLabeled);
                }
                PromotionState::Running => return Ok(ElectionStep::PromotionPending),
                PromotionState::Failed => {
                    self.report_failed_promotion(&mut cluster, &desired).await?;
                    return Ok(ElectionStep::PromotionFailed);
                }
                PromotionState::Missing | PromotionState::Stale => {
                    warn!(
                        "No valid promotion job for {}, restarting the election",
                        desired
                    );
                    let status = cluster.status.get_or_insert_with(Default::default);
                    status.current_master.clear();
                    self.set_condition(
                        &mut cluster,
                        CONDITION_TYPE_ELECTED,
                        false,
                        "PromotionMissing",
                        "Promotion job not found for the desired master",
                    );
                    self.set_condition(
                        &mut cluster,
                        CONDITION_TYPE_READY,
                        false,
                        "PromotionMissing",
                        "Waiting for a new promotion",
                    );
                    self.persist(&mut cluster).await?;
                    self.event(
                        &cluster,
                        EventType::Warning,
                        reasons::ELECTION_RESTARTED,
                        &format!("Promotion of {} could not be confirmed", desired),
                    )
                    .await;
                    return Ok(ElectionStep::ElectionRestarted);
                }
            }
        }

        // 9
        if !is_condition_true(cluster.conditions(), CONDITION_TYPE_READY) {
            if let Some(status) = cluster.status.as_mut() {
                remove_condition(&mut status.conditions, CONDITION_TYPE_INITIALIZED);
            }
            self.set_condition(
                &mut cluster,
                CONDITION_TYPE_READY,
                true,
                "ClusterReady",
                &format!("{} is serving writes", desired),
            );
            self.persist(&mut cluster).await?;
            info!("Cluster is ready with master {}", desired);
            self.event(
                &cluster,
                EventType::Normal,
                reasons::CLUSTER_READY,
                &format!("Cluster is ready with master {}", desired),
            )
            .await;
            return Ok(ElectionStep::ClusterReady);
        }

        Ok(ElectionStep::Steady)
    }

    /// Abandon the current master and choose the lowest-index healthy unit.
    ///
    /// With more than one replica the failing unit and any unit still
    /// labeled master are skipped.
    async fn failover(&self, cluster: &mut OpenldapCluster, failing: &str) -> Result<()> {
        let reason = format!("{} failed", failing);
        // A pass that found no candidate left Elected=False for this same unit
        let resumed = find_condition(cluster.conditions(), CONDITION_TYPE_ELECTED).is_some_and(|c| {
            !c.is_true() && c.reason == FAILOVER_REASON && c.message == reason
        });

        if resumed {
            info!("Retrying failover away from {}", failing);
        } else {
            self.event(
                cluster,
                EventType::Warning,
                reasons::MASTER_UNHEALTHY,
                &format!("Master {} is unhealthy, electing a new master", failing),
            )
            .await;

            let status = cluster.status.get_or_insert_with(Default::default);
            status.current_master.clear();
            status.failover_count += 1;
            self.set_condition(cluster, CONDITION_TYPE_ELECTED, false, FAILOVER_REASON, &reason);
            self.persist(cluster).await?;
        }

        let replicas = cluster.spec.replicas;
        let mut candidate = None;
        for index in 0..replicas {
            let name = cluster.pod_name(index);
            if replicas > 1 && name == failing {
                continue;
            }
            let Some(pod) = self.ctx.store.get::<Pod>(&self.namespace, &name).await? else {
                continue;
            };
            if replicas > 1 && has_master_label(&pod) {
                continue;
            }
            if PodHealth::classify(&pod).is_healthy() {
                candidate = Some(name);
                break;
            }
        }

        let Some(next) = candidate else {
            self.set_condition(
                cluster,
                CONDITION_TYPE_READY,
                false,
                "NoHealthyUnit",
                "No alive and ready unit is available for promotion",
            );
            self.persist(cluster).await?;
            self.event(
                cluster,
                EventType::Warning,
                reasons::CLUSTER_UNHEALTHY,
                "No healthy unit available to promote",
            )
            .await;
            return Err(Error::NoHealthyUnit {
                cluster: cluster.name_any(),
            });
        };

        if let Some(status) = cluster.status.as_mut() {
            status.desired_master = next.clone();
        }
        self.persist(cluster).await?;
        info!("Desired master moved from {} to {}", failing, next);
        self.event(
            cluster,
            EventType::Normal,
            reasons::DESIRED_MASTER_UPDATED,
            &format!("Desired master moved from {} to {}", failing, next),
        )
        .await;
        Ok(())
    }

    /// Demote every other master-labeled unit, then label the new master
    async fn label_master(&self, cluster: &OpenldapCluster, desired: &str) -> Result<()> {
        let selector = format!(
            "{}={},{}={}",
            LABEL_NAME,
            cluster.name_any(),
            LABEL_COMPONENT,
            ROLE_MASTER
        );
        let masters = self
            .ctx
            .store
            .list::<Pod>(&self.namespace, &selector)
            .await?;
        for stale in masters.iter().filter(|p| p.name_any() != desired) {
            info!("Demoting {} to {}", stale.name_any(), ROLE_SLAVE);
            let patch = serde_json::json!({
                "metadata": { "labels": cluster.slave_labels() }
            });
            self.ctx
                .store
                .merge_patch::<Pod>(&self.namespace, &stale.name_any(), &patch)
                .await?;
        }

        let patch = serde_json::json!({
            "metadata": { "labels": cluster.master_labels() }
        });
        self.ctx
            .store
            .merge_patch::<Pod>(&self.namespace, desired, &patch)
            .await?;
        Ok(())
    }

    /// Surface a failed job once; the job is kept for inspection
    async fn report_failed_promotion(
        &self,
        cluster: &mut OpenldapCluster,
        desired: &str,
    ) -> Result<()> {
        let already_reported = find_condition(cluster.conditions(), CONDITION_TYPE_READY)
            .map(|c| c.reason == "PromotionFailed")
            .unwrap_or(false);
        if already_reported {
            return Ok(());
        }
        warn!("Promotion job for {} failed", desired);
        self.set_condition(
            cluster,
            CONDITION_TYPE_READY,
            false,
            "PromotionFailed",
            &format!(
                "Promotion job {} failed, inspect it and delete it to retry",
                cluster.promotion_job_name()
            ),
        );
        self.persist(cluster).await?;
        self.event(
            cluster,
            EventType::Warning,
            reasons::PROMOTION_FAILED,
            &format!("Promotion of {} failed", desired),
        )
        .await;
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        info!("Deleting pod {}/{}", self.namespace, name);
        self.ctx
            .store
            .delete::<Pod>(&self.namespace, name)
            .await?;
        Ok(())
    }

    fn set_condition(
        &self,
        cluster: &mut OpenldapCluster,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
    ) {
        let conditions = &mut cluster.status.get_or_insert_with(Default::default).conditions;
        set_condition_bool(conditions, type_, status, reason, message);
    }

    /// Write status and carry the new resource version forward
    async fn persist(&self, cluster: &mut OpenldapCluster) -> Result<()> {
        *cluster = self
            .ctx
            .store
            .replace_status(&self.namespace, &*cluster)
            .await?;
        Ok(())
    }

    async fn event(&self, cluster: &OpenldapCluster, type_: EventType, reason: &str, message: &str) {
        self.ctx.recorder.publish(cluster, type_, reason, message).await;
    }
}
