//! Promotion job synchronizer
//!
//! A promotion job execs the promotion script inside the elected pod. The job
//! is keyed by the desired master's name and annotated with that pod's UID.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::info;

use super::resources::{self, TARGET_UID_ANNOTATION};
use super::store::ObjectStore;
use crate::config::OperatorConfig;
use crate::crd::OpenldapCluster;
use crate::error::Result;

/// What the engine can learn from the promotion job of the desired master
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromotionState {
    /// No job exists for the desired master
    Missing,
    /// The job targets an earlier incarnation of the pod, or is being deleted
    Stale,
    Running,
    /// The job gave up; it is left in place for inspection
    Failed,
    /// Exactly the requested number of completions succeeded
    Succeeded,
}

/// `succeeded` equals the requested completions (1 when unset)
pub fn job_has_one_completion(job: &Job) -> bool {
    let completions = job
        .spec
        .as_ref()
        .and_then(|s| s.completions)
        .unwrap_or(1);
    let succeeded = job
        .status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or(0);
    succeeded == completions
}

pub fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Failed" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Classify a job against the pod it should be promoting
pub fn promotion_state(job: Option<&Job>, target: &Pod) -> PromotionState {
    let Some(job) = job else {
        return PromotionState::Missing;
    };
    let target_uid = target.metadata.uid.as_deref().unwrap_or("");
    let job_target = job
        .annotations()
        .get(TARGET_UID_ANNOTATION)
        .map(String::as_str)
        .unwrap_or("");

    if job.metadata.deletion_timestamp.is_some() || job_target != target_uid {
        PromotionState::Stale
    } else if job_has_one_completion(job) {
        PromotionState::Succeeded
    } else if job_failed(job) {
        PromotionState::Failed
    } else {
        PromotionState::Running
    }
}

/// Look up the promotion job for the cluster's desired master
pub async fn inspect<S: ObjectStore>(
    store: &S,
    cluster: &OpenldapCluster,
    target: &Pod,
) -> Result<PromotionState> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let job = store
        .get::<Job>(&namespace, &cluster.promotion_job_name())
        .await?;
    Ok(promotion_state(job.as_ref(), target))
}

pub async fn create<S: ObjectStore>(
    store: &S,
    cluster: &OpenldapCluster,
    target: &Pod,
    config: &OperatorConfig,
) -> Result<Job> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let job = resources::build_promotion_job(cluster, target, config);
    info!(
        "Creating promotion job {}/{} for {}",
        namespace,
        job.name_any(),
        target.name_any()
    );
    store.create(&namespace, &job).await
}

pub async fn delete<S: ObjectStore>(store: &S, cluster: &OpenldapCluster) -> Result<bool> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.promotion_job_name();
    info!("Deleting stale promotion job {}/{}", namespace, name);
    store.delete::<Job>(&namespace, &name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{pod, test_cluster, PodState};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn job_for(target: &Pod, succeeded: Option<i32>, failed: bool) -> Job {
        let mut cluster = test_cluster(3);
        cluster.status = Some(crate::crd::OpenldapClusterStatus {
            desired_master: target.name_any(),
            ..Default::default()
        });
        let mut job = resources::build_promotion_job(&cluster, target, &OperatorConfig::default());
        job.status = Some(JobStatus {
            succeeded,
            conditions: failed.then(|| {
                vec![JobCondition {
                    type_: "Failed".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        });
        job
    }

    fn target_pod() -> Pod {
        let mut p = pod(&test_cluster(3), 0, PodState::Ready);
        p.metadata.uid = Some("pod-uid-1".to_string());
        p
    }

    #[test]
    fn test_missing_job() {
        assert_eq!(promotion_state(None, &target_pod()), PromotionState::Missing);
    }

    #[test]
    fn test_running_job() {
        let target = target_pod();
        let job = job_for(&target, None, false);
        assert_eq!(promotion_state(Some(&job), &target), PromotionState::Running);
    }

    #[test]
    fn test_succeeded_job() {
        let target = target_pod();
        let job = job_for(&target, Some(1), false);
        assert!(job_has_one_completion(&job));
        assert_eq!(
            promotion_state(Some(&job), &target),
            PromotionState::Succeeded
        );
    }

    #[test]
    fn test_failed_job_is_not_success() {
        let target = target_pod();
        let job = job_for(&target, None, true);
        assert_eq!(promotion_state(Some(&job), &target), PromotionState::Failed);
    }

    #[test]
    fn test_job_for_previous_pod_incarnation_is_stale() {
        let target = target_pod();
        let job = job_for(&target, Some(1), false);

        let mut recreated = target.clone();
        recreated.metadata.uid = Some("pod-uid-2".to_string());
        assert_eq!(
            promotion_state(Some(&job), &recreated),
            PromotionState::Stale
        );
    }

    #[test]
    fn test_completions_default_to_one() {
        let target = target_pod();
        let mut job = job_for(&target, Some(1), false);
        job.spec.as_mut().unwrap().completions = None;
        assert!(job_has_one_completion(&job));
    }
}
