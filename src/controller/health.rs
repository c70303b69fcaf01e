//! Health predicates for directory pods
//!
//! Pure functions over the observed `Pod` status. None of them touch the API.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

const PHASE_RUNNING: &str = "Running";
const PHASE_PENDING: &str = "Pending";
const PHASE_SUCCEEDED: &str = "Succeeded";
const PHASE_FAILED: &str = "Failed";

const REASON_CRASH_LOOP: &str = "CrashLoopBackOff";
const REASON_EVICTED: &str = "Evicted";
const REASON_UNSCHEDULABLE: &str = "Unschedulable";

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    let status = pod.status.as_ref();
    let main = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[]);
    let init = status
        .and_then(|s| s.init_container_statuses.as_deref())
        .unwrap_or(&[]);
    init.iter().chain(main.iter())
}

fn has_condition(pod: &Pod, type_: &str, status: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == status))
        .unwrap_or(false)
}

/// Not terminated, not pending and not marked for deletion
pub fn is_pod_active(pod: &Pod) -> bool {
    !matches!(phase(pod), PHASE_SUCCEEDED | PHASE_PENDING | PHASE_FAILED)
        && pod.metadata.deletion_timestamp.is_none()
}

/// Any init or main container is waiting in crash-loop back-off
pub fn is_crash_looping(pod: &Pod) -> bool {
    container_statuses(pod).any(|cs| {
        cs.state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
            == Some(REASON_CRASH_LOOP)
    })
}

/// Active and, when running, not crash-looping
pub fn is_pod_alive(pod: &Pod) -> bool {
    if phase(pod) == PHASE_RUNNING && is_crash_looping(pod) {
        return false;
    }
    is_pod_active(pod)
}

/// All containers report ready
pub fn is_pod_ready(pod: &Pod) -> bool {
    has_condition(pod, "ContainersReady", "True")
}

/// Any main container has restarted since the pod was created
pub fn is_pod_restarted(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| statuses.iter().any(|cs| cs.restart_count != 0))
        .unwrap_or(false)
}

pub fn is_pod_evicted(pod: &Pod) -> bool {
    phase(pod) == PHASE_FAILED
        && pod.status.as_ref().and_then(|s| s.reason.as_deref()) == Some(REASON_EVICTED)
}

pub fn is_pod_unscheduled(pod: &Pod) -> bool {
    if !matches!(phase(pod), PHASE_PENDING | PHASE_FAILED) {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some(REASON_UNSCHEDULABLE)
            })
        })
        .unwrap_or(false)
}

/// Snapshot of every predicate, used for structured logging
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PodHealth {
    pub alive: bool,
    pub ready: bool,
    pub crash_looping: bool,
    pub restarted: bool,
    pub evicted: bool,
    pub unscheduled: bool,
}

impl PodHealth {
    pub fn classify(pod: &Pod) -> Self {
        Self {
            alive: is_pod_alive(pod),
            ready: is_pod_ready(pod),
            crash_looping: is_crash_looping(pod),
            restarted: is_pod_restarted(pod),
            evicted: is_pod_evicted(pod),
            unscheduled: is_pod_unscheduled(pod),
        }
    }

    /// Eligible to serve as master
    pub fn is_healthy(&self) -> bool {
        self.alive && self.ready
    }
}
