//! Kubernetes Event recording for the OpenldapCluster controller
//!
//! Events are fire-and-forget: a failed event is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::crd::OpenldapCluster;

pub use kube::runtime::events::EventType;

/// Action recorded on every event this operator publishes
pub const RECONCILE_ACTION: &str = "Reconcile";

#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event on the cluster object. Never fails.
    async fn publish(
        &self,
        cluster: &OpenldapCluster,
        type_: EventType,
        reason: &str,
        message: &str,
    );
}

/// Publishes events.k8s.io Events through `kube::runtime::events::Recorder`
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        cluster: &OpenldapCluster,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        // A recorder is bound to one object
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            cluster.object_ref(&()),
        );
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: RECONCILE_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                reason,
                cluster = %cluster.name_any(),
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Event reasons shown in `kubectl get events`
pub mod reasons {
    pub const DESIRED_MASTER_CREATED: &str = "DesiredMasterCreated";
    pub const DESIRED_MASTER_UPDATED: &str = "DesiredMasterUpdated";
    pub const MASTER_UNHEALTHY: &str = "MasterUnhealthy";
    pub const CLUSTER_UNHEALTHY: &str = "ClusterUnhealthy";
    pub const PROMOTION_STARTED: &str = "PromotionStarted";
    pub const PROMOTION_FAILED: &str = "PromotionFailed";
    pub const ELECTION_COMPLETED: &str = "ElectionCompleted";
    pub const ELECTION_RESTARTED: &str = "ElectionRestarted";
    pub const CLUSTER_READY: &str = "ClusterReady";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const DEFAULTS_APPLIED: &str = "DefaultsApplied";
}
