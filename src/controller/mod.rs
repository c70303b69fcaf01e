//! Controller module for OpenldapCluster reconciliation
//!
//! The reconcile loop converges the managed child objects in a fixed order
//! and then hands over to the election engine, which owns the status.

pub mod conditions;
pub mod election;
pub mod events;
pub mod health;
pub mod promotion;
mod reconciler;
pub mod resources;
pub mod store;
pub mod sync;
#[cfg(test)]
mod sync_test;
#[cfg(test)]
pub(crate) mod testing;

use crate::config::OperatorConfig;

pub use election::{ElectionEngine, ElectionStep};
pub use events::{EventRecorder, EventType, KubeEventRecorder};
pub use health::PodHealth;
pub use promotion::PromotionState;
pub use reconciler::{
    calculate_backoff, error_policy, reconcile, reconcile_cluster, run_controller,
    ControllerState, FailureTracker,
};
pub use store::{KubeStore, ObjectStore};
pub use sync::{ManagedResource, RECONCILE_ORDER};

/// Borrowed dependencies shared by the synchronizers and the election engine
pub struct Context<'a, S, R> {
    pub store: &'a S,
    pub recorder: &'a R,
    pub config: &'a OperatorConfig,
}

impl<S, R> Clone for Context<'_, S, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, R> Copy for Context<'_, S, R> {}
