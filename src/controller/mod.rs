//! Controller module for Stack reconciliation
//!
//! Listeners keep in-memory stores of Stacks and of the objects they own,
//! a deduplicating work queue carries Stack keys to a single reconciler, and
//! all cluster writes go through [`ClusterApi`].

mod children;
pub mod cluster;
pub mod conditions;
pub mod history;
pub mod keys;
#[cfg(feature = "metrics")]
pub mod metrics;
mod owner_cache;
pub mod patch;
mod queue;
mod reconciler;
pub mod resources;
#[cfg(test)]
mod resources_test;
mod stacks;
mod store;

use tokio::sync::watch;

pub use children::{ChildResource, ChildrenIndex, ChildrenListener, ChildrenStore};
pub use cluster::{ClusterApi, KubeCluster, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
pub use history::{Revision, RevisionHistory};
pub use keys::{ChildKey, ChildKind, ObjectKey};
pub use owner_cache::{stack_owner, OwnerCache, Ownership};
pub use patch::{JsonPatch, Operation};
pub use queue::WorkQueue;
pub use reconciler::{
    compute_plan, run_controller, ChildAction, Conflict, ControllerState, Plan, Reconciler,
    FAILURE_THRESHOLD, SYNC_TIMEOUT,
};
pub use stacks::{spawn_resync, StackIndex, StackListener};
pub use store::IndexedStore;

/// Resolves once `stop` reads `true` or its sender is gone
pub async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
