//! Core reconciliation loop for Stack resources
//!
//! A single worker drains the work queue and the deletion channel. For each
//! key it compares the Stack's desired children with the listener stores and
//! issues the minimal set of writes, then reports the outcome in the Stack
//! status.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::children::{ChildrenIndex, ChildrenListener, ChildrenStore};
use super::cluster::{ClusterApi, KubeCluster, EVENT_TYPE_WARNING};
use super::conditions::set_phase_conditions;
use super::history;
use super::keys::{ChildKey, ChildKind, ObjectKey};
use super::owner_cache::{OwnerCache, Ownership};
use super::patch::JsonPatch;
use super::queue::WorkQueue;
use super::resources::{desired_children, recorded_hash, DesiredChild, DesiredObject};
use super::stacks::{StackIndex, StackListener};
use super::store::IndexedStore;
use super::stopped;
use crate::config::ControllerConfig;
use crate::crd::{ServiceConfig, Stack, StackPhase};
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
use super::metrics;

/// Upper bound for the initial list of every watched kind
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Consecutive transient failures after which a Stack is reported as failed
pub const FAILURE_THRESHOLD: u32 = 3;

#[cfg(feature = "metrics")]
const CONTROLLER_NAME: &str = "stack";

/// Shared state: queue, owner cache and listener indexes
pub struct ControllerState {
    pub config: ControllerConfig,
    pub queue: Arc<WorkQueue<ObjectKey>>,
    pub owners: Arc<OwnerCache>,
    pub stacks: Arc<StackIndex>,
    pub children: Arc<ChildrenIndex>,
}

impl ControllerState {
    /// Build the state and the receiving end of the deletion channel
    pub fn new(config: ControllerConfig) -> (Self, mpsc::Receiver<Arc<Stack>>) {
        let queue = WorkQueue::new(config.queue_depth);
        #[cfg(feature = "metrics")]
        let queue = queue.with_depth_observer(metrics::set_work_queue_depth);
        let queue = Arc::new(queue);
        let owners = Arc::new(OwnerCache::new());
        let (deletions_tx, deletions_rx) = mpsc::channel(config.deletion_queue_depth.max(1));

        let stacks = Arc::new(StackIndex::new(owners.clone(), queue.clone(), deletions_tx));
        let children = Arc::new(ChildrenIndex::new(owners.clone(), queue.clone()));

        (
            Self {
                config,
                queue,
                owners,
                stacks,
                children,
            },
            deletions_rx,
        )
    }

    /// Both listeners finished their initial list
    pub fn is_ready(&self) -> bool {
        self.stacks.is_synced() && self.children.is_synced()
    }
}

/// Main entry point: start the listeners, wait for sync, run the reconciler
/// until `stop` fires.
pub async fn run_controller(
    client: Client,
    state: Arc<ControllerState>,
    deletions: mpsc::Receiver<Arc<Stack>>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let namespace = state.config.namespace.clone();
    let stacks: Api<Stack> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!("Starting Stack controller");

    // Verify CRD exists
    match stacks.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Stack CRD is available"),
        Err(e) => {
            error!("Stack CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Stack CRD not installed".to_string()));
        }
    }

    let children_listener =
        ChildrenListener::new(client.clone(), namespace.clone(), state.children.clone());
    let stack_listener = StackListener::new(
        client.clone(),
        namespace,
        state.stacks.clone(),
        state.config.reconcile_interval,
    );

    let sync = async {
        tokio::join!(
            children_listener.start_and_wait_for_full_sync(stop.clone()),
            stack_listener.start_and_wait_for_full_sync(stop.clone()),
        )
    };
    if !await_sync(&state, sync, &stop).await? {
        return Ok(());
    }
    info!("Caches synced, starting reconciler");

    let reconciler = Reconciler::new(Arc::new(KubeCluster::new(client)), &state);
    reconciler.run(deletions, stop).await;
    state.queue.close();

    Ok(())
}

/// Wait for both listeners' initial lists, bounded by [`SYNC_TIMEOUT`].
///
/// Returns `Ok(false)` when `stop` fired first. The queue is closed on every
/// path that does not go on to run the reconciler, which releases listeners
/// blocked in `submit`.
pub(crate) async fn await_sync<F>(
    state: &ControllerState,
    sync: F,
    stop: &watch::Receiver<bool>,
) -> Result<bool>
where
    F: Future<Output = (bool, bool)>,
{
    let outcome = match tokio::time::timeout(SYNC_TIMEOUT, sync).await {
        Ok((true, true)) => return Ok(true),
        Ok(_) if *stop.borrow() => {
            info!("Stopped before caches synced");
            Ok(false)
        }
        Ok(_) => Err(Error::SyncError(
            "watch ended before its initial list completed".to_string(),
        )),
        Err(_) => Err(Error::SyncError(format!(
            "caches did not sync within {}s",
            SYNC_TIMEOUT.as_secs()
        ))),
    };
    state.queue.close();
    outcome
}

/// One write the reconciler performs on a child
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildAction {
    Create(ChildKey),
    /// Server-side apply guarded by the observed resourceVersion
    Update(ChildKey),
    /// Only the replica count differs
    Scale { key: ChildKey, replicas: i32 },
    /// The change cannot be applied in place
    Recreate(ChildKey),
    Delete(ChildKey),
}

impl ChildAction {
    pub fn key(&self) -> &ChildKey {
        match self {
            ChildAction::Create(key)
            | ChildAction::Update(key)
            | ChildAction::Recreate(key)
            | ChildAction::Delete(key) => key,
            ChildAction::Scale { key, .. } => key,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ChildAction::Create(_) => "create",
            ChildAction::Update(_) => "update",
            ChildAction::Scale { .. } => "scale",
            ChildAction::Recreate(_) => "recreate",
            ChildAction::Delete(_) => "delete",
        }
    }
}

impl fmt::Display for ChildAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildAction::Scale { key, replicas } => write!(f, "scale {key} to {replicas}"),
            other => write!(f, "{} {}", other.verb(), other.key()),
        }
    }
}

/// A desired child whose name is held by an object the Stack does not own
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub child: ChildKey,
    pub owner: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is owned by {}", self.child, self.owner)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<ChildAction>,
    pub conflicts: Vec<Conflict>,
}

fn describe_owner(ownership: &Ownership) -> String {
    match ownership {
        Ownership::Owned { stack, .. } => format!("stack {stack}"),
        Ownership::Unowned => "an object not managed by a stack".to_string(),
    }
}

fn live_replicas(children: &ChildrenStore, key: &ChildKey) -> Option<i32> {
    let object = key.object_key();
    match key.kind {
        ChildKind::Deployment => children
            .deployments
            .get(&object)
            .and_then(|d| d.spec.as_ref().and_then(|s| s.replicas)),
        ChildKind::StatefulSet => children
            .stateful_sets
            .get(&object)
            .and_then(|s| s.spec.as_ref().and_then(|s| s.replicas)),
        _ => None,
    }
}

fn ready_replicas(children: &ChildrenStore, key: &ChildKey) -> Option<i32> {
    let object = key.object_key();
    match key.kind {
        ChildKind::Deployment => children
            .deployments
            .get(&object)
            .map(|d| d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)),
        ChildKind::StatefulSet => children
            .stateful_sets
            .get(&object)
            .map(|s| s.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0)),
        _ => None,
    }
}

fn claim_names(claims: Option<&Vec<PersistentVolumeClaim>>) -> Vec<String> {
    let mut names: Vec<String> = claims
        .map(|claims| claims.iter().filter_map(|c| c.metadata.name.clone()).collect())
        .unwrap_or_default();
    names.sort();
    names
}

/// Volume claim templates are immutable on a StatefulSet
fn needs_recreate(child: &DesiredChild, children: &ChildrenStore) -> bool {
    let DesiredObject::StatefulSet(_) = &child.object else {
        return false;
    };
    let live = children.stateful_sets.get(&child.key.object_key());
    let live_claims = live
        .as_ref()
        .and_then(|s| s.spec.as_ref())
        .and_then(|s| s.volume_claim_templates.as_ref());

    claim_names(live_claims) != claim_names(child.object.claim_templates())
}

/// Compare desired children with the stores and decide what to write.
///
/// Actions follow the order of `desired`; deletions of children no longer
/// desired come last, workloads before the objects they reference.
pub fn compute_plan(
    stack: &ObjectKey,
    uid: &str,
    desired: &[DesiredChild],
    children: &ChildrenStore,
    owners: &OwnerCache,
) -> Plan {
    let mut plan = Plan::default();

    for child in desired {
        let Some(live) = children.metadata(&child.key) else {
            plan.actions.push(ChildAction::Create(child.key.clone()));
            continue;
        };

        let ownership = owners.owner_of(&child.key);
        if !ownership.is_owned_by(stack, uid) {
            match &ownership {
                // left behind by an earlier Stack with the same name
                Ownership::Owned { stack: owner, .. } if owner == stack => {
                    plan.actions.push(ChildAction::Recreate(child.key.clone()));
                }
                other => plan.conflicts.push(Conflict {
                    child: child.key.clone(),
                    owner: describe_owner(other),
                }),
            }
            continue;
        }

        if recorded_hash(&live) != Some(child.spec_hash.as_str()) {
            if needs_recreate(child, children) {
                plan.actions.push(ChildAction::Recreate(child.key.clone()));
            } else {
                plan.actions.push(ChildAction::Update(child.key.clone()));
            }
        } else if let Some(replicas) = child.object.replicas() {
            if live_replicas(children, &child.key) != Some(replicas) {
                plan.actions.push(ChildAction::Scale {
                    key: child.key.clone(),
                    replicas,
                });
            }
        }
    }

    let wanted: HashSet<&ChildKey> = desired.iter().map(|c| &c.key).collect();
    let mut orphans: Vec<ChildKey> = children
        .owned_by(stack)
        .into_iter()
        .filter(|key| !wanted.contains(key))
        .collect();
    orphans.sort_by(|a, b| b.cmp(a));
    plan.actions.extend(orphans.into_iter().map(ChildAction::Delete));

    plan
}

fn workload_key(namespace: &str, service: &ServiceConfig) -> ChildKey {
    let kind = if service.has_named_volumes() {
        ChildKind::StatefulSet
    } else {
        ChildKind::Deployment
    };
    ChildKey::new(kind, namespace, &service.name)
}

fn is_already_exists(error: &Error) -> bool {
    matches!(
        error,
        Error::KubeError(kube::Error::Api(resp))
            if resp.code == 409 && resp.reason == "AlreadyExists"
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single worker converging Stacks toward their spec
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    stack_index: Arc<StackIndex>,
    stacks: Arc<IndexedStore<Stack>>,
    children: Arc<ChildrenStore>,
    owners: Arc<OwnerCache>,
    queue: Arc<WorkQueue<ObjectKey>>,
    config: ControllerConfig,
    requeues: Mutex<HashMap<ObjectKey, JoinHandle<()>>>,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, state: &ControllerState) -> Self {
        Self {
            cluster,
            stack_index: state.stacks.clone(),
            stacks: state.stacks.store(),
            children: state.children.store(),
            owners: state.owners.clone(),
            queue: state.queue.clone(),
            config: state.config.clone(),
            requeues: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Process keys and deletions until `stop` fires or the queue closes
    pub async fn run(
        self,
        mut deletions: mpsc::Receiver<Arc<Stack>>,
        stop: watch::Receiver<bool>,
    ) {
        info!("Reconciler started");
        while self.process_next(&mut deletions, &stop).await {}

        for (_, handle) in lock(&self.requeues).drain() {
            handle.abort();
        }
        info!("Reconciler stopped");
    }

    /// Handle one deletion or one key. Deletions always go first.
    ///
    /// Returns `false` once the worker should exit.
    pub async fn process_next(
        &self,
        deletions: &mut mpsc::Receiver<Arc<Stack>>,
        stop: &watch::Receiver<bool>,
    ) -> bool {
        tokio::select! {
            biased;
            _ = stopped(stop.clone()) => false,
            Some(stack) = deletions.recv() => {
                self.handle_deletion(&stack).await;
                true
            }
            key = self.queue.take() => match key {
                Some(key) => {
                    self.reconcile_key(&key).await;
                    true
                }
                None => false,
            },
        }
    }

    pub async fn reconcile_key(&self, key: &ObjectKey) {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let Some(stack) = self.stacks.get(key) else {
            debug!("Stack {} no longer exists, removing leftovers", key);
            self.cleanup(key, None).await;
            return;
        };

        let result = self.reconcile(&stack).await;

        #[cfg(feature = "metrics")]
        metrics::observe_reconcile_duration_seconds(
            CONTROLLER_NAME,
            started.elapsed().as_secs_f64(),
        );

        match result {
            Ok(()) => {
                lock(&self.failures).remove(key);
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                metrics::inc_reconcile_error(CONTROLLER_NAME, e.metric_label());

                if e.is_retriable() {
                    warn!(
                        "Reconcile of {} failed, retrying in {}s: {}",
                        key,
                        self.config.requeue_delay.as_secs(),
                        e
                    );
                    self.schedule_requeue(key.clone());
                } else {
                    lock(&self.failures).remove(key);
                    warn!("Reconcile of {} failed: {}", key, e);
                }
            }
        }
    }

    #[instrument(
        skip(self, stack),
        fields(name = %stack.name_any(), namespace = stack.namespace())
    )]
    async fn reconcile(&self, stack: &Stack) -> Result<()> {
        let key = ObjectKey::from_resource(stack);

        if stack.metadata.deletion_timestamp.is_some() {
            debug!("Stack {} is being deleted, skipping", key);
            return Ok(());
        }

        if let Some(revision) = self.stack_index.mutated_revision(&key) {
            let e = Error::RevisionMutated(revision);
            error!("Revision history of {} was rewritten: {}", key, e);
            self.warn_event(stack, "RevisionMutated", &e.to_string()).await;
            self.write_status(
                stack,
                StackPhase::Failure,
                "RevisionMutated",
                &e.to_string(),
                BTreeMap::new(),
            )
            .await?;
            return Err(e);
        }

        if let Err(errors) = stack.spec.validate() {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!("Validation failed for {}: {}", key, message);
            self.warn_event(stack, "ValidationFailed", &message).await;
            self.write_status(
                stack,
                StackPhase::Failure,
                "ValidationFailed",
                &message,
                BTreeMap::new(),
            )
            .await?;
            return Err(Error::ValidationError(message));
        }

        if let Some(patch) = history::record(stack, self.config.revision_history_limit)? {
            debug!("Recording new revision of {}", key);
            if let Err(e) = self.cluster.patch_stack(&key, &patch).await {
                warn!("Failed to record revision of {}: {}", key, e);
                let (phase, reason) = self.failure_phase(&key, &e);
                let (services, _) = self.service_readiness(stack);
                let message = format!("recording revision: {e}");
                self.write_status(stack, phase, reason, &message, services)
                    .await?;
                return Err(e);
            }
        }

        let uid = stack.uid().unwrap_or_default();
        let desired = desired_children(stack, self.config.default_service_type)?;
        let plan = compute_plan(&key, &uid, &desired, &self.children, &self.owners);
        let mut conflicts = plan.conflicts;
        let changed = !plan.actions.is_empty();

        let mut failed = Vec::new();
        for action in &plan.actions {
            match self.execute(action, &desired).await {
                Ok(()) => {}
                Err(e) if matches!(action, ChildAction::Create(_)) && is_already_exists(&e) => {
                    conflicts.push(Conflict {
                        child: action.key().clone(),
                        owner: describe_owner(&Ownership::Unowned),
                    });
                }
                Err(e) => {
                    warn!("Failed to {}: {}", action, e);
                    failed.push(e);
                }
            }
        }

        for conflict in &conflicts {
            warn!("Conflict for {}: {}", key, conflict);
            self.owners.claim(conflict.child.clone(), key.clone());
            self.warn_event(stack, "Conflict", &conflict.to_string()).await;
        }

        let (services, waiting) = self.service_readiness(stack);
        let (retriable, permanent): (Vec<Error>, Vec<Error>) =
            failed.into_iter().partition(Error::is_retriable);

        let (phase, reason, message) = if !conflicts.is_empty() {
            let message = conflicts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            (StackPhase::Failure, "Conflict", message)
        } else if let Some(e) = permanent.first().or(retriable.first()) {
            let (phase, reason) = self.failure_phase(&key, e);
            (phase, reason, e.to_string())
        } else if changed || !waiting.is_empty() {
            let message = if waiting.is_empty() {
                "applying changes".to_string()
            } else {
                format!("waiting for {}", waiting.join(", "))
            };
            (StackPhase::Progressing, "Progressing", message)
        } else {
            (
                StackPhase::Available,
                "Available",
                format!("{} services ready", services.len()),
            )
        };

        self.write_status(stack, phase, reason, &message, services).await?;

        if let Some(e) = retriable.into_iter().next() {
            return Err(e);
        }
        if let Some(conflict) = conflicts.into_iter().next() {
            return Err(Error::OwnershipConflict {
                child: conflict.child.to_string(),
                stack: key.to_string(),
                owner: conflict.owner,
            });
        }
        if let Some(e) = permanent.into_iter().next() {
            return Err(e);
        }
        Ok(())
    }

    async fn execute(&self, action: &ChildAction, desired: &[DesiredChild]) -> Result<()> {
        let object = |key: &ChildKey| {
            desired
                .iter()
                .find(|c| &c.key == key)
                .map(|c| &c.object)
                .ok_or_else(|| Error::ConfigError(format!("{key} is not a desired child")))
        };

        match action {
            ChildAction::Create(key) => {
                info!("Creating {}", key);
                self.cluster.create_child(object(key)?).await?;
            }
            ChildAction::Update(key) => {
                info!("Updating {}", key);
                let resource_version = self.children.metadata(key).and_then(|m| m.resource_version);
                self.cluster.apply_child(object(key)?, resource_version).await?;
            }
            ChildAction::Scale { key, replicas } => {
                info!("Scaling {} to {} replicas", key, replicas);
                let patch = JsonPatch::new().replace("/spec/replicas", *replicas);
                self.cluster.patch_child(key, &patch).await?;
            }
            ChildAction::Recreate(key) => {
                info!("Recreating {}", key);
                self.cluster.delete_child(key).await?;
                self.cluster.create_child(object(key)?).await?;
            }
            ChildAction::Delete(key) => {
                info!("Deleting {}", key);
                self.cluster.delete_child(key).await?;
            }
        }

        #[cfg(feature = "metrics")]
        metrics::inc_child_operation(&action.key().kind.to_string(), action.verb());

        Ok(())
    }

    /// Phase for a failed write. Transient errors keep the Stack
    /// `Progressing` until they repeat [`FAILURE_THRESHOLD`] times in a row.
    fn failure_phase(&self, key: &ObjectKey, error: &Error) -> (StackPhase, &'static str) {
        if !error.is_retriable() {
            return (StackPhase::Failure, "ApplyFailed");
        }
        let attempts = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if attempts >= FAILURE_THRESHOLD {
            (StackPhase::Failure, "ApplyFailed")
        } else {
            (StackPhase::Progressing, "Retrying")
        }
    }

    /// `ready/desired` per service, plus the services still short of replicas
    fn service_readiness(&self, stack: &Stack) -> (BTreeMap<String, String>, Vec<String>) {
        let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
        let mut services = BTreeMap::new();
        let mut waiting = Vec::new();

        for service in &stack.spec.services {
            let desired = service.desired_replicas();
            let ready = ready_replicas(&self.children, &workload_key(&namespace, service));
            let replicas = format!("{}/{}", ready.unwrap_or(0), desired);

            if !ready.is_some_and(|ready| ready >= desired) {
                waiting.push(format!("{} ({})", service.name, replicas));
            }
            services.insert(service.name.clone(), replicas);
        }
        (services, waiting)
    }

    async fn write_status(
        &self,
        stack: &Stack,
        phase: StackPhase,
        reason: &str,
        message: &str,
        services: BTreeMap<String, String>,
    ) -> Result<()> {
        let generation = stack.metadata.generation;
        let mut status = stack.status.clone().unwrap_or_default();
        status.phase = phase;
        status.message = Some(message.to_string());
        status.observed_generation = generation;
        status.services = services;
        set_phase_conditions(&mut status.conditions, phase, reason, message, generation);

        if stack.status.as_ref() == Some(&status) {
            return Ok(());
        }
        debug!("Stack status: {} ({})", phase, message);
        self.cluster
            .update_stack_status(&ObjectKey::from_resource(stack), &status)
            .await
    }

    async fn warn_event(&self, stack: &Stack, reason: &str, message: &str) {
        if let Err(e) = self
            .cluster
            .publish_event(stack, EVENT_TYPE_WARNING, reason, message)
            .await
        {
            warn!("Failed to publish {} event: {}", reason, e);
        }
    }

    /// Delete every child of a removed Stack
    #[instrument(
        skip(self, stack),
        fields(name = %stack.name_any(), namespace = stack.namespace())
    )]
    pub async fn handle_deletion(&self, stack: &Stack) {
        let key = ObjectKey::from_resource(stack);
        info!("Stack {} deleted, removing its children", key);

        if let Some(handle) = lock(&self.requeues).remove(&key) {
            handle.abort();
        }
        lock(&self.failures).remove(&key);

        #[cfg(feature = "metrics")]
        metrics::inc_deletions();

        if !self.cleanup(&key, stack.uid().as_deref()).await {
            return;
        }

        // a Stack of the same name may already exist again; this task is the
        // queue's only consumer, so it must not wait for queue space
        if self.stacks.get(&key).is_some() {
            self.requeue_after(key, Duration::ZERO);
        }
    }

    /// Delete the children of a removed Stack and forget its ownership once
    /// they are gone. Transient failures requeue the key, which lands here
    /// again while the Stack is missing from the store.
    ///
    /// Returns whether cleanup finished.
    async fn cleanup(&self, key: &ObjectKey, uid: Option<&str>) -> bool {
        let failed = self.delete_owned(key, uid).await;
        if failed.iter().any(Error::is_retriable) {
            warn!(
                "Cleanup of {} incomplete, retrying in {}s",
                key,
                self.config.requeue_delay.as_secs()
            );
            self.schedule_requeue(key.clone());
            return false;
        }
        if !failed.is_empty() {
            error!("Cleanup of {} left {} children behind", key, failed.len());
        }
        self.owners.release_stack(key, uid);
        true
    }

    /// Delete children indexed under `stack`, workloads first. With `uid`,
    /// children of another Stack incarnation are left alone.
    ///
    /// Returns the errors of failed deletions.
    async fn delete_owned(&self, stack: &ObjectKey, uid: Option<&str>) -> Vec<Error> {
        let mut failed = Vec::new();
        let mut owned: BTreeSet<ChildKey> = self.children.owned_by(stack).into_iter().collect();
        owned.extend(self.owners.children_of(stack));

        for child in owned.iter().rev() {
            if let (Some(uid), Ownership::Owned { uid: owner_uid, .. }) =
                (uid, self.owners.owner_of(child))
            {
                if owner_uid != uid {
                    continue;
                }
            }
            match self.cluster.delete_child(child).await {
                Ok(()) => {
                    #[cfg(feature = "metrics")]
                    metrics::inc_child_operation(&child.kind.to_string(), "delete");
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", child, e);
                    failed.push(e);
                }
            }
        }
        failed
    }

    fn schedule_requeue(&self, key: ObjectKey) {
        self.requeue_after(key, self.config.requeue_delay);
    }

    /// Submit `key` from a separate task after `delay`
    fn requeue_after(&self, key: ObjectKey, delay: Duration) {
        let queue = self.queue.clone();
        let requeued = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.submit(requeued).await;
        });

        let mut requeues = lock(&self.requeues);
        requeues.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = requeues.insert(key, handle) {
            previous.abort();
        }
    }
}
