//! Stack Listener: desired state
//!
//! Keeps the Stack store current, submits changed keys to the work queue and
//! forwards deletions on a dedicated channel so cleanup is never coalesced
//! with ordinary updates. A periodic resync re-submits every known key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::TryStreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::history::{self, RevisionHistory};
use super::keys::ObjectKey;
use super::owner_cache::OwnerCache;
use super::queue::WorkQueue;
use super::store::IndexedStore;
use super::stopped;
use crate::crd::Stack;
use crate::error::Error;

/// Last trusted history of a Stack whose stored revision was rewritten
struct MutatedHistory {
    trusted: RevisionHistory,
    revision: u64,
}

pub struct StackIndex {
    store: Arc<IndexedStore<Stack>>,
    owners: Arc<OwnerCache>,
    queue: Arc<WorkQueue<ObjectKey>>,
    deletions: mpsc::Sender<Arc<Stack>>,
    synced: watch::Sender<bool>,
    mutated: Mutex<HashMap<ObjectKey, MutatedHistory>>,
}

impl StackIndex {
    pub fn new(
        owners: Arc<OwnerCache>,
        queue: Arc<WorkQueue<ObjectKey>>,
        deletions: mpsc::Sender<Arc<Stack>>,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store: Arc::new(IndexedStore::new()),
            owners,
            queue,
            deletions,
            synced,
            mutated: Mutex::new(HashMap::new()),
        }
    }

    fn mutated(&self) -> MutexGuard<'_, HashMap<ObjectKey, MutatedHistory>> {
        self.mutated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored revision of `key` that the latest update rewrote, if any
    pub fn mutated_revision(&self, key: &ObjectKey) -> Option<u64> {
        self.mutated().get(key).map(|m| m.revision)
    }

    /// Compare the revisions of an incoming Stack with the last trusted ones.
    ///
    /// The trusted history is the stored object's until a mutation is seen,
    /// then stays frozen until the rewritten revision is restored.
    fn check_revisions(&self, key: &ObjectKey, incoming: &Stack) {
        let mut mutated = self.mutated();
        let trusted = match mutated.get(key) {
            Some(m) => m.trusted.clone(),
            None => match self.store.get(key) {
                Some(stored) if stored.uid() == incoming.uid() => {
                    RevisionHistory::revisions_of(stored.as_ref())
                }
                _ => return,
            },
        };

        match history::diff(&trusted, &RevisionHistory::revisions_of(incoming)) {
            Err(Error::RevisionMutated(revision)) => {
                warn!("Revision {} of Stack {} was rewritten", revision, key);
                mutated.insert(key.clone(), MutatedHistory { trusted, revision });
            }
            _ => {
                if mutated.remove(key).is_some() {
                    info!("Revision history of Stack {} restored", key);
                }
            }
        }
    }

    pub fn store(&self) -> Arc<IndexedStore<Stack>> {
        self.store.clone()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    async fn send_deletion(&self, stack: Arc<Stack>) {
        let key = ObjectKey::from_resource(stack.as_ref());
        self.owners.stack_deleted(&key);
        if self.deletions.send(stack).await.is_err() {
            warn!("Deletion channel closed, dropping deletion of {}", key);
        }
    }

    /// Apply one watch event. `buffer` collects Stacks of an in-progress relist.
    pub async fn handle(&self, event: watcher::Event<Stack>, buffer: &mut Vec<Stack>) {
        match event {
            watcher::Event::Init => buffer.clear(),
            watcher::Event::InitApply(stack) => buffer.push(stack),
            watcher::Event::InitDone => {
                let items: Vec<_> = buffer
                    .drain(..)
                    .map(|stack| {
                        let key = ObjectKey::from_resource(&stack);
                        self.check_revisions(&key, &stack);
                        (key, stack, None)
                    })
                    .collect();
                let keys: Vec<ObjectKey> = items.iter().map(|(key, _, _)| key.clone()).collect();

                self.owners.refresh_stacks(
                    items
                        .iter()
                        .filter_map(|(key, stack, _)| stack.uid().map(|uid| (key.clone(), uid))),
                );
                let vanished = self.store.replace(items);

                if self.synced.send_if_modified(|synced| !std::mem::replace(synced, true)) {
                    info!("Stack store synced with {} stacks", keys.len());
                }

                // deleted while the watch was down
                for stack in vanished {
                    self.send_deletion(stack).await;
                }
                for key in keys {
                    self.queue.submit(key).await;
                }
            }
            watcher::Event::Apply(stack) => {
                let key = ObjectKey::from_resource(&stack);
                if let Some(uid) = stack.uid() {
                    self.owners.stack_applied(key.clone(), uid);
                }
                self.check_revisions(&key, &stack);
                debug!("Stack {} applied", key);
                self.store.upsert(key.clone(), stack, None);
                self.queue.submit(key).await;
            }
            watcher::Event::Delete(stack) => {
                let key = ObjectKey::from_resource(&stack);
                debug!("Stack {} deleted", key);
                self.mutated().remove(&key);
                let stack = self.store.delete(&key).unwrap_or_else(|| Arc::new(stack));
                self.send_deletion(stack).await;
            }
        }
    }

    /// Re-submit every known Stack
    pub async fn resync(&self) {
        let keys = self.store.keys();
        debug!("Periodic resync of {} stacks", keys.len());
        for key in keys {
            self.queue.submit(key).await;
        }
    }
}

pub struct StackListener {
    client: Client,
    namespace: Option<String>,
    index: Arc<StackIndex>,
    resync_interval: Duration,
}

impl StackListener {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        index: Arc<StackIndex>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            client,
            namespace,
            index,
            resync_interval,
        }
    }

    /// Start the Stack watch and the resync timer, then wait for the initial list.
    ///
    /// Returns `false` when `stop` fires first.
    pub async fn start_and_wait_for_full_sync(&self, stop: watch::Receiver<bool>) -> bool {
        let mut synced = self.index.subscribe_synced();

        self.spawn_watch(stop.clone());
        spawn_resync(self.index.clone(), self.resync_interval, stop.clone());

        tokio::select! {
            biased;
            _ = stopped(stop) => false,
            res = synced.wait_for(|synced| *synced) => res.is_ok(),
        }
    }

    fn spawn_watch(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let api: Api<Stack> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let index = self.index.clone();

        tokio::spawn(async move {
            let stream = watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            let mut buffer = Vec::new();

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(stop.clone()) => break,
                    event = stream.try_next() => match event {
                        Ok(Some(event)) => index.handle(event, &mut buffer).await,
                        Ok(None) => break,
                        Err(e) => warn!("Stack watch error: {}", e),
                    },
                }
            }
            debug!("Stack watch stopped");
        })
    }
}

/// Re-submit every known Stack each `period`, starting one period from now
pub fn spawn_resync(
    index: Arc<StackIndex>,
    period: Duration,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stopped(stop.clone()) => break,
                _ = ticker.tick() => index.resync().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StackSpec;
    use kube::api::ObjectMeta;

    fn stack(name: &str) -> Stack {
        Stack {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            spec: StackSpec::default(),
            status: None,
        }
    }

    fn index() -> (StackIndex, mpsc::Receiver<Arc<Stack>>) {
        let (tx, rx) = mpsc::channel(4);
        (
            StackIndex::new(Arc::new(OwnerCache::new()), Arc::new(WorkQueue::new(16)), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_initial_list_submits_every_stack() {
        let (index, _rx) = index();
        let mut buffer = Vec::new();

        index.handle(watcher::Event::Init, &mut buffer).await;
        index.handle(watcher::Event::InitApply(stack("app")), &mut buffer).await;
        index.handle(watcher::Event::InitApply(stack("app2")), &mut buffer).await;
        assert!(!index.is_synced());
        index.handle(watcher::Event::InitDone, &mut buffer).await;

        assert!(index.is_synced());
        assert_eq!(index.queue.len(), 2);
        assert_eq!(
            index.owners.stack_uid(&ObjectKey::new("default", "app")).as_deref(),
            Some("uid-app")
        );
    }

    #[tokio::test]
    async fn test_delete_goes_to_deletion_channel() {
        let (index, mut rx) = index();
        let mut buffer = Vec::new();

        index.handle(watcher::Event::Apply(stack("app")), &mut buffer).await;
        assert_eq!(index.queue.take().await, Some(ObjectKey::new("default", "app")));

        index.handle(watcher::Event::Delete(stack("app")), &mut buffer).await;

        assert!(index.queue.is_empty());
        assert!(index.store.is_empty());
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.name_any(), "app");
        assert!(index.owners.stack_uid(&ObjectKey::new("default", "app")).is_none());
    }

    #[tokio::test]
    async fn test_relist_reports_stacks_deleted_while_disconnected() {
        let (index, mut rx) = index();
        let mut buffer = Vec::new();

        index.handle(watcher::Event::Apply(stack("app")), &mut buffer).await;
        index.handle(watcher::Event::Init, &mut buffer).await;
        index.handle(watcher::Event::InitApply(stack("app2")), &mut buffer).await;
        index.handle(watcher::Event::InitDone, &mut buffer).await;

        assert_eq!(rx.recv().await.unwrap().name_any(), "app");
        assert_eq!(index.store.keys(), vec![ObjectKey::new("default", "app2")]);
    }

    fn with_revision(mut stack: Stack, number: u64, spec: &str) -> Stack {
        stack.metadata.annotations.get_or_insert_with(Default::default).insert(
            format!("{}{number}", history::REVISION_ANNOTATION_PREFIX),
            spec.to_string(),
        );
        stack
    }

    #[tokio::test]
    async fn test_rewritten_revision_is_flagged_until_restored() {
        let (index, _rx) = index();
        let key = ObjectKey::new("default", "app");
        let mut buffer = Vec::new();
        let original = with_revision(stack("app"), 1, "a");

        index.handle(watcher::Event::Apply(original.clone()), &mut buffer).await;
        assert_eq!(index.mutated_revision(&key), None);

        // a new revision on top is fine
        let grown = with_revision(original.clone(), 2, "b");
        index.handle(watcher::Event::Apply(grown.clone()), &mut buffer).await;
        assert_eq!(index.mutated_revision(&key), None);

        let rewritten = with_revision(grown.clone(), 1, "x");
        index.handle(watcher::Event::Apply(rewritten.clone()), &mut buffer).await;
        assert_eq!(index.mutated_revision(&key), Some(1));

        // later updates still carry the rewrite
        index.handle(watcher::Event::Apply(rewritten), &mut buffer).await;
        assert_eq!(index.mutated_revision(&key), Some(1));

        index.handle(watcher::Event::Apply(grown), &mut buffer).await;
        assert_eq!(index.mutated_revision(&key), None);
    }

    #[tokio::test]
    async fn test_recreated_stack_starts_a_fresh_history() {
        let (index, _rx) = index();
        let key = ObjectKey::new("default", "app");
        let mut buffer = Vec::new();
        index
            .handle(watcher::Event::Apply(with_revision(stack("app"), 1, "a")), &mut buffer)
            .await;

        let mut recreated = with_revision(stack("app"), 1, "b");
        recreated.metadata.uid = Some("uid-app-2".to_string());
        index.handle(watcher::Event::Apply(recreated), &mut buffer).await;

        assert_eq!(index.mutated_revision(&key), None);
    }

    #[tokio::test]
    async fn test_resync_resubmits_known_keys() {
        let (index, _rx) = index();
        let mut buffer = Vec::new();
        index.handle(watcher::Event::Apply(stack("app")), &mut buffer).await;
        index.queue.take().await;

        index.resync().await;

        assert_eq!(index.queue.take().await, Some(ObjectKey::new("default", "app")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_timer_fires_after_interval() {
        let (tx, _rx) = mpsc::channel(4);
        let queue = Arc::new(WorkQueue::new(16));
        let index = Arc::new(StackIndex::new(Arc::new(OwnerCache::new()), queue.clone(), tx));
        let mut buffer = Vec::new();
        index.handle(watcher::Event::Apply(stack("app")), &mut buffer).await;
        queue.take().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_resync(index.clone(), Duration::from_secs(3600), stop_rx);

        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(1801)).await;
        assert_eq!(queue.len(), 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
