//! Children Listener: watches every kind a Stack owns
//!
//! One watch task per kind feeds a shared [`ChildrenIndex`]. Each event
//! updates the per-kind store, resolves the owning Stack through the
//! [`OwnerCache`] and submits the owner's key to the work queue.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys::{ChildKey, ChildKind, ObjectKey};
use super::owner_cache::{OwnerCache, Ownership};
use super::queue::WorkQueue;
use super::resources::{MANAGED_BY_LABEL, MANAGER_NAME};
use super::store::IndexedStore;
use super::stopped;

/// Per-kind stores of owned objects
#[derive(Default)]
pub struct ChildrenStore {
    pub config_maps: IndexedStore<ConfigMap>,
    pub secrets: IndexedStore<Secret>,
    pub services: IndexedStore<Service>,
    pub deployments: IndexedStore<Deployment>,
    pub stateful_sets: IndexedStore<StatefulSet>,
}

impl ChildrenStore {
    /// Metadata of any child, whatever its kind
    pub fn metadata(&self, key: &ChildKey) -> Option<ObjectMeta> {
        let object = key.object_key();
        match key.kind {
            ChildKind::ConfigMap => self.config_maps.get(&object).map(|o| o.metadata.clone()),
            ChildKind::Secret => self.secrets.get(&object).map(|o| o.metadata.clone()),
            ChildKind::Service => self.services.get(&object).map(|o| o.metadata.clone()),
            ChildKind::Deployment => self.deployments.get(&object).map(|o| o.metadata.clone()),
            ChildKind::StatefulSet => self.stateful_sets.get(&object).map(|o| o.metadata.clone()),
        }
    }

    /// Keys of every stored child indexed under `stack`
    pub fn owned_by(&self, stack: &ObjectKey) -> Vec<ChildKey> {
        fn keys<K>(kind: ChildKind, store: &IndexedStore<K>, stack: &ObjectKey) -> Vec<ChildKey> {
            store
                .list_by_owner(stack)
                .into_iter()
                .map(|(key, _)| ChildKey::new(kind, key.namespace, key.name))
                .collect()
        }

        let mut owned = keys(ChildKind::ConfigMap, &self.config_maps, stack);
        owned.extend(keys(ChildKind::Secret, &self.secrets, stack));
        owned.extend(keys(ChildKind::Service, &self.services, stack));
        owned.extend(keys(ChildKind::Deployment, &self.deployments, stack));
        owned.extend(keys(ChildKind::StatefulSet, &self.stateful_sets, stack));
        owned
    }
}

/// A kind watched by the Children Listener
pub trait ChildResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: ChildKind;

    fn store(children: &ChildrenStore) -> &IndexedStore<Self>;
}

macro_rules! child_resource {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl ChildResource for $ty {
            const KIND: ChildKind = $kind;

            fn store(children: &ChildrenStore) -> &IndexedStore<Self> {
                &children.$field
            }
        }
    };
}

child_resource!(ConfigMap, ChildKind::ConfigMap, config_maps);
child_resource!(Secret, ChildKind::Secret, secrets);
child_resource!(Service, ChildKind::Service, services);
child_resource!(Deployment, ChildKind::Deployment, deployments);
child_resource!(StatefulSet, ChildKind::StatefulSet, stateful_sets);

/// Event sink shared by the per-kind watch tasks
pub struct ChildrenIndex {
    store: Arc<ChildrenStore>,
    owners: Arc<OwnerCache>,
    queue: Arc<WorkQueue<ObjectKey>>,
    synced: watch::Sender<BTreeSet<ChildKind>>,
}

impl ChildrenIndex {
    pub fn new(owners: Arc<OwnerCache>, queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        let (synced, _) = watch::channel(BTreeSet::new());
        Self {
            store: Arc::new(ChildrenStore::default()),
            owners,
            queue,
            synced,
        }
    }

    /// Read-only view for the reconciler
    pub fn store(&self) -> Arc<ChildrenStore> {
        self.store.clone()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.borrow().len() == ChildKind::ALL.len()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<BTreeSet<ChildKind>> {
        self.synced.subscribe()
    }

    fn child_key<K: ChildResource>(obj: &K) -> ChildKey {
        let key = ObjectKey::from_resource(obj);
        ChildKey::new(K::KIND, key.namespace, key.name)
    }

    /// Apply one watch event. `buffer` collects objects of an in-progress relist.
    pub async fn handle<K: ChildResource>(&self, event: watcher::Event<K>, buffer: &mut Vec<K>) {
        match event {
            watcher::Event::Init => buffer.clear(),
            watcher::Event::InitApply(obj) => buffer.push(obj),
            watcher::Event::InitDone => {
                let mut affected = BTreeSet::new();
                let items = buffer
                    .drain(..)
                    .map(|obj| {
                        let child = Self::child_key(&obj);
                        let owner = self.owners.observe_child(child.clone(), obj.meta());
                        if let Some(stack) = owner.stack() {
                            affected.insert(stack.clone());
                        }
                        (child.object_key(), obj, owner.stack().cloned())
                    })
                    .collect();

                for gone in K::store(&self.store).replace(items) {
                    if let Ownership::Owned { stack, .. } =
                        self.owners.forget_child(&Self::child_key(gone.as_ref()))
                    {
                        affected.insert(stack);
                    }
                }

                // mark synced first: the reconciler only starts draining the
                // queue once every kind is synced
                let first = self.synced.send_if_modified(|kinds| kinds.insert(K::KIND));
                if first {
                    info!("{} store synced ({} stacks affected)", K::KIND, affected.len());
                }

                for stack in affected {
                    self.queue.submit(stack).await;
                }
            }
            watcher::Event::Apply(obj) => {
                let child = Self::child_key(&obj);
                let previous = self.owners.owner_of(&child);
                let current = self.owners.observe_child(child.clone(), obj.meta());
                debug!("{} applied (owner: {:?})", child, current.stack());

                K::store(&self.store).upsert(child.object_key(), obj, current.stack().cloned());

                if let Some(stack) = previous.stack().filter(|s| Some(*s) != current.stack()) {
                    self.queue.submit(stack.clone()).await;
                }
                if let Some(stack) = current.stack() {
                    self.queue.submit(stack.clone()).await;
                }
            }
            watcher::Event::Delete(obj) => {
                let child = Self::child_key(&obj);
                K::store(&self.store).delete(&child.object_key());
                let owner = self.owners.forget_child(&child);
                debug!("{} deleted (owner: {:?})", child, owner.stack());

                if let Some(stack) = owner.stack() {
                    self.queue.submit(stack.clone()).await;
                }
                // stacks that hit a name conflict on this object can proceed now
                for stack in self.owners.take_claimants(&child) {
                    self.queue.submit(stack).await;
                }
            }
        }
    }
}

/// Watches ConfigMaps, Secrets, Services, Deployments and StatefulSets
/// carrying the controller's managed-by label
pub struct ChildrenListener {
    client: Client,
    namespace: Option<String>,
    index: Arc<ChildrenIndex>,
}

impl ChildrenListener {
    pub fn new(client: Client, namespace: Option<String>, index: Arc<ChildrenIndex>) -> Self {
        Self {
            client,
            namespace,
            index,
        }
    }

    /// Start one watch task per kind and wait until all of them completed
    /// their initial list.
    ///
    /// Returns `false` when `stop` fires first. The watch tasks keep running
    /// until `stop` fires.
    pub async fn start_and_wait_for_full_sync(&self, stop: watch::Receiver<bool>) -> bool {
        let mut synced = self.index.subscribe_synced();

        self.spawn_watch::<ConfigMap>(stop.clone());
        self.spawn_watch::<Secret>(stop.clone());
        self.spawn_watch::<Service>(stop.clone());
        self.spawn_watch::<Deployment>(stop.clone());
        self.spawn_watch::<StatefulSet>(stop.clone());

        tokio::select! {
            biased;
            _ = stopped(stop) => false,
            res = synced.wait_for(|kinds| kinds.len() == ChildKind::ALL.len()) => res.is_ok(),
        }
    }

    fn spawn_watch<K: ChildResource>(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let api: Api<K> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let config =
            watcher::Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGER_NAME}"));
        let index = self.index.clone();

        tokio::spawn(async move {
            let stream = watcher(api, config).default_backoff();
            futures::pin_mut!(stream);
            let mut buffer = Vec::new();

            loop {
                tokio::select! {
                    biased;
                    _ = stopped(stop.clone()) => break,
                    event = stream.try_next() => match event {
                        Ok(Some(event)) => index.handle(event, &mut buffer).await,
                        Ok(None) => break,
                        Err(e) => warn!("{} watch error: {}", K::KIND, e),
                    },
                }
            }
            debug!("{} watch stopped", K::KIND);
        })
    }
}
