//! Child -> owning Stack resolution
//!
//! Entries are keyed by child identity and point one way, to the owner's
//! `(namespace, name)` and UID. A child keeps resolving to its owner after the
//! Stack is deleted, until the child itself disappears.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use kube::api::ObjectMeta;

use super::keys::{ChildKey, ObjectKey};
use crate::crd::API_GROUP;

const STACK_KIND: &str = "Stack";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    Unowned,
    Owned { stack: ObjectKey, uid: String },
}

impl Ownership {
    /// Whether this is the Stack identified by `stack` and `uid`
    pub fn is_owned_by(&self, stack: &ObjectKey, uid: &str) -> bool {
        matches!(self, Ownership::Owned { stack: s, uid: u } if s == stack && u == uid)
    }

    pub fn stack(&self) -> Option<&ObjectKey> {
        match self {
            Ownership::Owned { stack, .. } => Some(stack),
            Ownership::Unowned => None,
        }
    }
}

#[derive(Default)]
struct OwnerState {
    stack_uids: HashMap<ObjectKey, String>,
    children: HashMap<ChildKey, (ObjectKey, String)>,
    /// Stacks that wanted a name held by someone else
    claimants: HashMap<ChildKey, BTreeSet<ObjectKey>>,
}

#[derive(Default)]
pub struct OwnerCache {
    state: Mutex<OwnerState>,
}

impl OwnerCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OwnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the set of live stacks, e.g. after the Stack relist
    pub fn refresh_stacks(&self, stacks: impl IntoIterator<Item = (ObjectKey, String)>) {
        self.lock().stack_uids = stacks.into_iter().collect();
    }

    pub fn stack_applied(&self, stack: ObjectKey, uid: String) {
        self.lock().stack_uids.insert(stack, uid);
    }

    /// Forget a live Stack. Children entries stay until the children go.
    pub fn stack_deleted(&self, stack: &ObjectKey) {
        self.lock().stack_uids.remove(stack);
    }

    pub fn stack_uid(&self, stack: &ObjectKey) -> Option<String> {
        self.lock().stack_uids.get(stack).cloned()
    }

    /// Record the owner of a child from its metadata and return it
    pub fn observe_child(&self, child: ChildKey, meta: &ObjectMeta) -> Ownership {
        let owner = stack_owner(&child.namespace, meta);
        let mut state = self.lock();
        match owner {
            Some((stack, uid)) => {
                state.children.insert(child, (stack.clone(), uid.clone()));
                Ownership::Owned { stack, uid }
            }
            None => {
                state.children.remove(&child);
                Ownership::Unowned
            }
        }
    }

    /// Drop the entry of a deleted child, returning who owned it
    pub fn forget_child(&self, child: &ChildKey) -> Ownership {
        match self.lock().children.remove(child) {
            Some((stack, uid)) => Ownership::Owned { stack, uid },
            None => Ownership::Unowned,
        }
    }

    pub fn owner_of(&self, child: &ChildKey) -> Ownership {
        match self.lock().children.get(child) {
            Some((stack, uid)) => Ownership::Owned {
                stack: stack.clone(),
                uid: uid.clone(),
            },
            None => Ownership::Unowned,
        }
    }

    pub fn children_of(&self, stack: &ObjectKey) -> Vec<ChildKey> {
        let mut children: Vec<ChildKey> = self
            .lock()
            .children
            .iter()
            .filter(|(_, (owner, _))| owner == stack)
            .map(|(child, _)| child.clone())
            .collect();
        children.sort();
        children
    }

    /// Remember that `stack` wants `child`, which it does not own
    pub fn claim(&self, child: ChildKey, stack: ObjectKey) {
        self.lock().claimants.entry(child).or_default().insert(stack);
    }

    /// Stacks waiting for `child` to go away
    pub fn take_claimants(&self, child: &ChildKey) -> BTreeSet<ObjectKey> {
        self.lock().claimants.remove(child).unwrap_or_default()
    }

    /// Drop every entry pointing at `stack` once its cleanup has run.
    /// With `uid`, entries of a newer Stack of the same name are kept.
    pub fn release_stack(&self, stack: &ObjectKey, uid: Option<&str>) {
        let released = |owner: &ObjectKey, owner_uid: &str| {
            owner == stack && uid.map_or(true, |uid| uid == owner_uid)
        };

        let mut state = self.lock();
        state
            .children
            .retain(|_, (owner, owner_uid)| !released(owner, owner_uid));
        for claimants in state.claimants.values_mut() {
            claimants.remove(stack);
        }
        state.claimants.retain(|_, claimants| !claimants.is_empty());
        if let Some(live) = state.stack_uids.get(stack) {
            if released(stack, live) {
                state.stack_uids.remove(stack);
            }
        }
    }
}

/// Owning Stack of an object, from its owner references
pub fn stack_owner(namespace: &str, meta: &ObjectMeta) -> Option<(ObjectKey, String)> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == STACK_KIND && r.api_version.starts_with(&format!("{API_GROUP}/")))
        .map(|r| (ObjectKey::new(namespace, r.name.clone()), r.uid.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::keys::ChildKind;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owned_meta(stack: &str, uid: &str) -> ObjectMeta {
        ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: "compose.docker.com/v1alpha3".to_string(),
                kind: "Stack".to_string(),
                name: stack.to_string(),
                uid: uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        }
    }

    fn child(name: &str) -> ChildKey {
        ChildKey::new(ChildKind::Deployment, "default", name)
    }

    #[test]
    fn test_observe_resolves_owner() {
        let cache = OwnerCache::new();
        let ownership = cache.observe_child(child("front"), &owned_meta("app", "uid-1"));

        let app = ObjectKey::new("default", "app");
        assert!(ownership.is_owned_by(&app, "uid-1"));
        assert!(!ownership.is_owned_by(&app, "uid-2"));
        assert_eq!(cache.owner_of(&child("front")), ownership);
        assert_eq!(cache.children_of(&app), vec![child("front")]);
    }

    #[test]
    fn test_foreign_owner_reference_is_unowned() {
        let cache = OwnerCache::new();
        let mut meta = owned_meta("app", "uid-1");
        if let Some(refs) = meta.owner_references.as_mut() {
            refs[0].api_version = "apps/v1".to_string();
            refs[0].kind = "ReplicaSet".to_string();
        }

        assert_eq!(cache.observe_child(child("front"), &meta), Ownership::Unowned);
        assert_eq!(cache.owner_of(&child("front")), Ownership::Unowned);
    }

    #[test]
    fn test_cleared_owner_reference_removes_entry() {
        let cache = OwnerCache::new();
        cache.observe_child(child("front"), &owned_meta("app", "uid-1"));
        cache.observe_child(child("front"), &ObjectMeta::default());

        assert_eq!(cache.owner_of(&child("front")), Ownership::Unowned);
    }

    #[test]
    fn test_children_stay_owned_after_stack_deletion() {
        let cache = OwnerCache::new();
        let app = ObjectKey::new("default", "app");
        cache.refresh_stacks([(app.clone(), "uid-1".to_string())]);
        cache.observe_child(child("front"), &owned_meta("app", "uid-1"));

        cache.stack_deleted(&app);
        assert!(cache.stack_uid(&app).is_none());
        assert!(cache.owner_of(&child("front")).is_owned_by(&app, "uid-1"));

        assert_eq!(
            cache.forget_child(&child("front")).stack(),
            Some(&app)
        );
        assert!(cache.children_of(&app).is_empty());
    }

    #[test]
    fn test_release_stack_drops_entries() {
        let cache = OwnerCache::new();
        let app = ObjectKey::new("default", "app");
        cache.observe_child(child("front"), &owned_meta("app", "uid-1"));
        cache.observe_child(child("back"), &owned_meta("app", "uid-1"));
        cache.observe_child(child("other"), &owned_meta("app2", "uid-2"));

        cache.release_stack(&app, Some("uid-1"));

        assert!(cache.children_of(&app).is_empty());
        assert_eq!(cache.children_of(&ObjectKey::new("default", "app2")).len(), 1);
    }

    #[test]
    fn test_release_keeps_recreated_stack() {
        let cache = OwnerCache::new();
        let app = ObjectKey::new("default", "app");
        cache.observe_child(child("old"), &owned_meta("app", "uid-1"));
        cache.observe_child(child("new"), &owned_meta("app", "uid-2"));
        cache.stack_applied(app.clone(), "uid-2".to_string());

        cache.release_stack(&app, Some("uid-1"));

        assert_eq!(cache.children_of(&app), vec![child("new")]);
        assert_eq!(cache.stack_uid(&app).as_deref(), Some("uid-2"));
    }

    #[test]
    fn test_claimants_are_taken_once() {
        let cache = OwnerCache::new();
        let app2 = ObjectKey::new("default", "app2");
        cache.claim(child("front"), app2.clone());
        cache.claim(child("front"), app2.clone());

        let claimants: Vec<_> = cache.take_claimants(&child("front")).into_iter().collect();
        assert_eq!(claimants, vec![app2]);
        assert!(cache.take_claimants(&child("front")).is_empty());
    }
}
