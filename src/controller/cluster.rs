//! Cluster writes performed by the reconciler
//!
//! The reconciler reads only from the listener stores and writes only through
//! [`ClusterApi`], which keeps it testable against an in-memory cluster.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::keys::{ChildKey, ChildKind, ObjectKey};
use super::patch::JsonPatch;
use super::resources::{DesiredObject, FIELD_MANAGER};
use crate::crd::{Stack, StackStatus};
use crate::error::{Error, Result};

/// Event types understood by `kubectl describe`
pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a child that does not exist yet
    async fn create_child(&self, object: &DesiredObject) -> Result<()>;

    /// Server-side apply a child. `resource_version` makes the write fail with
    /// 409 when the object changed since it was observed.
    async fn apply_child(&self, object: &DesiredObject, resource_version: Option<String>)
        -> Result<()>;

    /// JSON patch a child, used for the replica fast path
    async fn patch_child(&self, key: &ChildKey, patch: &JsonPatch) -> Result<()>;

    /// Delete a child; a missing object is not an error
    async fn delete_child(&self, key: &ChildKey) -> Result<()>;

    /// JSON patch the Stack itself (revision annotations)
    async fn patch_stack(&self, key: &ObjectKey, patch: &JsonPatch) -> Result<()>;

    async fn update_stack_status(&self, key: &ObjectKey, status: &StackStatus) -> Result<()>;

    async fn publish_event(
        &self,
        stack: &Stack,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// [`ClusterApi`] backed by the Kubernetes API server
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api::<K>(&namespace).create(&params, obj).await?;
        Ok(())
    }

    async fn apply<K>(&self, obj: &K, resource_version: Option<String>) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = resource_version;

        self.api::<K>(&namespace)
            .patch(
                &obj.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;
        Ok(())
    }

    async fn patch_json<K>(&self, key: &ChildKey, patch: &JsonPatch) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        self.api::<K>(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &patch.to_kube_patch()?)
            .await?;
        Ok(())
    }

    async fn delete<K>(&self, key: &ChildKey) -> Result<()>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        match self
            .api::<K>(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => info!("Deleted {}", key),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("{} not found, already deleted", key);
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_child(&self, object: &DesiredObject) -> Result<()> {
        match object {
            DesiredObject::ConfigMap(o) => self.create(o).await,
            DesiredObject::Secret(o) => self.create(o).await,
            DesiredObject::Service(o) => self.create(o).await,
            DesiredObject::Deployment(o) => self.create(o).await,
            DesiredObject::StatefulSet(o) => self.create(o).await,
        }
    }

    async fn apply_child(
        &self,
        object: &DesiredObject,
        resource_version: Option<String>,
    ) -> Result<()> {
        match object {
            DesiredObject::ConfigMap(o) => self.apply(o, resource_version).await,
            DesiredObject::Secret(o) => self.apply(o, resource_version).await,
            DesiredObject::Service(o) => self.apply(o, resource_version).await,
            DesiredObject::Deployment(o) => self.apply(o, resource_version).await,
            DesiredObject::StatefulSet(o) => self.apply(o, resource_version).await,
        }
    }

    async fn patch_child(&self, key: &ChildKey, patch: &JsonPatch) -> Result<()> {
        match key.kind {
            ChildKind::ConfigMap => self.patch_json::<ConfigMap>(key, patch).await,
            ChildKind::Secret => self.patch_json::<Secret>(key, patch).await,
            ChildKind::Service => self.patch_json::<Service>(key, patch).await,
            ChildKind::Deployment => self.patch_json::<Deployment>(key, patch).await,
            ChildKind::StatefulSet => self.patch_json::<StatefulSet>(key, patch).await,
        }
    }

    async fn delete_child(&self, key: &ChildKey) -> Result<()> {
        match key.kind {
            ChildKind::ConfigMap => self.delete::<ConfigMap>(key).await,
            ChildKind::Secret => self.delete::<Secret>(key).await,
            ChildKind::Service => self.delete::<Service>(key).await,
            ChildKind::Deployment => self.delete::<Deployment>(key).await,
            ChildKind::StatefulSet => self.delete::<StatefulSet>(key).await,
        }
    }

    async fn patch_stack(&self, key: &ObjectKey, patch: &JsonPatch) -> Result<()> {
        let api: Api<Stack> = Api::namespaced(self.client.clone(), &key.namespace);
        match api
            .patch(&key.name, &PatchParams::default(), &patch.to_kube_patch()?)
            .await
        {
            Ok(_) => Ok(()),
            // a failed `test` operation is reported as 422
            Err(kube::Error::Api(e)) if e.code == 422 && patch.is_guarded() => {
                debug!("Guarded patch of {} rejected: {}", key, e.message);
                Err(Error::StaleObject(key.to_string()))
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn update_stack_status(&self, key: &ObjectKey, status: &StackStatus) -> Result<()> {
        let api: Api<Stack> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn publish_event(
        &self,
        stack: &Stack,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = stack.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-", stack.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: stack.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}
