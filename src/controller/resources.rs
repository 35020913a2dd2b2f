//! Kubernetes resource builders for Stack children
//!
//! Builds the desired ConfigMaps, Secrets, Services and workloads of a Stack.
//! The builders are pure; applying them is the reconciler's job.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvVar, HostPathVolumeSource, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::keys::{ChildKey, ChildKind};
use crate::config::PublishedServiceType;
use crate::crd::{
    ConstraintOperator, FileReference, PlacementConstraint, ResourceSpec, ServiceConfig, Stack,
    VolumeType,
};
use crate::error::Result;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "stack-controller";
pub const STACK_LABEL: &str = "com.docker.stack.namespace";
pub const SERVICE_LABEL: &str = "com.docker.service.name";
pub const SPEC_HASH_ANNOTATION: &str = "compose.docker.com/spec-hash";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "stack-controller";

const DEFAULT_VOLUME_SIZE: &str = "1Gi";
const PUBLISHED_SUFFIX: &str = "-published";

/// A rendered child object
#[derive(Clone, Debug)]
pub enum DesiredObject {
    ConfigMap(ConfigMap),
    Secret(Secret),
    Service(Service),
    Deployment(Deployment),
    StatefulSet(StatefulSet),
}

impl DesiredObject {
    pub fn kind(&self) -> ChildKind {
        match self {
            DesiredObject::ConfigMap(_) => ChildKind::ConfigMap,
            DesiredObject::Secret(_) => ChildKind::Secret,
            DesiredObject::Service(_) => ChildKind::Service,
            DesiredObject::Deployment(_) => ChildKind::Deployment,
            DesiredObject::StatefulSet(_) => ChildKind::StatefulSet,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            DesiredObject::ConfigMap(o) => &o.metadata,
            DesiredObject::Secret(o) => &o.metadata,
            DesiredObject::Service(o) => &o.metadata,
            DesiredObject::Deployment(o) => &o.metadata,
            DesiredObject::StatefulSet(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            DesiredObject::ConfigMap(o) => &mut o.metadata,
            DesiredObject::Secret(o) => &mut o.metadata,
            DesiredObject::Service(o) => &mut o.metadata,
            DesiredObject::Deployment(o) => &mut o.metadata,
            DesiredObject::StatefulSet(o) => &mut o.metadata,
        }
    }

    /// Replica count of a workload
    pub fn replicas(&self) -> Option<i32> {
        match self {
            DesiredObject::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
            DesiredObject::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
            _ => None,
        }
    }

    fn set_replicas(&mut self, replicas: Option<i32>) {
        match self {
            DesiredObject::Deployment(d) => {
                if let Some(spec) = d.spec.as_mut() {
                    spec.replicas = replicas;
                }
            }
            DesiredObject::StatefulSet(s) => {
                if let Some(spec) = s.spec.as_mut() {
                    spec.replicas = replicas;
                }
            }
            _ => {}
        }
    }

    /// Volume claim templates of a StatefulSet (immutable once created)
    pub fn claim_templates(&self) -> Option<&Vec<PersistentVolumeClaim>> {
        match self {
            DesiredObject::StatefulSet(s) => {
                s.spec.as_ref().and_then(|s| s.volume_claim_templates.as_ref())
            }
            _ => None,
        }
    }

    fn digest(&self) -> Result<String> {
        match self {
            DesiredObject::ConfigMap(o) => hash(o),
            DesiredObject::Secret(o) => hash(o),
            DesiredObject::Service(o) => hash(o),
            DesiredObject::Deployment(o) => hash(o),
            DesiredObject::StatefulSet(o) => hash(o),
        }
    }
}

/// A child the Stack should own, with its divergence hash
#[derive(Clone, Debug)]
pub struct DesiredChild {
    pub key: ChildKey,
    pub object: DesiredObject,
    pub spec_hash: String,
}

impl DesiredChild {
    fn new(mut object: DesiredObject) -> Result<Self> {
        // replicas are excluded so scaling does not look like a spec change
        let replicas = object.replicas();
        object.set_replicas(None);
        let spec_hash = object.digest()?;
        object.set_replicas(replicas);

        object
            .meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(SPEC_HASH_ANNOTATION.to_string(), spec_hash.clone());

        let meta = object.meta();
        let key = ChildKey::new(
            object.kind(),
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        );
        Ok(Self {
            key,
            object,
            spec_hash,
        })
    }
}

fn hash<T: Serialize>(obj: &T) -> Result<String> {
    let bytes = serde_json::to_vec(obj)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hash recorded on a live child, if any
pub fn recorded_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Render every child of `stack`, ordered ConfigMaps, Secrets, Services, workloads
pub fn desired_children(
    stack: &Stack,
    published_type: PublishedServiceType,
) -> Result<Vec<DesiredChild>> {
    let mut children = Vec::new();

    for (name, config) in stack.spec.configs.iter().filter(|(_, c)| !c.external) {
        children.push(DesiredChild::new(DesiredObject::ConfigMap(ConfigMap {
            metadata: child_meta(stack, &object_name(stack, name), None),
            data: Some(config.data.clone()),
            ..Default::default()
        }))?);
    }

    for (name, secret) in stack.spec.secrets.iter().filter(|(_, s)| !s.external) {
        children.push(DesiredChild::new(DesiredObject::Secret(Secret {
            metadata: child_meta(stack, &object_name(stack, name), None),
            data: Some(
                secret
                    .data
                    .iter()
                    .map(|(k, v)| (k.clone(), k8s_openapi::ByteString(v.clone().into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        }))?);
    }

    for service in &stack.spec.services {
        children.push(DesiredChild::new(DesiredObject::Service(build_headless_service(
            stack, service,
        )))?);
        if service.has_published_ports() {
            children.push(DesiredChild::new(DesiredObject::Service(
                build_published_service(stack, service, published_type),
            ))?);
        }
    }

    for service in &stack.spec.services {
        let workload = if service.has_named_volumes() {
            DesiredObject::StatefulSet(build_statefulset(stack, service))
        } else {
            DesiredObject::Deployment(build_deployment(stack, service))
        };
        children.push(DesiredChild::new(workload)?);
    }

    Ok(children)
}

/// Get the standard labels for a Stack's children
pub fn standard_labels(stack: &Stack, service: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    labels.insert(STACK_LABEL.to_string(), stack.name_any());
    if let Some(service) = service {
        labels.insert(SERVICE_LABEL.to_string(), service.to_string());
    }
    labels
}

/// Labels selecting the pods of one service
fn selector_labels(stack: &Stack, service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (STACK_LABEL.to_string(), stack.name_any()),
        (SERVICE_LABEL.to_string(), service.to_string()),
    ])
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(stack: &Stack) -> OwnerReference {
    OwnerReference {
        api_version: Stack::api_version(&()).to_string(),
        kind: Stack::kind(&()).to_string(),
        name: stack.name_any(),
        uid: stack.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Name of the ConfigMap/Secret for a stack-level config or secret
fn object_name(stack: &Stack, name: &str) -> String {
    format!("{}-{}", stack.name_any(), name)
}

fn child_meta(stack: &Stack, name: &str, service: Option<&ServiceConfig>) -> ObjectMeta {
    let mut labels = service
        .map(|s| s.deploy.labels.clone())
        .unwrap_or_default();
    labels.extend(standard_labels(stack, service.map(|s| s.name.as_str())));

    ObjectMeta {
        name: Some(name.to_string()),
        namespace: stack.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(stack)]),
        ..Default::default()
    }
}

// ============================================================================
// Services
// ============================================================================

fn build_headless_service(stack: &Stack, service: &ServiceConfig) -> Service {
    let ports: Vec<ServicePort> = service
        .target_ports()
        .into_iter()
        .map(|(target, protocol)| ServicePort {
            name: Some(port_name(protocol.to_string(), target)),
            port: target,
            target_port: Some(IntOrString::Int(target)),
            protocol: Some(protocol.to_string()),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: child_meta(stack, &service.name, Some(service)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(stack, &service.name)),
            ports: if ports.is_empty() { None } else { Some(ports) },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_published_service(
    stack: &Stack,
    service: &ServiceConfig,
    published_type: PublishedServiceType,
) -> Service {
    let ports = service
        .ports
        .iter()
        .filter_map(|p| {
            p.published.map(|published| ServicePort {
                name: Some(port_name(p.protocol.to_string(), published)),
                port: published,
                target_port: Some(IntOrString::Int(p.target)),
                protocol: Some(p.protocol.to_string()),
                ..Default::default()
            })
        })
        .collect();

    Service {
        metadata: child_meta(
            stack,
            &format!("{}{PUBLISHED_SUFFIX}", service.name),
            Some(service),
        ),
        spec: Some(ServiceSpec {
            type_: Some(published_type.to_string()),
            selector: Some(selector_labels(stack, &service.name)),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

fn port_name(protocol: String, port: i32) -> String {
    format!("{}-{}", protocol.to_lowercase(), port)
}

// ============================================================================
// Workloads
// ============================================================================

fn build_deployment(stack: &Stack, service: &ServiceConfig) -> Deployment {
    let selector = selector_labels(stack, &service.name);

    Deployment {
        metadata: child_meta(stack, &service.name, Some(service)),
        spec: Some(DeploymentSpec {
            replicas: Some(service.desired_replicas()),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: build_pod_template(stack, service, &selector),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_statefulset(stack: &Stack, service: &ServiceConfig) -> StatefulSet {
    let selector = selector_labels(stack, &service.name);

    let claims = service
        .volumes
        .iter()
        .filter(|v| v.is_named())
        .filter_map(|v| v.source.clone())
        .map(|name| PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(selector.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(DEFAULT_VOLUME_SIZE.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        })
        .collect();

    StatefulSet {
        metadata: child_meta(stack, &service.name, Some(service)),
        spec: Some(StatefulSetSpec {
            replicas: Some(service.desired_replicas()),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            service_name: service.name.clone(),
            template: build_pod_template(stack, service, &selector),
            volume_claim_templates: Some(claims),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_pod_template(
    stack: &Stack,
    service: &ServiceConfig,
    selector: &BTreeMap<String, String>,
) -> PodTemplateSpec {
    let mut labels = service.labels.clone();
    labels.extend(selector.clone());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());

    let (volumes, mounts) = build_volumes(stack, service);

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![build_container(service, mounts)],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            affinity: build_affinity(&service.deploy.placement.constraints),
            ..Default::default()
        }),
    }
}

fn build_container(service: &ServiceConfig, mounts: Vec<VolumeMount>) -> Container {
    let env: Vec<EnvVar> = service
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let ports: Vec<ContainerPort> = service
        .target_ports()
        .into_iter()
        .map(|(target, protocol)| ContainerPort {
            container_port: target,
            protocol: Some(protocol.to_string()),
            ..Default::default()
        })
        .collect();

    Container {
        name: service.name.clone(),
        image: Some(service.image.clone()),
        command: non_empty(service.entrypoint.clone()),
        args: non_empty(service.command.clone()),
        working_dir: service.working_dir.clone(),
        env: non_empty(env),
        ports: non_empty(ports),
        volume_mounts: non_empty(mounts),
        resources: build_resources(service),
        ..Default::default()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn build_resources(service: &ServiceConfig) -> Option<ResourceRequirements> {
    fn quantities(spec: &ResourceSpec) -> Option<BTreeMap<String, Quantity>> {
        let mut map = BTreeMap::new();
        if let Some(cpus) = &spec.cpus {
            map.insert("cpu".to_string(), Quantity(cpus.clone()));
        }
        if let Some(memory) = &spec.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        non_empty_map(map)
    }

    let resources = &service.deploy.resources;
    let limits = resources.limits.as_ref().and_then(quantities);
    let requests = resources.reservations.as_ref().and_then(quantities);
    if limits.is_none() && requests.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    })
}

fn non_empty_map<V>(map: BTreeMap<String, V>) -> Option<BTreeMap<String, V>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Pod volumes and container mounts for volumes, configs and secrets
fn build_volumes(stack: &Stack, service: &ServiceConfig) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    for (i, volume) in service.volumes.iter().enumerate() {
        let name = match (volume.type_, volume.source.as_deref()) {
            // backed by the StatefulSet claim template of the same name
            (VolumeType::Volume, Some(source)) if volume.is_named() => source.to_string(),
            (VolumeType::Volume, _) => {
                let name = format!("anon-{i}");
                volumes.push(Volume {
                    name: name.clone(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                });
                name
            }
            (VolumeType::Bind, source) => {
                let name = format!("bind-{i}");
                volumes.push(Volume {
                    name: name.clone(),
                    host_path: Some(HostPathVolumeSource {
                        path: source.unwrap_or_default().to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                name
            }
            (VolumeType::Tmpfs, _) => {
                let name = format!("tmpfs-{i}");
                volumes.push(Volume {
                    name: name.clone(),
                    empty_dir: Some(EmptyDirVolumeSource {
                        medium: Some("Memory".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                name
            }
        };

        mounts.push(VolumeMount {
            name,
            mount_path: volume.target.clone(),
            read_only: volume.read_only.then_some(true),
            ..Default::default()
        });
    }

    for reference in &service.configs {
        let name = format!("config-{}", reference.source);
        let external = stack
            .spec
            .configs
            .get(&reference.source)
            .is_some_and(|c| c.external);
        volumes.push(Volume {
            name: name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(referenced_name(stack, reference, external)),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name,
            mount_path: mount_path(reference, "/"),
            read_only: Some(true),
            ..Default::default()
        });
    }

    for reference in &service.secrets {
        let name = format!("secret-{}", reference.source);
        let external = stack
            .spec
            .secrets
            .get(&reference.source)
            .is_some_and(|s| s.external);
        volumes.push(Volume {
            name: name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(referenced_name(stack, reference, external)),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name,
            mount_path: mount_path(reference, "/run/secrets/"),
            read_only: Some(true),
            ..Default::default()
        });
    }

    (volumes, mounts)
}

/// External objects are referenced by their own name
fn referenced_name(stack: &Stack, reference: &FileReference, external: bool) -> String {
    if external {
        reference.source.clone()
    } else {
        object_name(stack, &reference.source)
    }
}

fn mount_path(reference: &FileReference, default_dir: &str) -> String {
    reference
        .target
        .clone()
        .unwrap_or_else(|| format!("{default_dir}{}", reference.source))
}

/// Translate placement constraints into required node affinity
fn build_affinity(constraints: &[PlacementConstraint]) -> Option<Affinity> {
    if constraints.is_empty() {
        return None;
    }

    let expressions = constraints
        .iter()
        .map(|c| NodeSelectorRequirement {
            key: node_label(&c.key),
            operator: match c.operator {
                ConstraintOperator::Equal => "In".to_string(),
                ConstraintOperator::NotEqual => "NotIn".to_string(),
            },
            values: Some(vec![c.value.clone()]),
        })
        .collect();

    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(expressions),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn node_label(key: &str) -> String {
    match key {
        "node.hostname" => "kubernetes.io/hostname".to_string(),
        "node.platform.os" => "kubernetes.io/os".to_string(),
        "node.platform.arch" => "kubernetes.io/arch".to_string(),
        other => other
            .strip_prefix("node.labels.")
            .unwrap_or(other)
            .to_string(),
    }
}
