//! Shared types for the Stack CRD
//!
//! These structures form the canonical (stored-version) description of a
//! stack's services, configs and secrets. Other served API versions convert
//! to and from them, see [`super::conversion`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One service of a stack
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Service name; also the name of its workload and headless Service
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Overrides the image entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    /// Overrides the image command (container args)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePortConfig>,

    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ServiceVolumeConfig>,

    /// Configs mounted into the service (must be declared in `spec.configs`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<FileReference>,

    /// Secrets mounted into the service (must be declared in `spec.secrets`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<FileReference>,

    /// Networks the service joins. Kept for round-tripping; every service of
    /// a stack shares the cluster network.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,

    /// Labels applied to the pods of this service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// Whether the service mounts named volumes and therefore needs stable storage
    pub fn has_named_volumes(&self) -> bool {
        self.volumes.iter().any(ServiceVolumeConfig::is_named)
    }

    /// Whether any port is published outside the cluster
    pub fn has_published_ports(&self) -> bool {
        self.ports.iter().any(|p| p.published.is_some())
    }

    /// Distinct `(target, protocol)` pairs in declaration order. Several
    /// published ports may forward to the same container port.
    pub fn target_ports(&self) -> Vec<(i32, PortProtocol)> {
        let mut seen = BTreeSet::new();
        self.ports
            .iter()
            .map(|p| (p.target, p.protocol))
            .filter(|pair| seen.insert(*pair))
            .collect()
    }

    /// Replica count the workload should run with
    pub fn desired_replicas(&self) -> i32 {
        match self.deploy.mode {
            DeployMode::Global => 1,
            DeployMode::Replicated => self.deploy.replicas.unwrap_or(1),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortConfig {
    /// Container port
    pub target: i32,

    /// Port exposed outside the cluster, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<i32>,

    #[serde(default)]
    pub protocol: PortProtocol,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum PortProtocol {
    #[default]
    #[serde(alias = "tcp")]
    TCP,
    #[serde(alias = "udp")]
    UDP,
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortProtocol::TCP => write!(f, "TCP"),
            PortProtocol::UDP => write!(f, "UDP"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    #[serde(default)]
    pub mode: DeployMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub placement: Placement,

    #[serde(default)]
    pub resources: ServiceResources,

    /// Labels applied to the workload object itself
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Replicated,
    Global,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<PlacementConstraint>,
}

/// A node constraint such as `node.labels.disk == ssd`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementConstraint {
    /// `node.hostname`, `node.platform.os`, `node.platform.arch` or `node.labels.<key>`
    pub key: String,
    pub operator: ConstraintOperator,
    pub value: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConstraintOperator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<ResourceSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU quantity, e.g. `"0.5"` or `"500m"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,

    /// Memory quantity, e.g. `"256Mi"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceVolumeConfig {
    /// Volume name (named volume), host path (bind) or empty (anonymous)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Mount path inside the container
    pub target: String,

    #[serde(default, rename = "type")]
    pub type_: VolumeType,

    #[serde(default)]
    pub read_only: bool,
}

impl ServiceVolumeConfig {
    /// A named volume needs a PersistentVolumeClaim
    pub fn is_named(&self) -> bool {
        self.type_ == VolumeType::Volume && self.source.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    #[default]
    Volume,
    Bind,
    Tmpfs,
}

/// Reference from a service to a stack-level config or secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    /// Name of the config/secret in the stack
    pub source: String,

    /// Mount path; defaults to `/<source>` for configs and
    /// `/run/secrets/<source>` for secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Stack-level config (materialized as a ConfigMap)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigObjSpec {
    /// File name -> content
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    /// Managed outside the stack; the controller only references it
    #[serde(default)]
    pub external: bool,
}

/// Stack-level secret (materialized as a Secret)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretObjSpec {
    /// File name -> content
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    #[serde(default)]
    pub external: bool,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
