//! Stack Custom Resource Definition (storage version `v1alpha3`)
//!
//! A Stack is a declarative multi-service application. This is the canonical
//! representation the reconciler works with; other served versions convert to
//! it before reaching the controller.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ConfigObjSpec, DeployMode, SecretObjSpec, ServiceConfig, VolumeType,
};

pub const API_GROUP: &str = "compose.docker.com";
pub const STORAGE_VERSION: &str = "v1alpha3";

/// Structured validation error for `StackSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "compose.docker.com",
    version = "v1alpha3",
    kind = "Stack",
    namespaced,
    status = "StackStatus",
    shortname = "stk",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, ConfigObjSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretObjSpec>,
}

impl StackSpec {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Validate the spec before any child object is touched
    ///
    /// # Errors
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();

        for (i, service) in self.services.iter().enumerate() {
            let field = format!("spec.services[{i}]");

            if !is_dns_label(&service.name) {
                errors.push(SpecValidationError::new(
                    format!("{field}.name"),
                    format!("service name '{}' is not a valid DNS-1123 label", service.name),
                    "Use at most 53 lowercase alphanumeric characters or '-', starting and ending with an alphanumeric character.",
                ));
            }
            if !seen.insert(service.name.as_str()) {
                errors.push(SpecValidationError::new(
                    format!("{field}.name"),
                    format!("service '{}' is declared more than once", service.name),
                    "Give every service in the stack a unique name.",
                ));
            }
            if service.image.trim().is_empty() {
                errors.push(SpecValidationError::new(
                    format!("{field}.image"),
                    "image must not be empty",
                    "Set an image reference such as 'nginx:1.27'.",
                ));
            }

            validate_deploy(service, &field, &mut errors);
            validate_ports(service, &field, &mut errors);

            for (j, volume) in service.volumes.iter().enumerate() {
                if volume.target.trim().is_empty() {
                    errors.push(SpecValidationError::new(
                        format!("{field}.volumes[{j}].target"),
                        "volume target must not be empty",
                        "Set the path the volume is mounted at inside the container.",
                    ));
                }
                if volume.type_ == VolumeType::Bind && volume.source.is_none() {
                    errors.push(SpecValidationError::new(
                        format!("{field}.volumes[{j}].source"),
                        "bind mounts require a source path",
                        "Set source to the host path to bind.",
                    ));
                }
                if let Some(source) = volume.source.as_deref().filter(|_| volume.is_named()) {
                    if !is_dns_label(source) {
                        errors.push(SpecValidationError::new(
                            format!("{field}.volumes[{j}].source"),
                            format!("volume name '{source}' is not a valid DNS-1123 label"),
                            "Use lowercase alphanumeric characters or '-' for named volumes.",
                        ));
                    }
                }
            }

            for (j, reference) in service.configs.iter().enumerate() {
                if !self.configs.contains_key(&reference.source) {
                    errors.push(SpecValidationError::new(
                        format!("{field}.configs[{j}].source"),
                        format!("config '{}' is not declared", reference.source),
                        "Declare the config under spec.configs or remove the reference.",
                    ));
                }
            }
            for (j, reference) in service.secrets.iter().enumerate() {
                if !self.secrets.contains_key(&reference.source) {
                    errors.push(SpecValidationError::new(
                        format!("{field}.secrets[{j}].source"),
                        format!("secret '{}' is not declared", reference.source),
                        "Declare the secret under spec.secrets or remove the reference.",
                    ));
                }
            }
        }

        for name in self.configs.keys().chain(self.secrets.keys()) {
            if !is_dns_subdomain(name) {
                errors.push(SpecValidationError::new(
                    format!("spec.configs/secrets[{name}]"),
                    format!("'{name}' is not a valid object name"),
                    "Use lowercase alphanumeric characters, '-' or '.'.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_deploy(service: &ServiceConfig, field: &str, errors: &mut Vec<SpecValidationError>) {
    if let Some(replicas) = service.deploy.replicas {
        if replicas < 0 {
            errors.push(SpecValidationError::new(
                format!("{field}.deploy.replicas"),
                "replicas must not be negative",
                "Set deploy.replicas to 0 or more.",
            ));
        }
        if service.deploy.mode == DeployMode::Global {
            errors.push(SpecValidationError::new(
                format!("{field}.deploy.replicas"),
                "replicas cannot be set for global services",
                "Remove deploy.replicas or switch deploy.mode to replicated.",
            ));
        }
    }
}

fn validate_ports(service: &ServiceConfig, field: &str, errors: &mut Vec<SpecValidationError>) {
    let mut published = BTreeSet::new();
    for (j, port) in service.ports.iter().enumerate() {
        if !(1..=65535).contains(&port.target) {
            errors.push(SpecValidationError::new(
                format!("{field}.ports[{j}].target"),
                format!("target port {} is out of range", port.target),
                "Use a port between 1 and 65535.",
            ));
        }
        if let Some(p) = port.published {
            if !(1..=65535).contains(&p) {
                errors.push(SpecValidationError::new(
                    format!("{field}.ports[{j}].published"),
                    format!("published port {p} is out of range"),
                    "Use a port between 1 and 65535.",
                ));
            }
            if !published.insert((p, port.protocol)) {
                errors.push(SpecValidationError::new(
                    format!("{field}.ports[{j}].published"),
                    format!("port {p}/{} is published twice", port.protocol),
                    "Publish each port/protocol pair once.",
                ));
            }
        }
    }
}

/// DNS-1123 label, shortened so `<name>-published` still fits in 63 characters
fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 53
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

fn is_dns_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 200
        && name.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !part.starts_with('-')
                && !part.ends_with('-')
        })
}

/// Lifecycle phase reported on the Stack
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StackPhase {
    #[default]
    Pending,
    Progressing,
    Available,
    Failure,
}

impl fmt::Display for StackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackPhase::Pending => write!(f, "Pending"),
            StackPhase::Progressing => write!(f, "Progressing"),
            StackPhase::Available => write!(f, "Available"),
            StackPhase::Failure => write!(f, "Failure"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    #[serde(default)]
    pub phase: StackPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Service name -> "ready/desired"
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl StackStatus {
    pub fn new(phase: StackPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}
