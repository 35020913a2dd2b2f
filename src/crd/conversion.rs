//! Conversion between served Stack versions
//!
//! Every external schema converts to and from the canonical `v1alpha3`
//! [`Stack`]; the controller never sees anything else. The
//! [`review`] function answers `apiextensions.k8s.io/v1` ConversionReview
//! requests so the API server can serve all versions from one stored form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::stack::{Stack, StackSpec};
use super::types::{
    DeployConfig, DeployMode, Placement, PortProtocol, ServiceConfig, ServicePortConfig,
};
use super::v1beta2;
use crate::error::{Error, Result};

/// A served Stack version that converts through the canonical form
pub trait StackConversion: Sized {
    /// `group/version` string of this schema
    const API_VERSION: &'static str;

    fn into_canonical(self) -> Result<Stack>;

    fn from_canonical(stack: Stack) -> Result<Self>;
}

impl StackConversion for Stack {
    const API_VERSION: &'static str = "compose.docker.com/v1alpha3";

    fn into_canonical(self) -> Result<Stack> {
        Ok(self)
    }

    fn from_canonical(stack: Stack) -> Result<Self> {
        Ok(stack)
    }
}

impl StackConversion for v1beta2::Stack {
    const API_VERSION: &'static str = "compose.docker.com/v1beta2";

    fn into_canonical(self) -> Result<Stack> {
        let spec = match self.spec.stack {
            Some(compose) => StackSpec {
                services: compose
                    .services
                    .into_iter()
                    .map(service_to_canonical)
                    .collect::<Result<_>>()?,
                configs: compose.configs,
                secrets: compose.secrets,
            },
            None => StackSpec::default(),
        };

        Ok(Stack {
            metadata: self.metadata,
            spec,
            status: self.status,
        })
    }

    fn from_canonical(stack: Stack) -> Result<Self> {
        let compose = v1beta2::ComposeStack {
            services: stack
                .spec
                .services
                .into_iter()
                .map(service_from_canonical)
                .collect(),
            configs: stack.spec.configs,
            secrets: stack.spec.secrets,
        };

        Ok(v1beta2::Stack {
            metadata: stack.metadata,
            spec: v1beta2::StackSpec {
                stack: Some(compose),
            },
            status: stack.status,
        })
    }
}

fn service_to_canonical(service: v1beta2::ServiceConfig) -> Result<ServiceConfig> {
    let ports = service
        .ports
        .into_iter()
        .map(|p| {
            Ok(ServicePortConfig {
                target: to_i32(u64::from(p.target), "ports.target")?,
                published: match p.published {
                    0 => None,
                    published => Some(to_i32(u64::from(published), "ports.published")?),
                },
                protocol: parse_protocol(&p.protocol)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let deploy = match service.deploy {
        Some(deploy) => DeployConfig {
            mode: parse_mode(&deploy.mode)?,
            replicas: deploy
                .replicas
                .map(|r| to_i32(r, "deploy.replicas"))
                .transpose()?,
            placement: Placement {
                constraints: deploy.constraints,
            },
            resources: deploy.resources,
            labels: deploy.labels,
        },
        None => DeployConfig::default(),
    };

    // v1alpha3 has no notion of "inherit from image": unset values are dropped
    let environment = service
        .environment
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect();

    Ok(ServiceConfig {
        name: service.name,
        image: service.image,
        entrypoint: service.entrypoint,
        command: service.command,
        working_dir: service.working_dir,
        environment,
        ports,
        deploy,
        volumes: service.volumes,
        configs: service.configs,
        secrets: service.secrets,
        networks: service.networks.into_keys().collect(),
        labels: service.labels,
    })
}

fn service_from_canonical(service: ServiceConfig) -> v1beta2::ServiceConfig {
    v1beta2::ServiceConfig {
        name: service.name,
        image: service.image,
        entrypoint: service.entrypoint,
        command: service.command,
        working_dir: service.working_dir,
        environment: service
            .environment
            .into_iter()
            .map(|(key, value)| (key, Some(value)))
            .collect(),
        ports: service
            .ports
            .into_iter()
            .map(|p| v1beta2::ServicePortConfig {
                target: u32::try_from(p.target).unwrap_or_default(),
                published: p
                    .published
                    .and_then(|published| u32::try_from(published).ok())
                    .unwrap_or(0),
                protocol: p.protocol.to_string().to_lowercase(),
            })
            .collect(),
        deploy: Some(v1beta2::DeployConfig {
            mode: match service.deploy.mode {
                DeployMode::Replicated => "replicated".to_string(),
                DeployMode::Global => "global".to_string(),
            },
            replicas: service
                .deploy
                .replicas
                .and_then(|r| u64::try_from(r).ok()),
            constraints: service.deploy.placement.constraints,
            resources: service.deploy.resources,
            labels: service.deploy.labels,
        }),
        volumes: service.volumes,
        configs: service.configs,
        secrets: service.secrets,
        networks: service
            .networks
            .into_iter()
            .map(|network| (network, None))
            .collect(),
        labels: service.labels,
    }
}

fn to_i32(value: u64, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::ConversionError(format!("{field} value {value} is out of range")))
}

fn parse_protocol(protocol: &str) -> Result<PortProtocol> {
    match protocol.to_ascii_lowercase().as_str() {
        "" | "tcp" => Ok(PortProtocol::TCP),
        "udp" => Ok(PortProtocol::UDP),
        other => Err(Error::ConversionError(format!(
            "unsupported port protocol '{other}'"
        ))),
    }
}

fn parse_mode(mode: &str) -> Result<DeployMode> {
    match mode {
        "" | "replicated" => Ok(DeployMode::Replicated),
        "global" => Ok(DeployMode::Global),
        other => Err(Error::ConversionError(format!(
            "unsupported deploy mode '{other}'"
        ))),
    }
}

/// Convert a raw Stack object of any served version to `desired_api_version`
pub fn convert_object(object: Value, desired_api_version: &str) -> Result<Value> {
    let source_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let canonical = if source_version == Stack::API_VERSION {
        serde_json::from_value::<Stack>(object)?
    } else if source_version == v1beta2::Stack::API_VERSION {
        serde_json::from_value::<v1beta2::Stack>(object)?.into_canonical()?
    } else {
        return Err(Error::ConversionError(format!(
            "unknown source version '{source_version}'"
        )));
    };

    if desired_api_version == Stack::API_VERSION {
        Ok(serde_json::to_value(canonical)?)
    } else if desired_api_version == v1beta2::Stack::API_VERSION {
        Ok(serde_json::to_value(v1beta2::Stack::from_canonical(
            canonical,
        )?)?)
    } else {
        Err(Error::ConversionError(format!(
            "unknown desired version '{desired_api_version}'"
        )))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConversionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ConversionResponse>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConversionRequest {
    pub uid: String,
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    #[serde(default)]
    pub objects: Vec<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub uid: String,
    pub converted_objects: Vec<Value>,
    pub result: ConversionResult,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConversionResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Answer a ConversionReview; any failing object fails the whole review
pub fn review(review: ConversionReview) -> ConversionReview {
    let Some(request) = review.request else {
        return ConversionReview {
            response: Some(ConversionResponse {
                uid: String::new(),
                converted_objects: Vec::new(),
                result: ConversionResult {
                    status: "Failed".to_string(),
                    message: Some("conversion review has no request".to_string()),
                },
            }),
            request: None,
            ..review
        };
    };

    let converted = request
        .objects
        .into_iter()
        .map(|object| convert_object(object, &request.desired_api_version))
        .collect::<Result<Vec<_>>>();

    let response = match converted {
        Ok(objects) => ConversionResponse {
            uid: request.uid,
            converted_objects: objects,
            result: ConversionResult {
                status: "Success".to_string(),
                message: None,
            },
        },
        Err(e) => {
            warn!("Stack conversion to {} failed: {}", request.desired_api_version, e);
            ConversionResponse {
                uid: request.uid,
                converted_objects: Vec::new(),
                result: ConversionResult {
                    status: "Failed".to_string(),
                    message: Some(e.to_string()),
                },
            }
        }
    };

    ConversionReview {
        api_version: review.api_version,
        kind: review.kind,
        request: None,
        response: Some(response),
    }
}
