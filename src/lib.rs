//! stack-controller: reconciles multi-service `Stack` resources on Kubernetes
//!
//! A `Stack` describes a set of services (plus their configs and secrets).
//! The controller watches Stacks and the Deployments, StatefulSets, Services,
//! ConfigMaps and Secrets it creates for them, and converges the cluster
//! toward each Stack's desired spec.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::ControllerConfig;
pub use crate::error::{Error, Result};
