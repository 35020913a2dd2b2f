//! Runtime configuration consumed by the controller
//!
//! Values normally arrive from the command line (see `main.rs`); every field
//! has a default so tests and embedders can use `ControllerConfig::default()`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default period of the Stack listener's full resync
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Default number of distinct keys the work queue holds before `submit` blocks
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Default buffer of the Stack deletion channel
pub const DEFAULT_DELETION_QUEUE_DEPTH: usize = 64;

/// Default delay before a key that failed transiently is submitted again
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(15);

/// Default number of spec revisions kept on a Stack
pub const DEFAULT_REVISION_HISTORY_LIMIT: usize = 10;

/// Kubernetes Service type used for published ports
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishedServiceType {
    #[default]
    LoadBalancer,
    NodePort,
    ClusterIP,
}

impl fmt::Display for PublishedServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishedServiceType::LoadBalancer => write!(f, "LoadBalancer"),
            PublishedServiceType::NodePort => write!(f, "NodePort"),
            PublishedServiceType::ClusterIP => write!(f, "ClusterIP"),
        }
    }
}

impl FromStr for PublishedServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loadbalancer" => Ok(PublishedServiceType::LoadBalancer),
            "nodeport" => Ok(PublishedServiceType::NodePort),
            "clusterip" => Ok(PublishedServiceType::ClusterIP),
            other => Err(format!(
                "unknown service type '{other}' (expected LoadBalancer, NodePort or ClusterIP)"
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Restrict every watch to one namespace; `None` watches cluster-wide
    pub namespace: Option<String>,
    pub reconcile_interval: Duration,
    pub default_service_type: PublishedServiceType,
    pub queue_depth: usize,
    pub deletion_queue_depth: usize,
    pub requeue_delay: Duration,
    pub revision_history_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            default_service_type: PublishedServiceType::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            deletion_queue_depth: DEFAULT_DELETION_QUEUE_DEPTH,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            revision_history_limit: DEFAULT_REVISION_HISTORY_LIMIT,
        }
    }
}

/// Parse durations written as `<n>`, `<n>s`, `<n>m`, `<n>h` or `<n>d`
///
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;
    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{input}' is too large"))
}
