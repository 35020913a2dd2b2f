//! Response bodies of the REST API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crd::{StackPhase, StackStatus};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub ready: bool,
    pub stacks_synced: bool,
    pub children_synced: bool,
    pub queue_depth: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StackSummary {
    pub name: String,
    pub namespace: String,
    pub services: usize,
    pub phase: StackPhase,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StackListResponse {
    pub items: Vec<StackSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StackDetailResponse {
    pub name: String,
    pub namespace: String,
    pub services: Vec<String>,
    pub status: StackStatus,
    /// Revision number -> serialized spec
    pub revisions: BTreeMap<u64, String>,
    /// Children currently indexed under this Stack, as "Kind namespace/name"
    pub children: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
