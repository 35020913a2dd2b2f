//! HTTP handlers for the REST API
//!
//! Stack queries are answered from the listener stores, never from the API
//! server.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::ResourceExt;
use tracing::{debug, instrument};

use crate::controller::{ControllerState, ObjectKey, RevisionHistory};
use crate::crd::conversion::{self, ConversionReview};

use super::dto::{
    ErrorResponse, HealthResponse, ReadyResponse, StackDetailResponse, StackListResponse,
    StackSummary,
};

/// Liveness: the process is up
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: 503 until both listeners completed their initial list
#[instrument(skip(state))]
pub async fn ready(
    State(state): State<Arc<ControllerState>>,
) -> (StatusCode, Json<ReadyResponse>) {
    let response = ReadyResponse {
        ready: state.is_ready(),
        stacks_synced: state.stacks.is_synced(),
        children_synced: state.children.is_synced(),
        queue_depth: state.queue.len(),
    };
    let code = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// List all known Stacks
#[instrument(skip(state))]
pub async fn list_stacks(State(state): State<Arc<ControllerState>>) -> Json<StackListResponse> {
    let mut items: Vec<StackSummary> = state
        .stacks
        .store()
        .list()
        .iter()
        .map(|s| StackSummary {
            name: s.name_any(),
            namespace: s.namespace().unwrap_or_default(),
            services: s.spec.services.len(),
            phase: s.status.as_ref().map(|st| st.phase).unwrap_or_default(),
        })
        .collect();
    items.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

    let total = items.len();
    Json(StackListResponse { items, total })
}

/// Get one Stack with its revisions and indexed children
#[instrument(skip(state))]
pub async fn get_stack(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<StackDetailResponse>, (StatusCode, Json<ErrorResponse>)> {
    let key = ObjectKey::new(namespace, name);
    let Some(stack) = state.stacks.store().get(&key) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("Stack {} not found", key),
            )),
        ));
    };

    let revisions = RevisionHistory::revisions_of(stack.as_ref())
        .iter()
        .map(|r| (r.number, r.spec.clone()))
        .collect();
    let mut children: Vec<String> = state
        .children
        .store()
        .owned_by(&key)
        .iter()
        .map(ToString::to_string)
        .collect();
    children.sort();

    Ok(Json(StackDetailResponse {
        name: key.name,
        namespace: key.namespace,
        services: stack.spec.services.iter().map(|s| s.name.clone()).collect(),
        status: stack.status.clone().unwrap_or_default(),
        revisions,
        children,
    }))
}

/// CRD conversion webhook
#[instrument(skip(review))]
pub async fn convert(Json(review): Json<ConversionReview>) -> Json<ConversionReview> {
    if let Some(request) = &review.request {
        debug!(
            "Converting {} objects to {}",
            request.objects.len(),
            request.desired_api_version
        );
    }
    Json(conversion::review(review))
}
