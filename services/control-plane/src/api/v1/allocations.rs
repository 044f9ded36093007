//! Allocation API endpoints, nested under a node.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use berth_id::{AllocationId, NodeId};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::FleetError;
use crate::registry::Allocation;
use crate::state::AppState;

/// Upper bound on ports created by one request.
const MAX_PORTS_PER_REQUEST: usize = 1000;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_allocations).post(create_allocations))
        .route("/{allocation_id}", delete(delete_allocation))
}

#[derive(Debug, Deserialize)]
pub struct CreateAllocationsRequest {
    pub bind_address: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Serialize)]
pub struct AllocationResponse {
    pub id: String,
    pub node_id: String,
    pub bind_address: String,
    pub port: u16,
    pub assigned: bool,
}

impl From<Allocation> for AllocationResponse {
    fn from(allocation: Allocation) -> Self {
        Self {
            id: allocation.id.to_string(),
            node_id: allocation.node_id.to_string(),
            bind_address: allocation.bind_address,
            port: allocation.port,
            assigned: allocation.assigned,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListAllocationsResponse {
    pub items: Vec<AllocationResponse>,
}

/// POST /v1/nodes/{node_id}/allocations
async fn create_allocations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
    Json(req): Json<CreateAllocationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = ctx.parse_id(&node_id, "invalid_node_id", "node")?;

    let bind_address = req.bind_address.trim();
    if bind_address.is_empty() {
        return Err(ctx.fail(FleetError::validation("bind_address must not be empty")));
    }
    if req.ports.is_empty() || req.ports.len() > MAX_PORTS_PER_REQUEST {
        return Err(ctx.fail(FleetError::validation(format!(
            "ports must contain 1 to {MAX_PORTS_PER_REQUEST} entries"
        ))));
    }
    if req.ports.contains(&0) {
        return Err(ctx.fail(FleetError::validation("ports must be between 1 and 65535")));
    }

    let created = state
        .registry()
        .create_allocations(&node_id, bind_address, &req.ports)
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    tracing::info!(node_id = %node_id, count = created.len(), "Allocations created");
    Ok((
        StatusCode::CREATED,
        Json(ListAllocationsResponse {
            items: created.into_iter().map(AllocationResponse::from).collect(),
        }),
    ))
}

/// GET /v1/nodes/{node_id}/allocations
async fn list_allocations(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = ctx.parse_id(&node_id, "invalid_node_id", "node")?;

    let registry = state.registry();
    if registry
        .get_node(&node_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?
        .is_none()
    {
        return Err(ctx.fail(FleetError::not_found("node", node_id)));
    }

    let allocations = registry
        .list_allocations(&node_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    Ok(Json(ListAllocationsResponse {
        items: allocations.into_iter().map(AllocationResponse::from).collect(),
    }))
}

/// DELETE /v1/nodes/{node_id}/allocations/{allocation_id}
async fn delete_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((node_id, allocation_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = ctx.parse_id(&node_id, "invalid_node_id", "node")?;
    let allocation_id: AllocationId =
        ctx.parse_id(&allocation_id, "invalid_allocation_id", "allocation")?;

    let registry = state.registry();
    let allocation = registry
        .get_allocation(&allocation_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?
        .filter(|a| a.node_id == node_id)
        .ok_or_else(|| ctx.fail(FleetError::not_found("allocation", allocation_id)))?;

    registry
        .delete_allocation(&allocation.id)
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    Ok(StatusCode::NO_CONTENT)
}
