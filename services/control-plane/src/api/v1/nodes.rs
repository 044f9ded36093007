//! Node API endpoints.
//!
//! Nodes are top-level infrastructure resources: /v1/nodes. The status
//! endpoint is called by the external health prober, not by tenants.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use berth_id::{NodeId, RegionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::FleetError;
use crate::registry::{NewNode, Node};
use crate::state::AppState;

const MAX_SECRET_LEN: usize = 255;

/// Create node routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes).post(create_node))
        .route("/{node_id}", get(get_node).delete(delete_node))
        .route("/{node_id}/status", post(report_status))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to register a node.
#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,

    /// Hostname or address the daemon listens on.
    pub host: String,

    /// Daemon API port.
    pub port: u16,

    /// Shared secret the daemon expects on every call.
    pub secret: String,

    #[serde(default)]
    pub region_id: Option<RegionId>,
}

/// Liveness observation from the health prober.
#[derive(Debug, Deserialize)]
pub struct NodeStatusRequest {
    pub online: bool,
}

/// Response for a single node. The daemon secret is never returned.
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub is_online: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub region_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            id: node.id.to_string(),
            name: node.name,
            host: node.host,
            port: node.port,
            is_online: node.is_online,
            last_checked_at: node.last_checked_at,
            region_id: node.region_id.map(|id| id.to_string()),
            created_at: node.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    pub items: Vec<NodeResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/nodes
async fn create_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    let host = req.host.trim();
    if name.is_empty() || host.is_empty() {
        return Err(ctx.fail(FleetError::validation("name and host must not be empty")));
    }
    if req.port == 0 {
        return Err(ctx.fail(FleetError::validation("port must be between 1 and 65535")));
    }
    if req.secret.is_empty() || req.secret.len() > MAX_SECRET_LEN {
        return Err(ctx.fail(FleetError::validation(format!(
            "secret must be 1 to {MAX_SECRET_LEN} bytes"
        ))));
    }

    let node = state
        .registry()
        .create_node(&NewNode {
            name: name.to_string(),
            host: host.to_string(),
            port: req.port,
            secret: req.secret,
            region_id: req.region_id,
        })
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    tracing::info!(node_id = %node.id, host = %node.host, "Node registered");
    Ok((StatusCode::CREATED, Json(NodeResponse::from(node))))
}

/// GET /v1/nodes
async fn list_nodes(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let nodes = state
        .registry()
        .list_nodes()
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    Ok(Json(ListNodesResponse {
        items: nodes.into_iter().map(NodeResponse::from).collect(),
    }))
}

/// GET /v1/nodes/{node_id}
async fn get_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = ctx.parse_id(&node_id, "invalid_node_id", "node")?;

    let node = state
        .registry()
        .get_node(&node_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?
        .ok_or_else(|| ctx.fail(FleetError::not_found("node", node_id)))?;

    Ok(Json(NodeResponse::from(node)))
}

/// POST /v1/nodes/{node_id}/status
async fn report_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
    Json(req): Json<NodeStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = ctx.parse_id(&node_id, "invalid_node_id", "node")?;

    let node = state
        .registry()
        .set_node_online(&node_id, req.online)
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    tracing::debug!(node_id = %node.id, online = node.is_online, "Node status recorded");
    Ok(Json(NodeResponse::from(node)))
}

/// DELETE /v1/nodes/{node_id}
async fn delete_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = ctx.parse_id(&node_id, "invalid_node_id", "node")?;

    state
        .registry()
        .delete_node(&node_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    Ok(StatusCode::NO_CONTENT)
}
