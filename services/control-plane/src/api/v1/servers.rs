//! Server API endpoints.
//!
//! Thin handlers over [`crate::lifecycle::FleetController`]. Reads always
//! go through a daemon resync, so `state` in a response is what the node
//! reports, or `unknown` if it could not be reached.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use berth_id::{AllocationId, NodeId, RegionId, ServerId, UnitId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::daemon::{CargoItem, PowerAction, ServerStatus};
use crate::error::FleetError;
use crate::lifecycle::{CreateServer, ServerView, UpdateServer};
use crate::placement::PlacementTarget;
use crate::registry::{ResourceSpec, Server};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_servers).post(create_server))
        .route(
            "/{server_id}",
            get(get_server).patch(update_server).delete(delete_server),
        )
        .route("/{server_id}/power/{action}", post(power_server))
        .route("/{server_id}/reinstall", post(reinstall_server))
        .route("/{server_id}/cargo", post(ship_cargo))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to create a server. Exactly one of `node_id` and `region_id`
/// must be set.
#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub user_id: UserId,
    pub unit_id: UnitId,
    pub memory_mib: i64,
    pub disk_mib: i64,
    pub cpu_percent: i32,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub region_id: Option<RegionId>,
    #[serde(default)]
    pub allocation_id: Option<AllocationId>,
}

/// Partial update; omitted fields keep their value.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateServerRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub memory_mib: Option<i64>,
    #[serde(default)]
    pub disk_mib: Option<i64>,
    #[serde(default)]
    pub cpu_percent: Option<i32>,
    #[serde(default)]
    pub unit_id: Option<UnitId>,
}

#[derive(Debug, Deserialize)]
pub struct ShipCargoRequest {
    pub items: Vec<CargoItem>,
}

#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub node_id: String,
    pub allocation_id: String,
    pub unit_id: String,
    pub resources: ResourceSpec,
    pub state: String,

    /// Live usage from the daemon, when it answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ServerStatus>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Server> for ServerResponse {
    fn from(server: Server) -> Self {
        Self {
            id: server.id.to_string(),
            name: server.name,
            user_id: server.user_id.to_string(),
            node_id: server.node_id.to_string(),
            allocation_id: server.allocation_id.to_string(),
            unit_id: server.unit_id.to_string(),
            resources: server.resources,
            state: server.state.to_string(),
            status: None,
            created_at: server.created_at,
            updated_at: server.updated_at,
        }
    }
}

impl From<ServerView> for ServerResponse {
    fn from(view: ServerView) -> Self {
        Self {
            status: view.status,
            ..Self::from(view.server)
        }
    }
}

/// Create response; the only place the validation token is handed out.
#[derive(Debug, Serialize)]
pub struct CreatedServerResponse {
    #[serde(flatten)]
    pub server: ServerResponse,
    pub validation_token: String,
}

#[derive(Debug, Serialize)]
pub struct ListServersResponse {
    pub items: Vec<ServerResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/servers
async fn create_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateServerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let server = state
        .controller()
        .create_server(CreateServer {
            name: req.name,
            user_id: req.user_id,
            unit_id: req.unit_id,
            resources: ResourceSpec {
                memory_mib: req.memory_mib,
                disk_mib: req.disk_mib,
                cpu_percent: req.cpu_percent,
            },
            target: PlacementTarget {
                node_id: req.node_id,
                region_id: req.region_id,
                allocation_id: req.allocation_id,
            },
        })
        .await
        .map_err(|e| ctx.fail(e))?;

    let validation_token = server.validation_token.clone();
    Ok((
        StatusCode::CREATED,
        Json(CreatedServerResponse {
            server: ServerResponse::from(server),
            validation_token,
        }),
    ))
}

/// GET /v1/servers
async fn list_servers(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let views = state
        .controller()
        .list_servers()
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(Json(ListServersResponse {
        items: views.into_iter().map(ServerResponse::from).collect(),
    }))
}

/// GET /v1/servers/{server_id}
async fn get_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id: ServerId = ctx.parse_id(&server_id, "invalid_server_id", "server")?;

    let view = state
        .controller()
        .get_server(&server_id)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(Json(ServerResponse::from(view)))
}

/// PATCH /v1/servers/{server_id}
async fn update_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
    Json(req): Json<UpdateServerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id: ServerId = ctx.parse_id(&server_id, "invalid_server_id", "server")?;

    let server = state
        .controller()
        .update_server(
            &server_id,
            UpdateServer {
                name: req.name,
                memory_mib: req.memory_mib,
                disk_mib: req.disk_mib,
                cpu_percent: req.cpu_percent,
                unit_id: req.unit_id,
            },
        )
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(Json(ServerResponse::from(server)))
}

/// DELETE /v1/servers/{server_id}
async fn delete_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id: ServerId = ctx.parse_id(&server_id, "invalid_server_id", "server")?;

    state
        .controller()
        .delete_server(&server_id)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/servers/{server_id}/power/{action}
async fn power_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((server_id, action)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id: ServerId = ctx.parse_id(&server_id, "invalid_server_id", "server")?;
    let action: PowerAction = action
        .parse()
        .map_err(|e: String| ctx.fail(FleetError::Validation(e)))?;

    let server = state
        .controller()
        .power(&server_id, action)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok((StatusCode::ACCEPTED, Json(ServerResponse::from(server))))
}

/// POST /v1/servers/{server_id}/reinstall
async fn reinstall_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id: ServerId = ctx.parse_id(&server_id, "invalid_server_id", "server")?;

    let server = state
        .controller()
        .reinstall_server(&server_id)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok((StatusCode::ACCEPTED, Json(ServerResponse::from(server))))
}

/// POST /v1/servers/{server_id}/cargo
async fn ship_cargo(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
    Json(req): Json<ShipCargoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let server_id: ServerId = ctx.parse_id(&server_id, "invalid_server_id", "server")?;

    state
        .controller()
        .ship_cargo(&server_id, &req.items)
        .await
        .map_err(|e| ctx.fail(e))?;

    Ok(StatusCode::ACCEPTED)
}
