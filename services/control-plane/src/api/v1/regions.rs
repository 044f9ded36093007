//! Region API endpoints.
//!
//! Regions group nodes, cap how many servers they hold and name the region
//! placement falls back to when they have no room.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use berth_id::RegionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::FleetError;
use crate::registry::{NewRegion, Region};
use crate::state::AppState;

/// Create region routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_regions).post(create_region))
        .route("/{region_id}", get(get_region).delete(delete_region))
        .route("/{region_id}/fallback", put(set_fallback))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRegionRequest {
    pub name: String,

    /// Unique short identifier, e.g. `eu-west`.
    pub short_code: String,

    #[serde(default)]
    pub country: Option<String>,

    #[serde(default)]
    pub fallback_region_id: Option<RegionId>,

    /// Maximum number of servers across member nodes.
    #[serde(default)]
    pub server_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SetFallbackRequest {
    /// `null` clears the fallback.
    pub fallback_region_id: Option<RegionId>,
}

#[derive(Debug, Serialize)]
pub struct RegionResponse {
    pub id: String,
    pub name: String,
    pub short_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub fallback_region_id: Option<String>,
    pub server_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<Region> for RegionResponse {
    fn from(region: Region) -> Self {
        Self {
            id: region.id.to_string(),
            name: region.name,
            short_code: region.short_code,
            country: region.country,
            fallback_region_id: region.fallback_region_id.map(|id| id.to_string()),
            server_limit: region.server_limit,
            created_at: region.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListRegionsResponse {
    pub items: Vec<RegionResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/regions
async fn create_region(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateRegionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    let short_code = req.short_code.trim();
    if name.is_empty() || short_code.is_empty() {
        return Err(ctx.fail(FleetError::validation(
            "name and short_code must not be empty",
        )));
    }
    if req.server_limit.is_some_and(|limit| limit < 0) {
        return Err(ctx.fail(FleetError::validation("server_limit must not be negative")));
    }

    let region = state
        .registry()
        .create_region(&NewRegion {
            name: name.to_string(),
            short_code: short_code.to_string(),
            country: req.country,
            fallback_region_id: req.fallback_region_id,
            server_limit: req.server_limit,
        })
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    tracing::info!(region_id = %region.id, short_code = %region.short_code, "Region created");
    Ok((StatusCode::CREATED, Json(RegionResponse::from(region))))
}

/// GET /v1/regions
async fn list_regions(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let regions = state
        .registry()
        .list_regions()
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    Ok(Json(ListRegionsResponse {
        items: regions.into_iter().map(RegionResponse::from).collect(),
    }))
}

/// GET /v1/regions/{region_id}
async fn get_region(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(region_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let region_id: RegionId = ctx.parse_id(&region_id, "invalid_region_id", "region")?;

    let region = state
        .registry()
        .get_region(&region_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?
        .ok_or_else(|| ctx.fail(FleetError::not_found("region", region_id)))?;

    Ok(Json(RegionResponse::from(region)))
}

/// PUT /v1/regions/{region_id}/fallback
async fn set_fallback(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(region_id): Path<String>,
    Json(req): Json<SetFallbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let region_id: RegionId = ctx.parse_id(&region_id, "invalid_region_id", "region")?;

    if req.fallback_region_id == Some(region_id) {
        return Err(ctx.fail(FleetError::validation(
            "a region cannot fall back to itself",
        )));
    }

    let region = state
        .registry()
        .set_region_fallback(&region_id, req.fallback_region_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    Ok(Json(RegionResponse::from(region)))
}

/// DELETE /v1/regions/{region_id}
async fn delete_region(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(region_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let region_id: RegionId = ctx.parse_id(&region_id, "invalid_region_id", "region")?;

    state
        .registry()
        .delete_region(&region_id)
        .await
        .map_err(|e| ctx.fail(e.into()))?;

    Ok(StatusCode::NO_CONTENT)
}
