//! API v1 routes.

mod allocations;
mod console;
mod nodes;
mod regions;
mod servers;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/regions", regions::routes())
        .nest("/nodes", nodes::routes())
        // Allocations are nested under nodes: /v1/nodes/{node_id}/allocations
        .nest("/nodes/{node_id}/allocations", allocations::routes())
        .nest("/servers", servers::routes().merge(console::routes()))
}
