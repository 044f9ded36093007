//! Viewer console endpoint.
//!
//! Provides:
//! - GET /v1/servers/{id}/console?token=... (WebSocket)
//!
//! The token is checked before the upgrade. After that the socket is bridged
//! to one [`RelaySession`]: viewer text frames become [`ViewerRequest`]s and
//! every [`ViewerEvent`] goes back as a JSON text frame.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use berth_id::ServerId;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::FleetError;
use crate::lifecycle::ConsoleTarget;
use crate::state::AppState;
use crate::telemetry::{RelaySession, ViewerEvent, ViewerRequest};

const VIEWER_BUFFER: usize = 64;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{server_id}/console", get(connect_console))
}

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /v1/servers/{server_id}/console
async fn connect_console(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(server_id): Path<String>,
    Query(query): Query<ConsoleQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let server_id: ServerId = ctx.parse_id(&server_id, "invalid_server_id", "server")?;

    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ctx.fail(FleetError::Auth("missing validation token".into())))?;

    let target = state
        .controller()
        .authorize_console(&server_id, &token)
        .await
        .map_err(|e| ctx.fail(e))?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    Ok(ws.on_upgrade(move |socket| handle_console_socket(socket, state, target)))
}

async fn handle_console_socket(socket: WebSocket, state: AppState, target: ConsoleTarget) {
    let server_id = target.server.id;
    let (mut viewer_sender, mut viewer_receiver) = socket.split();

    let (request_tx, request_rx) = mpsc::channel::<ViewerRequest>(VIEWER_BUFFER);
    let (event_tx, mut event_rx) = mpsc::channel::<ViewerEvent>(VIEWER_BUFFER);

    let session = RelaySession::new(
        target,
        state.connector().clone(),
        state.relay_config().clone(),
    );
    let relay = tokio::spawn(session.run(request_rx, event_tx));

    let to_viewer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, server_id = %server_id, "Failed to encode viewer event");
                    continue;
                }
            };
            if let Err(e) = viewer_sender.send(Message::Text(frame.into())).await {
                debug!(error = %e, server_id = %server_id, "Viewer socket closed");
                break;
            }
        }
        let _ = viewer_sender.close().await;
    });

    let from_viewer = tokio::spawn(async move {
        while let Some(msg) = viewer_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Some(request) = ViewerRequest::parse(text.as_str()) else {
                        continue;
                    };
                    if request_tx.send(request).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, server_id = %server_id, "Viewer WebSocket error");
                    break;
                }
            }
        }
    });

    // The relay exits once the viewer stops reading or sending; the sender
    // task then drains and closes the socket.
    let _ = tokio::join!(relay, to_viewer, from_viewer);
    info!(server_id = %server_id, "Console session closed");
}
