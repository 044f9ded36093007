//! Application state shared across request handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::lifecycle::FleetController;
use crate::registry::Registry;
use crate::telemetry::{ChannelConnector, RelayConfig};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    controller: FleetController,
    connector: Arc<dyn ChannelConnector>,
    relay: RelayConfig,
    db: Option<Database>,
}

impl AppState {
    pub fn new(
        controller: FleetController,
        connector: Arc<dyn ChannelConnector>,
        relay: RelayConfig,
        db: Option<Database>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                controller,
                connector,
                relay,
                db,
            }),
        }
    }

    pub fn controller(&self) -> &FleetController {
        &self.inner.controller
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        self.inner.controller.registry()
    }

    pub fn connector(&self) -> &Arc<dyn ChannelConnector> {
        &self.inner.connector
    }

    pub fn relay_config(&self) -> &RelayConfig {
        &self.inner.relay
    }

    /// Database handle, absent when running on the in-memory registry.
    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
