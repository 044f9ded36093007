//! Domain error taxonomy shared by the planner, controller and relay.

use thiserror::Error;

use crate::daemon::DaemonError;
use crate::registry::RegistryError;

/// Result type for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced by fleet operations.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Malformed or missing input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A node, region, allocation, unit or server is absent.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// No room left to place a server.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// Allocation already in use, or node/allocation mismatch.
    #[error("conflict: {0}")]
    Conflict(String),

    /// RPC transport failure or upstream-reported daemon failure.
    #[error(transparent)]
    Daemon(#[from] DaemonError),

    /// Invalid validation token.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Storage failure.
    #[error("registry error: {0}")]
    Registry(RegistryError),

    /// A background operation panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Capacity exhaustion while placing a server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("region {region_id} is at its server limit ({current}/{limit})")]
    RegionFull {
        region_id: String,
        limit: i64,
        current: i64,
    },

    #[error("no online node available")]
    NoAvailableNode,

    #[error("no free allocation on node {node_id}")]
    NoAvailableAllocation { node_id: String },
}

impl FleetError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

impl From<RegistryError> for FleetError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { entity, id } => Self::NotFound { entity, id },
            RegistryError::Conflict(message) => Self::Conflict(message),
            RegistryError::RegionFull {
                region_id,
                limit,
                current,
            } => Self::Capacity(CapacityError::RegionFull {
                region_id,
                limit,
                current,
            }),
            other => Self::Registry(other),
        }
    }
}
