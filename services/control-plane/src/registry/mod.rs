//! Fleet registry: the durable record of regions, nodes, allocations, units
//! and servers.
//!
//! Every component receives a registry handle explicitly (`Arc<dyn Registry>`).
//! Two backends exist:
//! - [`PgRegistry`], the production store on top of [`crate::db::Database`]
//! - [`MemoryRegistry`], used by tests and `BERTH_REGISTRY=memory` dev runs
//!
//! The registry is the only place that needs transactional discipline. The
//! allocation claim in [`Registry::claim_and_insert_server`] is a single
//! compare-and-set: exactly one of two concurrent claims on the same
//! allocation succeeds, the other gets [`RegistryError::Conflict`].

mod error;
mod memory;
mod postgres;

pub use error::RegistryError;
pub use memory::MemoryRegistry;
pub use postgres::PgRegistry;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use berth_id::{AllocationId, NodeId, RegionId, ServerId, UnitId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

// =============================================================================
// Records
// =============================================================================

/// A named group of nodes with an optional capacity limit and fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    /// Unique short identifier, e.g. `eu-west`.
    pub short_code: String,
    pub country: Option<String>,
    /// Region tried next when this one has no online node. May form a cycle.
    pub fallback_region_id: Option<RegionId>,
    /// Maximum number of servers across all member nodes.
    pub server_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRegion {
    pub name: String,
    pub short_code: String,
    pub country: Option<String>,
    pub fallback_region_id: Option<RegionId>,
    pub server_limit: Option<i64>,
}

/// A remote execution host running a daemon.
#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Shared secret sent with every daemon RPC.
    pub secret: String,
    pub is_online: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub region_id: Option<RegionId>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &"<redacted>")
            .field("is_online", &self.is_online)
            .field("last_checked_at", &self.last_checked_at)
            .field("region_id", &self.region_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub secret: String,
    pub region_id: Option<RegionId>,
}

/// A reservable (address, port) slot on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub node_id: NodeId,
    pub bind_address: String,
    pub port: u16,
    /// True iff some server references this allocation.
    pub assigned: bool,
}

/// A template describing how to provision a server's container.
///
/// Units are owned by the catalog collaborator; the control plane only reads
/// them when building daemon payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub name: String,
    pub docker_image: String,
    pub startup_command: String,
    #[serde(default)]
    pub variables: Vec<UnitVariable>,
    #[serde(default)]
    pub config_files: Vec<ConfigFileTemplate>,
    #[serde(default)]
    pub install_script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitVariable {
    pub name: String,
    pub env_variable: String,
    #[serde(default)]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFileTemplate {
    pub path: String,
    pub content: String,
}

/// Resource limits of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub memory_mib: i64,
    pub disk_mib: i64,
    pub cpu_percent: i32,
}

/// A workload instance scheduled onto a node/allocation pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub allocation_id: AllocationId,
    pub unit_id: UnitId,
    pub resources: ResourceSpec,
    pub state: ServerState,
    /// Per-server secret authenticating the telemetry channel.
    pub validation_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("user_id", &self.user_id)
            .field("node_id", &self.node_id)
            .field("allocation_id", &self.allocation_id)
            .field("unit_id", &self.unit_id)
            .field("resources", &self.resources)
            .field("state", &self.state)
            .field("validation_token", &"<redacted>")
            .finish()
    }
}

/// Input for the atomic claim-and-insert of a provisional server.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub id: ServerId,
    pub name: String,
    pub user_id: UserId,
    pub node_id: NodeId,
    pub allocation_id: AllocationId,
    pub unit_id: UnitId,
    pub resources: ResourceSpec,
    pub validation_token: String,
    /// When set, the claim re-checks this region's server limit inside the
    /// same transaction.
    pub capacity_guard: Option<RegionId>,
}

/// Fields written after a successful daemon patch.
#[derive(Debug, Clone)]
pub struct ServerUpdate {
    pub name: String,
    pub resources: ResourceSpec,
    pub unit_id: UnitId,
    pub state: ServerState,
}

// =============================================================================
// Server state machine
// =============================================================================

/// Lifecycle state of a server.
///
/// `Unknown` is what callers see when the daemon cannot be reached. It is
/// never written to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Creating,
    Installing,
    Installed,
    Running,
    #[serde(alias = "offline")]
    Stopped,
    Starting,
    Stopping,
    Restarting,
    Updating,
    Reinstalling,
    Deleting,
    InstallFailed,
    UpdateFailed,
    Errored,
    Unknown,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::Restarting => "restarting",
            Self::Updating => "updating",
            Self::Reinstalling => "reinstalling",
            Self::Deleting => "deleting",
            Self::InstallFailed => "install_failed",
            Self::UpdateFailed => "update_failed",
            Self::Errored => "errored",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this state may be written to the registry.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether this state is a terminal failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::InstallFailed | Self::UpdateFailed | Self::Errored)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "creating" => Self::Creating,
            "installing" => Self::Installing,
            "installed" => Self::Installed,
            "running" => Self::Running,
            "stopped" | "offline" => Self::Stopped,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "restarting" => Self::Restarting,
            "updating" => Self::Updating,
            "reinstalling" => Self::Reinstalling,
            "deleting" => Self::Deleting,
            "install_failed" => Self::InstallFailed,
            "update_failed" => Self::UpdateFailed,
            "errored" => Self::Errored,
            "unknown" => Self::Unknown,
            other => return Err(format!("unknown server state '{other}'")),
        })
    }
}

// =============================================================================
// Registry trait
// =============================================================================

/// Storage backend for fleet records.
#[async_trait]
pub trait Registry: Send + Sync {
    // --- regions ---------------------------------------------------------

    /// Insert a region. Duplicate short codes are a conflict.
    async fn create_region(&self, region: &NewRegion) -> RegistryResult<Region>;

    async fn get_region(&self, id: &RegionId) -> RegistryResult<Option<Region>>;

    async fn list_regions(&self) -> RegistryResult<Vec<Region>>;

    /// Point a region's fallback at another region, or clear it. Cycles
    /// longer than a self-reference are stored as given.
    async fn set_region_fallback(
        &self,
        id: &RegionId,
        fallback: Option<RegionId>,
    ) -> RegistryResult<Region>;

    /// Delete a region. Fails with a conflict while nodes still belong to it;
    /// other regions falling back to it lose their fallback.
    async fn delete_region(&self, id: &RegionId) -> RegistryResult<()>;

    /// Count servers whose node belongs to the region.
    async fn count_region_servers(&self, id: &RegionId) -> RegistryResult<i64>;

    // --- nodes -----------------------------------------------------------

    /// Insert a node. New nodes start offline until the prober reports in.
    async fn create_node(&self, node: &NewNode) -> RegistryResult<Node>;

    async fn get_node(&self, id: &NodeId) -> RegistryResult<Option<Node>>;

    async fn list_nodes(&self) -> RegistryResult<Vec<Node>>;

    /// Online nodes that are direct members of the region, in id order.
    async fn online_nodes_in_region(&self, id: &RegionId) -> RegistryResult<Vec<Node>>;

    /// Record a liveness observation and stamp `last_checked_at`.
    async fn set_node_online(&self, id: &NodeId, online: bool) -> RegistryResult<Node>;

    /// Delete a node and its allocations. Fails while servers live on it.
    async fn delete_node(&self, id: &NodeId) -> RegistryResult<()>;

    // --- allocations -----------------------------------------------------

    /// Create one allocation per port. Any duplicate fails the whole batch.
    async fn create_allocations(
        &self,
        node_id: &NodeId,
        bind_address: &str,
        ports: &[u16],
    ) -> RegistryResult<Vec<Allocation>>;

    async fn get_allocation(&self, id: &AllocationId) -> RegistryResult<Option<Allocation>>;

    /// Allocations of a node ordered by port.
    async fn list_allocations(&self, node_id: &NodeId) -> RegistryResult<Vec<Allocation>>;

    /// Lowest-port unassigned allocation of a node.
    async fn first_free_allocation(&self, node_id: &NodeId) -> RegistryResult<Option<Allocation>>;

    /// Delete an unassigned allocation.
    async fn delete_allocation(&self, id: &AllocationId) -> RegistryResult<()>;

    // --- units -----------------------------------------------------------

    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()>;

    async fn get_unit(&self, id: &UnitId) -> RegistryResult<Option<Unit>>;

    // --- servers ---------------------------------------------------------

    /// Atomically mark the allocation assigned and insert a server in state
    /// `creating`. The claim fails with a conflict if the allocation is not
    /// free or does not belong to the node.
    async fn claim_and_insert_server(&self, server: &NewServer) -> RegistryResult<Server>;

    /// Undo a claim: delete the provisional row and free its allocation.
    async fn discard_provisional_server(&self, id: &ServerId) -> RegistryResult<()>;

    async fn get_server(&self, id: &ServerId) -> RegistryResult<Option<Server>>;

    async fn list_servers(&self) -> RegistryResult<Vec<Server>>;

    async fn set_server_state(&self, id: &ServerId, state: ServerState) -> RegistryResult<()>;

    async fn apply_server_update(
        &self,
        id: &ServerId,
        update: &ServerUpdate,
    ) -> RegistryResult<Server>;

    /// Delete a server and free its allocation in one step. Returns false if
    /// the server did not exist.
    async fn remove_server(&self, id: &ServerId) -> RegistryResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_roundtrip() {
        let states = [
            ServerState::Creating,
            ServerState::Installing,
            ServerState::Installed,
            ServerState::Running,
            ServerState::Stopped,
            ServerState::Starting,
            ServerState::Stopping,
            ServerState::Restarting,
            ServerState::Updating,
            ServerState::Reinstalling,
            ServerState::Deleting,
            ServerState::InstallFailed,
            ServerState::UpdateFailed,
            ServerState::Errored,
            ServerState::Unknown,
        ];
        for state in states {
            assert_eq!(state.as_str().parse::<ServerState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }

    #[test]
    fn test_offline_is_stopped() {
        assert_eq!("offline".parse::<ServerState>().unwrap(), ServerState::Stopped);
        let parsed: ServerState = serde_json::from_str("\"offline\"").unwrap();
        assert_eq!(parsed, ServerState::Stopped);
    }

    #[test]
    fn test_unknown_is_not_persistable() {
        assert!(!ServerState::Unknown.is_persistable());
        assert!(ServerState::Stopping.is_persistable());
        assert!(ServerState::InstallFailed.is_failure());
    }

    #[test]
    fn test_node_debug_redacts_secret() {
        let node = Node {
            id: NodeId::new(),
            name: "n1".into(),
            host: "10.0.0.1".into(),
            port: 8443,
            secret: "hunter2".into(),
            is_online: true,
            last_checked_at: None,
            region_id: None,
            created_at: Utc::now(),
        };
        let rendered = format!("{node:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
