//! Daemon client: typed RPC to the agent running on each node.
//!
//! Every call is authenticated with the node's shared secret and bounded by a
//! fixed timeout. The client never retries; retry and rollback policy lives in
//! the lifecycle controller.

mod client;
mod error;

pub use client::{DaemonClientConfig, HttpDaemonClient, DEFAULT_DAEMON_TIMEOUT};
pub use error::{DaemonError, DaemonResult};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use berth_id::ServerId;
use serde::{Deserialize, Serialize};

use crate::registry::{ConfigFileTemplate, Node, ServerState};

/// RPC surface of a node daemon.
///
/// Implementations must be cheap to share across tasks; the controller holds
/// one behind an `Arc`.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    async fn create_server(&self, node: &Node, request: &CreateServerRequest) -> DaemonResult<()>;

    async fn patch_server(
        &self,
        node: &Node,
        server_id: &ServerId,
        request: &PatchServerRequest,
    ) -> DaemonResult<()>;

    async fn delete_server(&self, node: &Node, server_id: &ServerId) -> DaemonResult<()>;

    async fn power_action(
        &self,
        node: &Node,
        server_id: &ServerId,
        action: PowerAction,
    ) -> DaemonResult<()>;

    async fn reinstall_server(&self, node: &Node, server_id: &ServerId) -> DaemonResult<()>;

    async fn ship_cargo(
        &self,
        node: &Node,
        server_id: &ServerId,
        items: &[CargoItem],
    ) -> DaemonResult<()>;

    async fn get_server_status(&self, node: &Node, server_id: &ServerId)
        -> DaemonResult<ServerStatus>;
}

// =============================================================================
// Payloads
// =============================================================================

/// Address the daemon binds the server to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationBinding {
    pub bind_address: String,
    pub port: u16,
}

/// Body of `POST /servers`.
#[derive(Clone, Serialize)]
pub struct CreateServerRequest {
    pub id: ServerId,
    pub validation_token: String,
    pub name: String,
    pub memory_mib: i64,
    pub disk_mib: i64,
    pub cpu_percent: i32,
    pub allocation: AllocationBinding,
    pub docker_image: String,
    pub startup_command: String,
    /// Environment variables resolved from the unit's variable schema.
    pub environment: BTreeMap<String, String>,
    pub config_files: Vec<ConfigFileTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_script: Option<String>,
}

impl fmt::Debug for CreateServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateServerRequest")
            .field("id", &self.id)
            .field("validation_token", &"<redacted>")
            .field("name", &self.name)
            .field("memory_mib", &self.memory_mib)
            .field("disk_mib", &self.disk_mib)
            .field("cpu_percent", &self.cpu_percent)
            .field("allocation", &self.allocation)
            .field("docker_image", &self.docker_image)
            .finish()
    }
}

/// Body of `PATCH /servers/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchServerRequest {
    pub name: String,
    pub memory_mib: i64,
    pub disk_mib: i64,
    pub cpu_percent: i32,
    /// Set when the unit changed; the daemon reinstalls with `docker_image`.
    pub unit_changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
}

/// Power verbs accepted by `POST /servers/{id}/power/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    /// State recorded while the action is in flight.
    pub fn transitional_state(&self) -> ServerState {
        match self {
            Self::Start => ServerState::Starting,
            Self::Stop => ServerState::Stopping,
            Self::Restart => ServerState::Restarting,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(format!("unknown power action '{other}'")),
        }
    }
}

/// One file shipped to a server's filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CargoItem {
    pub id: String,
    pub url: String,
    pub target_path: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// Memory usage in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryUsage {
    pub used: u64,
    pub limit: u64,
    pub percent: f64,
}

/// Cumulative network counters in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkUsage {
    #[serde(alias = "rxBytes")]
    pub rx_bytes: u64,
    #[serde(alias = "txBytes")]
    pub tx_bytes: u64,
}

/// Response of `GET /servers/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub state: ServerState,
    #[serde(default, alias = "cpuPercent")]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory: MemoryUsage,
    #[serde(default)]
    pub network: NetworkUsage,
    #[serde(default)]
    pub allocation: Option<AllocationBinding>,
}
