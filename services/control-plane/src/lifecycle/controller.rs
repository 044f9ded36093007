//! Orchestration of server operations over planner, registry and daemon.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_id::{NodeId, ServerId, UnitId, UserId};
use futures_util::future::join_all;
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::token::{generate_validation_token, tokens_match};
use crate::daemon::{
    AllocationBinding, CargoItem, CreateServerRequest, DaemonApi, PatchServerRequest, PowerAction,
    ServerStatus,
};
use crate::error::{FleetError, FleetResult};
use crate::placement::{PlacementRequest, PlacementTarget, Planner};
use crate::registry::{
    Allocation, NewServer, Node, Registry, ResourceSpec, Server, ServerState, ServerUpdate, Unit,
};

/// Input for [`FleetController::create_server`].
#[derive(Debug, Clone)]
pub struct CreateServer {
    pub name: String,
    pub user_id: UserId,
    pub unit_id: UnitId,
    pub resources: ResourceSpec,
    pub target: PlacementTarget,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateServer {
    pub name: Option<String>,
    pub memory_mib: Option<i64>,
    pub disk_mib: Option<i64>,
    pub cpu_percent: Option<i32>,
    pub unit_id: Option<UnitId>,
}

/// A server as seen after an authoritative read.
#[derive(Debug, Clone)]
pub struct ServerView {
    /// Registry record with `state` replaced by the daemon's answer, or
    /// `Unknown` if the daemon could not be reached.
    pub server: Server,
    pub status: Option<ServerStatus>,
}

/// Everything a console session needs to reach the daemon.
#[derive(Debug, Clone)]
pub struct ConsoleTarget {
    pub server: Server,
    pub node: Node,
}

/// Owns the server state machine.
#[derive(Clone)]
pub struct FleetController {
    registry: Arc<dyn Registry>,
    planner: Planner,
    daemon: Arc<dyn DaemonApi>,
}

impl FleetController {
    pub fn new(registry: Arc<dyn Registry>, daemon: Arc<dyn DaemonApi>) -> Self {
        Self {
            planner: Planner::new(registry.clone()),
            registry,
            daemon,
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Place, claim and provision a new server.
    ///
    /// Any daemon failure rolls back the claim: the provisional row is removed
    /// and the allocation freed before the error is returned.
    ///
    /// Runs on its own task, so a dropped caller never strands a claimed
    /// allocation.
    #[instrument(skip(self, input), fields(name = %input.name, user_id = %input.user_id))]
    pub async fn create_server(&self, input: CreateServer) -> FleetResult<Server> {
        let this = self.clone();
        detach(async move { this.provision(input).await }).await
    }

    async fn provision(&self, input: CreateServer) -> FleetResult<Server> {
        validate_name(&input.name)?;
        validate_resources(&input.resources)?;

        let request = PlacementRequest::from_target(input.target, input.resources)?;
        let unit = self.require_unit(&input.unit_id).await?;
        let placement = self.planner.resolve(&request).await?;
        let allocation = self
            .registry
            .get_allocation(&placement.allocation_id)
            .await?
            .ok_or_else(|| FleetError::not_found("allocation", placement.allocation_id))?;

        let server = self
            .registry
            .claim_and_insert_server(&NewServer {
                id: ServerId::new(),
                name: input.name.trim().to_string(),
                user_id: input.user_id,
                node_id: placement.node.id,
                allocation_id: allocation.id,
                unit_id: unit.id,
                resources: input.resources,
                validation_token: generate_validation_token(),
                capacity_guard: placement.capacity_guard,
            })
            .await?;

        debug!(
            server_id = %server.id,
            node_id = %placement.node.id,
            allocation_id = %allocation.id,
            "Claimed allocation"
        );

        let payload = create_payload(&server, &unit, &allocation);
        if let Err(e) = self.daemon.create_server(&placement.node, &payload).await {
            warn!(server_id = %server.id, error = %e, "Daemon create failed, rolling back");
            if let Err(rollback) = self.registry.discard_provisional_server(&server.id).await {
                error!(
                    server_id = %server.id,
                    error = %rollback,
                    "Failed to roll back provisional server"
                );
            }
            return Err(e.into());
        }

        self.registry
            .set_server_state(&server.id, ServerState::Installing)
            .await?;

        info!(server_id = %server.id, node_id = %server.node_id, "Server created");
        Ok(Server {
            state: ServerState::Installing,
            ..server
        })
    }

    /// Patch name, limits or unit. A unit change makes the daemon reinstall.
    #[instrument(skip(self, update))]
    pub async fn update_server(&self, id: &ServerId, update: UpdateServer) -> FleetResult<Server> {
        let server = self.require_server(id).await?;
        let node = self.require_node(&server.node_id).await?;

        let name = match update.name {
            Some(name) => {
                validate_name(&name)?;
                name.trim().to_string()
            }
            None => server.name.clone(),
        };
        let resources = ResourceSpec {
            memory_mib: update.memory_mib.unwrap_or(server.resources.memory_mib),
            disk_mib: update.disk_mib.unwrap_or(server.resources.disk_mib),
            cpu_percent: update.cpu_percent.unwrap_or(server.resources.cpu_percent),
        };
        validate_resources(&resources)?;

        let (unit_id, docker_image) = match update.unit_id {
            Some(unit_id) if unit_id != server.unit_id => {
                let unit = self.require_unit(&unit_id).await?;
                (unit.id, Some(unit.docker_image))
            }
            _ => (server.unit_id, None),
        };

        self.registry
            .set_server_state(id, ServerState::Updating)
            .await?;

        let patch = PatchServerRequest {
            name: name.clone(),
            memory_mib: resources.memory_mib,
            disk_mib: resources.disk_mib,
            cpu_percent: resources.cpu_percent,
            unit_changed: docker_image.is_some(),
            docker_image,
        };
        self.daemon.patch_server(&node, id, &patch).await?;

        let updated = self
            .registry
            .apply_server_update(
                id,
                &ServerUpdate {
                    name,
                    resources,
                    unit_id,
                    state: ServerState::Running,
                },
            )
            .await?;

        info!(server_id = %id, unit_changed = patch.unit_changed, "Server updated");
        Ok(updated)
    }

    /// Record the transitional state, send the power action, then resync once.
    #[instrument(skip(self))]
    pub async fn power(&self, id: &ServerId, action: PowerAction) -> FleetResult<Server> {
        let mut server = self.require_server(id).await?;
        let node = self.require_node(&server.node_id).await?;

        let transitional = action.transitional_state();
        self.registry.set_server_state(id, transitional).await?;
        server.state = transitional;

        self.daemon.power_action(&node, id, action).await?;

        match self.daemon.get_server_status(&node, id).await {
            Ok(status) if status.state.is_persistable() => {
                self.registry.set_server_state(id, status.state).await?;
                server.state = status.state;
            }
            Ok(_) => {
                debug!(server_id = %id, "Daemon reported unknown state after power action");
            }
            Err(e) => {
                warn!(server_id = %id, error = %e, "Resync after power action failed");
            }
        }

        info!(server_id = %id, action = %action, state = %server.state, "Power action sent");
        Ok(server)
    }

    /// Remove a server. The daemon call is best effort; the registry always
    /// converges, even if the caller goes away mid-call. Deleting an absent
    /// server succeeds.
    #[instrument(skip(self))]
    pub async fn delete_server(&self, id: &ServerId) -> FleetResult<()> {
        let this = self.clone();
        let id = *id;
        detach(async move { this.decommission(&id).await }).await
    }

    async fn decommission(&self, id: &ServerId) -> FleetResult<()> {
        let Some(server) = self.registry.get_server(id).await? else {
            debug!(server_id = %id, "Server already gone");
            return Ok(());
        };

        if let Err(e) = self
            .registry
            .set_server_state(id, ServerState::Deleting)
            .await
        {
            warn!(server_id = %id, error = %e, "Failed to mark server deleting");
        }

        match self.registry.get_node(&server.node_id).await {
            Ok(Some(node)) => {
                if let Err(e) = self.daemon.delete_server(&node, id).await {
                    warn!(server_id = %id, node_id = %node.id, error = %e, "Daemon delete failed");
                }
            }
            Ok(None) => {
                warn!(server_id = %id, node_id = %server.node_id, "Node missing, skipping daemon delete");
            }
            Err(e) => {
                warn!(server_id = %id, error = %e, "Node lookup failed, skipping daemon delete");
            }
        }

        self.registry.remove_server(id).await?;
        info!(server_id = %id, "Server deleted");
        Ok(())
    }

    /// Ask the daemon to reinstall. No rollback; the daemon reports the
    /// outcome on the next read.
    #[instrument(skip(self))]
    pub async fn reinstall_server(&self, id: &ServerId) -> FleetResult<Server> {
        let mut server = self.require_server(id).await?;
        let node = self.require_node(&server.node_id).await?;

        self.registry
            .set_server_state(id, ServerState::Reinstalling)
            .await?;
        server.state = ServerState::Reinstalling;

        self.daemon.reinstall_server(&node, id).await?;
        info!(server_id = %id, "Reinstall requested");
        Ok(server)
    }

    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn ship_cargo(&self, id: &ServerId, items: &[CargoItem]) -> FleetResult<()> {
        if items.is_empty() {
            return Err(FleetError::validation("cargo list is empty"));
        }
        for item in items {
            if item.url.trim().is_empty() || item.target_path.trim().is_empty() {
                return Err(FleetError::validation(format!(
                    "cargo item '{}' needs a url and a target path",
                    item.id
                )));
            }
        }

        let server = self.require_server(id).await?;
        let node = self.require_node(&server.node_id).await?;
        self.daemon.ship_cargo(&node, id, items).await?;
        Ok(())
    }

    /// Read a server and resync its state from the daemon.
    pub async fn get_server(&self, id: &ServerId) -> FleetResult<ServerView> {
        let server = self.require_server(id).await?;
        self.resync(server).await
    }

    /// Read every server, resyncing them concurrently.
    pub async fn list_servers(&self) -> FleetResult<Vec<ServerView>> {
        let servers = self.registry.list_servers().await?;
        join_all(servers.into_iter().map(|server| self.resync(server)))
            .await
            .into_iter()
            .collect()
    }

    /// Check a viewer's token and resolve what the relay connects to.
    pub async fn authorize_console(&self, id: &ServerId, token: &str) -> FleetResult<ConsoleTarget> {
        let server = self.require_server(id).await?;
        if !tokens_match(&server.validation_token, token) {
            warn!(server_id = %id, "Rejected console token");
            return Err(FleetError::Auth("invalid validation token".into()));
        }

        let node = self.require_node(&server.node_id).await?;
        let view = self.resync(server).await?;
        Ok(ConsoleTarget {
            server: view.server,
            node,
        })
    }

    /// Overwrite the persisted state with the daemon's answer. An unreachable
    /// daemon yields `Unknown` for the caller only.
    async fn resync(&self, mut server: Server) -> FleetResult<ServerView> {
        let Some(node) = self.registry.get_node(&server.node_id).await? else {
            warn!(server_id = %server.id, node_id = %server.node_id, "Server references missing node");
            server.state = ServerState::Unknown;
            return Ok(ServerView {
                server,
                status: None,
            });
        };

        match self.daemon.get_server_status(&node, &server.id).await {
            Ok(status) => {
                if status.state.is_persistable() && status.state != server.state {
                    debug!(
                        server_id = %server.id,
                        from = %server.state,
                        to = %status.state,
                        "Resynced server state"
                    );
                    self.registry
                        .set_server_state(&server.id, status.state)
                        .await?;
                }
                server.state = status.state;
                Ok(ServerView {
                    server,
                    status: Some(status),
                })
            }
            Err(e) => {
                warn!(server_id = %server.id, error = %e, "Daemon unreachable during resync");
                server.state = ServerState::Unknown;
                Ok(ServerView {
                    server,
                    status: None,
                })
            }
        }
    }

    async fn require_server(&self, id: &ServerId) -> FleetResult<Server> {
        self.registry
            .get_server(id)
            .await?
            .ok_or_else(|| FleetError::not_found("server", id))
    }

    async fn require_node(&self, id: &NodeId) -> FleetResult<Node> {
        self.registry
            .get_node(id)
            .await?
            .ok_or_else(|| FleetError::not_found("node", id))
    }

    async fn require_unit(&self, id: &UnitId) -> FleetResult<Unit> {
        self.registry
            .get_unit(id)
            .await?
            .ok_or_else(|| FleetError::not_found("unit", id))
    }
}

fn validate_name(name: &str) -> FleetResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FleetError::validation("server name is required"));
    }
    if name.len() > 191 {
        return Err(FleetError::validation(
            "server name must be at most 191 characters",
        ));
    }
    Ok(())
}

fn validate_resources(resources: &ResourceSpec) -> FleetResult<()> {
    if resources.memory_mib <= 0 {
        return Err(FleetError::validation("memory_mib must be positive"));
    }
    if resources.disk_mib <= 0 {
        return Err(FleetError::validation("disk_mib must be positive"));
    }
    if resources.cpu_percent <= 0 {
        return Err(FleetError::validation("cpu_percent must be positive"));
    }
    Ok(())
}

/// Run `fut` to completion on its own task and wait for it.
async fn detach<T, F>(fut: F) -> FleetResult<T>
where
    F: std::future::Future<Output = FleetResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut.in_current_span())
        .await
        .map_err(|e| FleetError::Internal(format!("server task failed: {e}")))?
}

fn create_payload(server: &Server, unit: &Unit, allocation: &Allocation) -> CreateServerRequest {
    let environment: BTreeMap<String, String> = unit
        .variables
        .iter()
        .map(|v| {
            (
                v.env_variable.clone(),
                v.default_value.clone().unwrap_or_default(),
            )
        })
        .collect();

    CreateServerRequest {
        id: server.id,
        validation_token: server.validation_token.clone(),
        name: server.name.clone(),
        memory_mib: server.resources.memory_mib,
        disk_mib: server.resources.disk_mib,
        cpu_percent: server.resources.cpu_percent,
        allocation: AllocationBinding {
            bind_address: allocation.bind_address.clone(),
            port: allocation.port,
        },
        docker_image: unit.docker_image.clone(),
        startup_command: unit.startup_command.clone(),
        environment,
        config_files: unit.config_files.clone(),
        install_script: unit.install_script.clone(),
    }
}
