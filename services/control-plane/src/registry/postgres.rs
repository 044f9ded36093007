//! PostgreSQL registry.
//!
//! The allocation claim runs as a conditional `UPDATE ... WHERE assigned =
//! FALSE` inside the same transaction that inserts the provisional server.
//! `servers.allocation_id` carries a UNIQUE constraint as a second line.

use std::str::FromStr;

use async_trait::async_trait;
use berth_id::{AllocationId, IdError, NodeId, RegionId, ServerId, UnitId};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{
    Allocation, ConfigFileTemplate, NewNode, NewRegion, NewServer, Node, Region, Registry,
    RegistryError, RegistryResult, ResourceSpec, Server, ServerState, ServerUpdate, Unit,
    UnitVariable,
};
use crate::db::Database;

const REGION_COLUMNS: &str =
    "id, name, short_code, country, fallback_region_id, server_limit, created_at";
const NODE_COLUMNS: &str =
    "id, name, host, port, secret, is_online, last_checked_at, region_id, created_at";
const ALLOCATION_COLUMNS: &str = "id, node_id, bind_address, port, assigned";
const UNIT_COLUMNS: &str =
    "id, name, docker_image, startup_command, variables, config_files, install_script";
const SERVER_COLUMNS: &str = "id, name, user_id, node_id, allocation_id, unit_id, memory_mib, \
     disk_mib, cpu_percent, state, validation_token, created_at, updated_at";

/// Postgres-backed registry.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Registry for PgRegistry {
    async fn create_region(&self, region: &NewRegion) -> RegistryResult<Region> {
        let sql = format!(
            "INSERT INTO regions (id, name, short_code, country, fallback_region_id, server_limit) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {REGION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RegionRow>(&sql)
            .bind(RegionId::new().to_string())
            .bind(&region.name)
            .bind(&region.short_code)
            .bind(&region.country)
            .bind(region.fallback_region_id.map(|id| id.to_string()))
            .bind(region.server_limit)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                classify(e, || {
                    format!("region short code '{}' already exists", region.short_code)
                })
            })?;
        row.try_into()
    }

    async fn get_region(&self, id: &RegionId) -> RegistryResult<Option<Region>> {
        let sql = format!("SELECT {REGION_COLUMNS} FROM regions WHERE id = $1");
        sqlx::query_as::<_, RegionRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Region::try_from)
            .transpose()
    }

    async fn list_regions(&self) -> RegistryResult<Vec<Region>> {
        let sql = format!("SELECT {REGION_COLUMNS} FROM regions ORDER BY id");
        sqlx::query_as::<_, RegionRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Region::try_from)
            .collect()
    }

    async fn set_region_fallback(
        &self,
        id: &RegionId,
        fallback: Option<RegionId>,
    ) -> RegistryResult<Region> {
        if let Some(fallback) = &fallback {
            if self.get_region(fallback).await?.is_none() {
                return Err(RegistryError::not_found("region", fallback));
            }
        }

        let sql = format!(
            "UPDATE regions SET fallback_region_id = $2 WHERE id = $1 RETURNING {REGION_COLUMNS}"
        );
        sqlx::query_as::<_, RegionRow>(&sql)
            .bind(id.to_string())
            .bind(fallback.map(|f| f.to_string()))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, || format!("region {id} fallback rejected")))?
            .ok_or_else(|| RegistryError::not_found("region", id))?
            .try_into()
    }

    async fn delete_region(&self, id: &RegionId) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;

        let members: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::BIGINT FROM nodes WHERE region_id = $1")
                .bind(id.to_string())
                .fetch_one(&mut *tx)
                .await?;
        if members > 0 {
            return Err(RegistryError::Conflict(format!(
                "region {id} still has member nodes"
            )));
        }

        let deleted = sqlx::query("DELETE FROM regions WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(RegistryError::not_found("region", id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_region_servers(&self, id: &RegionId) -> RegistryResult<i64> {
        Ok(sqlx::query_scalar(COUNT_REGION_SERVERS)
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?)
    }

    async fn create_node(&self, node: &NewNode) -> RegistryResult<Node> {
        let sql = format!(
            "INSERT INTO nodes (id, name, host, port, secret, region_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {NODE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, NodeRow>(&sql)
            .bind(NodeId::new().to_string())
            .bind(&node.name)
            .bind(&node.host)
            .bind(i32::from(node.port))
            .bind(&node.secret)
            .bind(node.region_id.map(|id| id.to_string()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(e, || format!("node '{}' conflicts", node.name)))?;
        row.try_into()
    }

    async fn get_node(&self, id: &NodeId) -> RegistryResult<Option<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1");
        sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Node::try_from)
            .transpose()
    }

    async fn list_nodes(&self) -> RegistryResult<Vec<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id");
        sqlx::query_as::<_, NodeRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Node::try_from)
            .collect()
    }

    async fn online_nodes_in_region(&self, id: &RegionId) -> RegistryResult<Vec<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE region_id = $1 AND is_online ORDER BY id"
        );
        sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Node::try_from)
            .collect()
    }

    async fn set_node_online(&self, id: &NodeId, online: bool) -> RegistryResult<Node> {
        let sql = format!(
            "UPDATE nodes SET is_online = $2, last_checked_at = NOW() WHERE id = $1 \
             RETURNING {NODE_COLUMNS}"
        );
        sqlx::query_as::<_, NodeRow>(&sql)
            .bind(id.to_string())
            .bind(online)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RegistryError::not_found("node", id))?
            .try_into()
    }

    async fn delete_node(&self, id: &NodeId) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;

        let hosted: i64 =
            sqlx::query_scalar("SELECT COUNT(*)::BIGINT FROM servers WHERE node_id = $1")
                .bind(id.to_string())
                .fetch_one(&mut *tx)
                .await?;
        if hosted > 0 {
            return Err(RegistryError::Conflict(format!(
                "node {id} still hosts servers"
            )));
        }

        let deleted = sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(RegistryError::not_found("node", id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_allocations(
        &self,
        node_id: &NodeId,
        bind_address: &str,
        ports: &[u16],
    ) -> RegistryResult<Vec<Allocation>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO allocations (id, node_id, bind_address, port) \
             VALUES ($1, $2, $3, $4) RETURNING {ALLOCATION_COLUMNS}"
        );

        let mut created = Vec::with_capacity(ports.len());
        for port in ports {
            let row = sqlx::query_as::<_, AllocationRow>(&sql)
                .bind(AllocationId::new().to_string())
                .bind(node_id.to_string())
                .bind(bind_address)
                .bind(i32::from(*port))
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| match e {
                    sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                        RegistryError::not_found("node", node_id)
                    }
                    other => classify(other, || {
                        format!("allocation {bind_address}:{port} already exists on node {node_id}")
                    }),
                })?;
            created.push(Allocation::try_from(row)?);
        }

        tx.commit().await?;
        debug!(node_id = %node_id, count = created.len(), "Created allocations");
        Ok(created)
    }

    async fn get_allocation(&self, id: &AllocationId) -> RegistryResult<Option<Allocation>> {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = $1");
        sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Allocation::try_from)
            .transpose()
    }

    async fn list_allocations(&self, node_id: &NodeId) -> RegistryResult<Vec<Allocation>> {
        let sql = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE node_id = $1 \
             ORDER BY port, bind_address, id"
        );
        sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(node_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Allocation::try_from)
            .collect()
    }

    async fn first_free_allocation(&self, node_id: &NodeId) -> RegistryResult<Option<Allocation>> {
        let sql = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations \
             WHERE node_id = $1 AND NOT assigned \
             ORDER BY port, bind_address, id LIMIT 1"
        );
        sqlx::query_as::<_, AllocationRow>(&sql)
            .bind(node_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Allocation::try_from)
            .transpose()
    }

    async fn delete_allocation(&self, id: &AllocationId) -> RegistryResult<()> {
        let deleted = sqlx::query("DELETE FROM allocations WHERE id = $1 AND NOT assigned")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_allocation(id).await? {
            Some(_) => Err(RegistryError::Conflict(format!(
                "allocation {id} is assigned to a server"
            ))),
            None => Err(RegistryError::not_found("allocation", id)),
        }
    }

    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        sqlx::query(
            "INSERT INTO units (id, name, docker_image, startup_command, variables, config_files, install_script) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(unit.id.to_string())
        .bind(&unit.name)
        .bind(&unit.docker_image)
        .bind(&unit.startup_command)
        .bind(Json(&unit.variables))
        .bind(Json(&unit.config_files))
        .bind(&unit.install_script)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, || format!("unit {} already exists", unit.id)))?;
        Ok(())
    }

    async fn get_unit(&self, id: &UnitId) -> RegistryResult<Option<Unit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = $1");
        sqlx::query_as::<_, UnitRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Unit::try_from)
            .transpose()
    }

    async fn claim_and_insert_server(&self, server: &NewServer) -> RegistryResult<Server> {
        let mut tx = self.pool.begin().await?;

        if let Some(region_id) = &server.capacity_guard {
            // Row lock serializes claims into the same region.
            let limit: Option<Option<i64>> =
                sqlx::query_scalar("SELECT server_limit FROM regions WHERE id = $1 FOR UPDATE")
                    .bind(region_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(limit) = limit else {
                return Err(RegistryError::not_found("region", region_id));
            };
            if let Some(limit) = limit {
                let current: i64 = sqlx::query_scalar(COUNT_REGION_SERVERS)
                    .bind(region_id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                if current >= limit {
                    return Err(RegistryError::RegionFull {
                        region_id: region_id.to_string(),
                        limit,
                        current,
                    });
                }
            }
        }

        let claimed = sqlx::query(
            "UPDATE allocations SET assigned = TRUE \
             WHERE id = $1 AND node_id = $2 AND NOT assigned",
        )
        .bind(server.allocation_id.to_string())
        .bind(server.node_id.to_string())
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() != 1 {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT node_id FROM allocations WHERE id = $1")
                    .bind(server.allocation_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match owner {
                None => RegistryError::not_found("allocation", server.allocation_id),
                Some(owner) if owner != server.node_id.to_string() => {
                    RegistryError::Conflict(format!(
                        "allocation {} does not belong to node {}",
                        server.allocation_id, server.node_id
                    ))
                }
                Some(_) => RegistryError::Conflict(format!(
                    "allocation {} is already assigned",
                    server.allocation_id
                )),
            });
        }

        let sql = format!(
            "INSERT INTO servers (id, name, user_id, node_id, allocation_id, unit_id, \
             memory_mib, disk_mib, cpu_percent, state, validation_token) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {SERVER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ServerRow>(&sql)
            .bind(server.id.to_string())
            .bind(&server.name)
            .bind(server.user_id.to_string())
            .bind(server.node_id.to_string())
            .bind(server.allocation_id.to_string())
            .bind(server.unit_id.to_string())
            .bind(server.resources.memory_mib)
            .bind(server.resources.disk_mib)
            .bind(server.resources.cpu_percent)
            .bind(ServerState::Creating.as_str())
            .bind(&server.validation_token)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                classify(e, || {
                    format!("allocation {} is already referenced", server.allocation_id)
                })
            })?;

        tx.commit().await?;
        row.try_into()
    }

    async fn discard_provisional_server(&self, id: &ServerId) -> RegistryResult<()> {
        self.remove_server(id).await.map(|_| ())
    }

    async fn get_server(&self, id: &ServerId) -> RegistryResult<Option<Server>> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1");
        sqlx::query_as::<_, ServerRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Server::try_from)
            .transpose()
    }

    async fn list_servers(&self) -> RegistryResult<Vec<Server>> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM servers ORDER BY id");
        sqlx::query_as::<_, ServerRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Server::try_from)
            .collect()
    }

    async fn set_server_state(&self, id: &ServerId, state: ServerState) -> RegistryResult<()> {
        let updated =
            sqlx::query("UPDATE servers SET state = $2, updated_at = NOW() WHERE id = $1")
                .bind(id.to_string())
                .bind(state.as_str())
                .execute(&self.pool)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(RegistryError::not_found("server", id));
        }
        Ok(())
    }

    async fn apply_server_update(
        &self,
        id: &ServerId,
        update: &ServerUpdate,
    ) -> RegistryResult<Server> {
        let sql = format!(
            "UPDATE servers SET name = $2, memory_mib = $3, disk_mib = $4, cpu_percent = $5, \
             unit_id = $6, state = $7, updated_at = NOW() WHERE id = $1 RETURNING {SERVER_COLUMNS}"
        );
        sqlx::query_as::<_, ServerRow>(&sql)
            .bind(id.to_string())
            .bind(&update.name)
            .bind(update.resources.memory_mib)
            .bind(update.resources.disk_mib)
            .bind(update.resources.cpu_percent)
            .bind(update.unit_id.to_string())
            .bind(update.state.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RegistryError::not_found("server", id))?
            .try_into()
    }

    async fn remove_server(&self, id: &ServerId) -> RegistryResult<bool> {
        let mut tx = self.pool.begin().await?;

        let allocation_id: Option<String> =
            sqlx::query_scalar("DELETE FROM servers WHERE id = $1 RETURNING allocation_id")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let Some(allocation_id) = allocation_id else {
            return Ok(false);
        };

        sqlx::query("UPDATE allocations SET assigned = FALSE WHERE id = $1")
            .bind(&allocation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

const COUNT_REGION_SERVERS: &str = "SELECT COUNT(*)::BIGINT FROM servers s \
     JOIN nodes n ON n.id = s.node_id WHERE n.region_id = $1";

/// Map unique violations to conflicts; everything else stays a query error.
fn classify(err: sqlx::Error, conflict: impl FnOnce() -> String) -> RegistryError {
    match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            RegistryError::Conflict(conflict())
        }
        sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
            RegistryError::Conflict(db.message().to_string())
        }
        other => RegistryError::Query(other),
    }
}

fn parse_id<T>(entity: &'static str, raw: &str) -> RegistryResult<T>
where
    T: FromStr<Err = IdError>,
{
    raw.parse()
        .map_err(|e: IdError| RegistryError::corrupt(entity, format!("bad id '{raw}': {e}")))
}

fn parse_port(entity: &'static str, raw: i32) -> RegistryResult<u16> {
    u16::try_from(raw).map_err(|_| RegistryError::corrupt(entity, format!("bad port {raw}")))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug)]
struct RegionRow {
    id: String,
    name: String,
    short_code: String,
    country: Option<String>,
    fallback_region_id: Option<String>,
    server_limit: Option<i64>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RegionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            short_code: row.try_get("short_code")?,
            country: row.try_get("country")?,
            fallback_region_id: row.try_get("fallback_region_id")?,
            server_limit: row.try_get("server_limit")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<RegionRow> for Region {
    type Error = RegistryError;

    fn try_from(row: RegionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("region", &row.id)?,
            name: row.name,
            short_code: row.short_code,
            country: row.country,
            fallback_region_id: row
                .fallback_region_id
                .as_deref()
                .map(|raw| parse_id("region", raw))
                .transpose()?,
            server_limit: row.server_limit,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct NodeRow {
    id: String,
    name: String,
    host: String,
    port: i32,
    secret: String,
    is_online: bool,
    last_checked_at: Option<DateTime<Utc>>,
    region_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            secret: row.try_get("secret")?,
            is_online: row.try_get("is_online")?,
            last_checked_at: row.try_get("last_checked_at")?,
            region_id: row.try_get("region_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = RegistryError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("node", &row.id)?,
            name: row.name,
            host: row.host,
            port: parse_port("node", row.port)?,
            secret: row.secret,
            is_online: row.is_online,
            last_checked_at: row.last_checked_at,
            region_id: row
                .region_id
                .as_deref()
                .map(|raw| parse_id("node", raw))
                .transpose()?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct AllocationRow {
    id: String,
    node_id: String,
    bind_address: String,
    port: i32,
    assigned: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AllocationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            bind_address: row.try_get("bind_address")?,
            port: row.try_get("port")?,
            assigned: row.try_get("assigned")?,
        })
    }
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = RegistryError;

    fn try_from(row: AllocationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("allocation", &row.id)?,
            node_id: parse_id("allocation", &row.node_id)?,
            bind_address: row.bind_address,
            port: parse_port("allocation", row.port)?,
            assigned: row.assigned,
        })
    }
}

struct UnitRow {
    id: String,
    name: String,
    docker_image: String,
    startup_command: String,
    variables: Json<Vec<UnitVariable>>,
    config_files: Json<Vec<ConfigFileTemplate>>,
    install_script: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for UnitRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            docker_image: row.try_get("docker_image")?,
            startup_command: row.try_get("startup_command")?,
            variables: row.try_get("variables")?,
            config_files: row.try_get("config_files")?,
            install_script: row.try_get("install_script")?,
        })
    }
}

impl TryFrom<UnitRow> for Unit {
    type Error = RegistryError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("unit", &row.id)?,
            name: row.name,
            docker_image: row.docker_image,
            startup_command: row.startup_command,
            variables: row.variables.0,
            config_files: row.config_files.0,
            install_script: row.install_script,
        })
    }
}

#[derive(Debug)]
struct ServerRow {
    id: String,
    name: String,
    user_id: String,
    node_id: String,
    allocation_id: String,
    unit_id: String,
    memory_mib: i64,
    disk_mib: i64,
    cpu_percent: i32,
    state: String,
    validation_token: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ServerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            user_id: row.try_get("user_id")?,
            node_id: row.try_get("node_id")?,
            allocation_id: row.try_get("allocation_id")?,
            unit_id: row.try_get("unit_id")?,
            memory_mib: row.try_get("memory_mib")?,
            disk_mib: row.try_get("disk_mib")?,
            cpu_percent: row.try_get("cpu_percent")?,
            state: row.try_get("state")?,
            validation_token: row.try_get("validation_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ServerRow> for Server {
    type Error = RegistryError;

    fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("server", &row.id)?,
            name: row.name,
            user_id: parse_id("server", &row.user_id)?,
            node_id: parse_id("server", &row.node_id)?,
            allocation_id: parse_id("server", &row.allocation_id)?,
            unit_id: parse_id("server", &row.unit_id)?,
            resources: ResourceSpec {
                memory_mib: row.memory_mib,
                disk_mib: row.disk_mib,
                cpu_percent: row.cpu_percent,
            },
            state: row
                .state
                .parse()
                .map_err(|e: String| RegistryError::corrupt("server", e))?,
            validation_token: row.validation_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
