//! In-memory registry.
//!
//! All tables sit behind a single lock, so every trait method is atomic with
//! respect to every other. Data is lost when the process exits.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use berth_id::{AllocationId, NodeId, RegionId, ServerId, UnitId};
use chrono::Utc;

use super::{
    Allocation, NewNode, NewRegion, NewServer, Node, Region, Registry, RegistryError,
    RegistryResult, Server, ServerState, ServerUpdate, Unit,
};

#[derive(Debug, Default)]
struct Tables {
    regions: BTreeMap<RegionId, Region>,
    nodes: BTreeMap<NodeId, Node>,
    allocations: BTreeMap<AllocationId, Allocation>,
    units: BTreeMap<UnitId, Unit>,
    servers: BTreeMap<ServerId, Server>,
}

impl Tables {
    fn region_server_count(&self, region_id: &RegionId) -> i64 {
        self.servers
            .values()
            .filter(|s| {
                self.nodes
                    .get(&s.node_id)
                    .is_some_and(|n| n.region_id.as_ref() == Some(region_id))
            })
            .count() as i64
    }

    fn release_allocation(&mut self, allocation_id: &AllocationId) {
        if let Some(allocation) = self.allocations.get_mut(allocation_id) {
            allocation.assigned = false;
        }
    }
}

/// In-memory registry for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tables: RwLock<Tables>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RegistryResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| RegistryError::Poisoned)
    }

    fn write(&self) -> RegistryResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| RegistryError::Poisoned)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn create_region(&self, region: &NewRegion) -> RegistryResult<Region> {
        let mut tables = self.write()?;

        if tables
            .regions
            .values()
            .any(|r| r.short_code == region.short_code)
        {
            return Err(RegistryError::Conflict(format!(
                "region short code '{}' already exists",
                region.short_code
            )));
        }
        if let Some(fallback) = &region.fallback_region_id {
            if !tables.regions.contains_key(fallback) {
                return Err(RegistryError::not_found("region", fallback));
            }
        }

        let record = Region {
            id: RegionId::new(),
            name: region.name.clone(),
            short_code: region.short_code.clone(),
            country: region.country.clone(),
            fallback_region_id: region.fallback_region_id,
            server_limit: region.server_limit,
            created_at: Utc::now(),
        };
        tables.regions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_region(&self, id: &RegionId) -> RegistryResult<Option<Region>> {
        Ok(self.read()?.regions.get(id).cloned())
    }

    async fn list_regions(&self) -> RegistryResult<Vec<Region>> {
        Ok(self.read()?.regions.values().cloned().collect())
    }

    async fn set_region_fallback(
        &self,
        id: &RegionId,
        fallback: Option<RegionId>,
    ) -> RegistryResult<Region> {
        let mut tables = self.write()?;

        if let Some(fallback) = &fallback {
            if fallback == id {
                return Err(RegistryError::Conflict(format!(
                    "region {id} cannot fall back to itself"
                )));
            }
            if !tables.regions.contains_key(fallback) {
                return Err(RegistryError::not_found("region", fallback));
            }
        }

        let region = tables
            .regions
            .get_mut(id)
            .ok_or_else(|| RegistryError::not_found("region", id))?;
        region.fallback_region_id = fallback;
        Ok(region.clone())
    }

    async fn delete_region(&self, id: &RegionId) -> RegistryResult<()> {
        let mut tables = self.write()?;

        if !tables.regions.contains_key(id) {
            return Err(RegistryError::not_found("region", id));
        }
        if tables.nodes.values().any(|n| n.region_id.as_ref() == Some(id)) {
            return Err(RegistryError::Conflict(format!(
                "region {id} still has member nodes"
            )));
        }

        tables.regions.remove(id);
        for region in tables.regions.values_mut() {
            if region.fallback_region_id.as_ref() == Some(id) {
                region.fallback_region_id = None;
            }
        }
        Ok(())
    }

    async fn count_region_servers(&self, id: &RegionId) -> RegistryResult<i64> {
        Ok(self.read()?.region_server_count(id))
    }

    async fn create_node(&self, node: &NewNode) -> RegistryResult<Node> {
        let mut tables = self.write()?;

        if let Some(region_id) = &node.region_id {
            if !tables.regions.contains_key(region_id) {
                return Err(RegistryError::not_found("region", region_id));
            }
        }

        let record = Node {
            id: NodeId::new(),
            name: node.name.clone(),
            host: node.host.clone(),
            port: node.port,
            secret: node.secret.clone(),
            is_online: false,
            last_checked_at: None,
            region_id: node.region_id,
            created_at: Utc::now(),
        };
        tables.nodes.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_node(&self, id: &NodeId) -> RegistryResult<Option<Node>> {
        Ok(self.read()?.nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> RegistryResult<Vec<Node>> {
        Ok(self.read()?.nodes.values().cloned().collect())
    }

    async fn online_nodes_in_region(&self, id: &RegionId) -> RegistryResult<Vec<Node>> {
        Ok(self
            .read()?
            .nodes
            .values()
            .filter(|n| n.is_online && n.region_id.as_ref() == Some(id))
            .cloned()
            .collect())
    }

    async fn set_node_online(&self, id: &NodeId, online: bool) -> RegistryResult<Node> {
        let mut tables = self.write()?;
        let node = tables
            .nodes
            .get_mut(id)
            .ok_or_else(|| RegistryError::not_found("node", id))?;
        node.is_online = online;
        node.last_checked_at = Some(Utc::now());
        Ok(node.clone())
    }

    async fn delete_node(&self, id: &NodeId) -> RegistryResult<()> {
        let mut tables = self.write()?;

        if !tables.nodes.contains_key(id) {
            return Err(RegistryError::not_found("node", id));
        }
        if tables.servers.values().any(|s| &s.node_id == id) {
            return Err(RegistryError::Conflict(format!(
                "node {id} still hosts servers"
            )));
        }

        tables.nodes.remove(id);
        tables.allocations.retain(|_, a| &a.node_id != id);
        Ok(())
    }

    async fn create_allocations(
        &self,
        node_id: &NodeId,
        bind_address: &str,
        ports: &[u16],
    ) -> RegistryResult<Vec<Allocation>> {
        let mut tables = self.write()?;

        if !tables.nodes.contains_key(node_id) {
            return Err(RegistryError::not_found("node", node_id));
        }

        let mut seen = std::collections::HashSet::new();
        for port in ports {
            let taken = tables.allocations.values().any(|a| {
                &a.node_id == node_id && a.bind_address == bind_address && a.port == *port
            });
            if taken || !seen.insert(*port) {
                return Err(RegistryError::Conflict(format!(
                    "allocation {bind_address}:{port} already exists on node {node_id}"
                )));
            }
        }

        let created: Vec<Allocation> = ports
            .iter()
            .map(|port| Allocation {
                id: AllocationId::new(),
                node_id: *node_id,
                bind_address: bind_address.to_string(),
                port: *port,
                assigned: false,
            })
            .collect();
        for allocation in &created {
            tables.allocations.insert(allocation.id, allocation.clone());
        }
        Ok(created)
    }

    async fn get_allocation(&self, id: &AllocationId) -> RegistryResult<Option<Allocation>> {
        Ok(self.read()?.allocations.get(id).cloned())
    }

    async fn list_allocations(&self, node_id: &NodeId) -> RegistryResult<Vec<Allocation>> {
        let mut allocations: Vec<Allocation> = self
            .read()?
            .allocations
            .values()
            .filter(|a| &a.node_id == node_id)
            .cloned()
            .collect();
        allocations.sort_by(|a, b| {
            (a.port, &a.bind_address, a.id).cmp(&(b.port, &b.bind_address, b.id))
        });
        Ok(allocations)
    }

    async fn first_free_allocation(&self, node_id: &NodeId) -> RegistryResult<Option<Allocation>> {
        Ok(self
            .list_allocations(node_id)
            .await?
            .into_iter()
            .find(|a| !a.assigned))
    }

    async fn delete_allocation(&self, id: &AllocationId) -> RegistryResult<()> {
        let mut tables = self.write()?;
        match tables.allocations.get(id) {
            None => Err(RegistryError::not_found("allocation", id)),
            Some(a) if a.assigned => Err(RegistryError::Conflict(format!(
                "allocation {id} is assigned to a server"
            ))),
            Some(_) => {
                tables.allocations.remove(id);
                Ok(())
            }
        }
    }

    async fn create_unit(&self, unit: &Unit) -> RegistryResult<()> {
        let mut tables = self.write()?;
        if tables.units.contains_key(&unit.id) {
            return Err(RegistryError::Conflict(format!(
                "unit {} already exists",
                unit.id
            )));
        }
        tables.units.insert(unit.id, unit.clone());
        Ok(())
    }

    async fn get_unit(&self, id: &UnitId) -> RegistryResult<Option<Unit>> {
        Ok(self.read()?.units.get(id).cloned())
    }

    async fn claim_and_insert_server(&self, server: &NewServer) -> RegistryResult<Server> {
        let mut tables = self.write()?;

        if !tables.nodes.contains_key(&server.node_id) {
            return Err(RegistryError::not_found("node", server.node_id));
        }
        if tables.servers.contains_key(&server.id) {
            return Err(RegistryError::Conflict(format!(
                "server {} already exists",
                server.id
            )));
        }

        if let Some(region_id) = &server.capacity_guard {
            let limit = tables
                .regions
                .get(region_id)
                .ok_or_else(|| RegistryError::not_found("region", region_id))?
                .server_limit;
            if let Some(limit) = limit {
                let current = tables.region_server_count(region_id);
                if current >= limit {
                    return Err(RegistryError::RegionFull {
                        region_id: region_id.to_string(),
                        limit,
                        current,
                    });
                }
            }
        }

        let allocation = tables
            .allocations
            .get_mut(&server.allocation_id)
            .ok_or_else(|| RegistryError::not_found("allocation", server.allocation_id))?;
        if allocation.node_id != server.node_id {
            return Err(RegistryError::Conflict(format!(
                "allocation {} does not belong to node {}",
                server.allocation_id, server.node_id
            )));
        }
        if allocation.assigned {
            return Err(RegistryError::Conflict(format!(
                "allocation {} is already assigned",
                server.allocation_id
            )));
        }
        allocation.assigned = true;

        let now = Utc::now();
        let record = Server {
            id: server.id,
            name: server.name.clone(),
            user_id: server.user_id,
            node_id: server.node_id,
            allocation_id: server.allocation_id,
            unit_id: server.unit_id,
            resources: server.resources,
            state: ServerState::Creating,
            validation_token: server.validation_token.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.servers.insert(record.id, record.clone());
        Ok(record)
    }

    async fn discard_provisional_server(&self, id: &ServerId) -> RegistryResult<()> {
        let mut tables = self.write()?;
        if let Some(server) = tables.servers.remove(id) {
            tables.release_allocation(&server.allocation_id);
        }
        Ok(())
    }

    async fn get_server(&self, id: &ServerId) -> RegistryResult<Option<Server>> {
        Ok(self.read()?.servers.get(id).cloned())
    }

    async fn list_servers(&self) -> RegistryResult<Vec<Server>> {
        Ok(self.read()?.servers.values().cloned().collect())
    }

    async fn set_server_state(&self, id: &ServerId, state: ServerState) -> RegistryResult<()> {
        let mut tables = self.write()?;
        let server = tables
            .servers
            .get_mut(id)
            .ok_or_else(|| RegistryError::not_found("server", id))?;
        server.state = state;
        server.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_server_update(
        &self,
        id: &ServerId,
        update: &ServerUpdate,
    ) -> RegistryResult<Server> {
        let mut tables = self.write()?;
        let server = tables
            .servers
            .get_mut(id)
            .ok_or_else(|| RegistryError::not_found("server", id))?;
        server.name = update.name.clone();
        server.resources = update.resources;
        server.unit_id = update.unit_id;
        server.state = update.state;
        server.updated_at = Utc::now();
        Ok(server.clone())
    }

    async fn remove_server(&self, id: &ServerId) -> RegistryResult<bool> {
        let mut tables = self.write()?;
        match tables.servers.remove(id) {
            Some(server) => {
                tables.release_allocation(&server.allocation_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use berth_id::UserId;

    use super::*;
    use crate::registry::ResourceSpec;

    async fn seed_node(registry: &MemoryRegistry, region_id: Option<RegionId>) -> Node {
        registry
            .create_node(&NewNode {
                name: "node-a".into(),
                host: "10.0.0.1".into(),
                port: 8080,
                secret: "secret".into(),
                region_id,
            })
            .await
            .unwrap()
    }

    fn new_server(node_id: NodeId, allocation_id: AllocationId) -> NewServer {
        NewServer {
            id: ServerId::new(),
            name: "srv".into(),
            user_id: UserId::new(),
            node_id,
            allocation_id,
            unit_id: UnitId::new(),
            resources: ResourceSpec {
                memory_mib: 1024,
                disk_mib: 4096,
                cpu_percent: 100,
            },
            validation_token: "tok".into(),
            capacity_guard: None,
        }
    }

    #[tokio::test]
    async fn test_claim_marks_allocation_assigned() {
        let registry = MemoryRegistry::new();
        let node = seed_node(&registry, None).await;
        let allocs = registry
            .create_allocations(&node.id, "0.0.0.0", &[25565])
            .await
            .unwrap();

        let server = registry
            .claim_and_insert_server(&new_server(node.id, allocs[0].id))
            .await
            .unwrap();
        assert_eq!(server.state, ServerState::Creating);

        let alloc = registry.get_allocation(&allocs[0].id).await.unwrap().unwrap();
        assert!(alloc.assigned);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let registry = Arc::new(MemoryRegistry::new());
        let node = seed_node(&registry, None).await;
        let allocs = registry
            .create_allocations(&node.id, "0.0.0.0", &[25565])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let request = new_server(node.id, allocs[0].id);
            handles.push(tokio::spawn(async move {
                registry.claim_and_insert_server(&request).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(RegistryError::Conflict(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.list_servers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_rejects_foreign_allocation() {
        let registry = MemoryRegistry::new();
        let node_a = seed_node(&registry, None).await;
        let node_b = seed_node(&registry, None).await;
        let allocs = registry
            .create_allocations(&node_b.id, "0.0.0.0", &[25565])
            .await
            .unwrap();

        let err = registry
            .claim_and_insert_server(&new_server(node_a.id, allocs[0].id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_capacity_guard_enforces_region_limit() {
        let registry = MemoryRegistry::new();
        let region = registry
            .create_region(&NewRegion {
                name: "Europe".into(),
                short_code: "eu".into(),
                country: None,
                fallback_region_id: None,
                server_limit: Some(1),
            })
            .await
            .unwrap();
        let node = seed_node(&registry, Some(region.id)).await;
        let allocs = registry
            .create_allocations(&node.id, "0.0.0.0", &[1, 2])
            .await
            .unwrap();

        let mut first = new_server(node.id, allocs[0].id);
        first.capacity_guard = Some(region.id);
        registry.claim_and_insert_server(&first).await.unwrap();

        let mut second = new_server(node.id, allocs[1].id);
        second.capacity_guard = Some(region.id);
        let err = registry.claim_and_insert_server(&second).await.unwrap_err();
        assert!(matches!(err, RegistryError::RegionFull { limit: 1, current: 1, .. }));
        assert!(!registry.get_allocation(&allocs[1].id).await.unwrap().unwrap().assigned);
    }

    #[tokio::test]
    async fn test_remove_server_releases_allocation() {
        let registry = MemoryRegistry::new();
        let node = seed_node(&registry, None).await;
        let allocs = registry
            .create_allocations(&node.id, "0.0.0.0", &[25565])
            .await
            .unwrap();
        let server = registry
            .claim_and_insert_server(&new_server(node.id, allocs[0].id))
            .await
            .unwrap();

        assert!(registry.remove_server(&server.id).await.unwrap());
        assert!(!registry.remove_server(&server.id).await.unwrap());
        let alloc = registry.get_allocation(&allocs[0].id).await.unwrap().unwrap();
        assert!(!alloc.assigned);
    }

    #[tokio::test]
    async fn test_duplicate_ports_conflict() {
        let registry = MemoryRegistry::new();
        let node = seed_node(&registry, None).await;
        registry
            .create_allocations(&node.id, "0.0.0.0", &[25565])
            .await
            .unwrap();

        let err = registry
            .create_allocations(&node.id, "0.0.0.0", &[25566, 25565])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
        assert_eq!(registry.list_allocations(&node.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_free_allocation_is_lowest_port() {
        let registry = MemoryRegistry::new();
        let node = seed_node(&registry, None).await;
        registry
            .create_allocations(&node.id, "0.0.0.0", &[30002, 30000, 30001])
            .await
            .unwrap();

        let free = registry.first_free_allocation(&node.id).await.unwrap().unwrap();
        assert_eq!(free.port, 30000);
    }

    #[tokio::test]
    async fn test_delete_region_with_nodes_conflicts() {
        let registry = MemoryRegistry::new();
        let region = registry
            .create_region(&NewRegion {
                name: "US".into(),
                short_code: "us".into(),
                country: Some("US".into()),
                fallback_region_id: None,
                server_limit: None,
            })
            .await
            .unwrap();
        seed_node(&registry, Some(region.id)).await;

        let err = registry.delete_region(&region.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }
}
