//! Node and allocation selection.

use std::collections::HashSet;
use std::sync::Arc;

use berth_id::{AllocationId, NodeId, RegionId};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::{CapacityError, FleetError, FleetResult};
use crate::registry::{Node, Region, Registry, ResourceSpec};

/// Upper bound on regions visited while following fallback links.
pub const MAX_FALLBACK_DEPTH: usize = 16;

/// Where a caller wants a server placed, as received over the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlacementTarget {
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub region_id: Option<RegionId>,
    #[serde(default)]
    pub allocation_id: Option<AllocationId>,
}

/// A validated placement request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementRequest {
    Node {
        node_id: NodeId,
        allocation_id: Option<AllocationId>,
    },
    Region {
        region_id: RegionId,
        allocation_id: Option<AllocationId>,
        resources: ResourceSpec,
    },
}

impl PlacementRequest {
    /// Exactly one of node and region must be given.
    pub fn from_target(target: PlacementTarget, resources: ResourceSpec) -> FleetResult<Self> {
        match (target.node_id, target.region_id) {
            (Some(node_id), None) => Ok(Self::Node {
                node_id,
                allocation_id: target.allocation_id,
            }),
            (None, Some(region_id)) => Ok(Self::Region {
                region_id,
                allocation_id: target.allocation_id,
                resources,
            }),
            (Some(_), Some(_)) => Err(FleetError::validation(
                "specify either node_id or region_id, not both",
            )),
            (None, None) => Err(FleetError::validation(
                "one of node_id or region_id is required",
            )),
        }
    }
}

/// Resolved placement.
#[derive(Debug, Clone)]
pub struct Placement {
    pub node: Node,
    pub allocation_id: AllocationId,
    /// Region whose server limit the claim must re-check. Only set for
    /// placements that went through the region path.
    pub capacity_guard: Option<RegionId>,
}

/// Read-only planner over the registry.
#[derive(Clone)]
pub struct Planner {
    registry: Arc<dyn Registry>,
}

impl Planner {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, request: &PlacementRequest) -> FleetResult<Placement> {
        match request {
            PlacementRequest::Node {
                node_id,
                allocation_id,
            } => self.resolve_node(node_id, allocation_id.as_ref()).await,
            PlacementRequest::Region {
                region_id,
                allocation_id,
                resources,
            } => {
                debug!(
                    memory_mib = resources.memory_mib,
                    cpu_percent = resources.cpu_percent,
                    "Resolving region placement"
                );
                self.resolve_region(region_id, allocation_id.as_ref()).await
            }
        }
    }

    async fn resolve_node(
        &self,
        node_id: &NodeId,
        allocation_id: Option<&AllocationId>,
    ) -> FleetResult<Placement> {
        let node = self
            .registry
            .get_node(node_id)
            .await?
            .ok_or_else(|| FleetError::not_found("node", node_id))?;

        if !node.is_online {
            return Err(FleetError::conflict(format!("node {node_id} is offline")));
        }

        let allocation_id = match allocation_id {
            Some(id) => {
                let allocation = self
                    .registry
                    .get_allocation(id)
                    .await?
                    .ok_or_else(|| FleetError::not_found("allocation", id))?;
                if allocation.node_id != node.id {
                    return Err(FleetError::conflict(format!(
                        "allocation {id} does not belong to node {node_id}"
                    )));
                }
                if allocation.assigned {
                    return Err(FleetError::conflict(format!(
                        "allocation {id} is already assigned"
                    )));
                }
                allocation.id
            }
            None => {
                self.registry
                    .first_free_allocation(&node.id)
                    .await?
                    .ok_or_else(|| CapacityError::NoAvailableAllocation {
                        node_id: node.id.to_string(),
                    })?
                    .id
            }
        };

        Ok(Placement {
            node,
            allocation_id,
            capacity_guard: None,
        })
    }

    async fn resolve_region(
        &self,
        region_id: &RegionId,
        allocation_id: Option<&AllocationId>,
    ) -> FleetResult<Placement> {
        let requested = self
            .registry
            .get_region(region_id)
            .await?
            .ok_or_else(|| FleetError::not_found("region", region_id))?;

        if let Some(err) = self.capacity_exhausted(&requested).await? {
            return Err(err.into());
        }

        let mut visited = HashSet::new();
        let mut next = Some(requested);

        while let Some(region) = next.take() {
            if !visited.insert(region.id) {
                warn!(region_id = %region.id, "Region fallback chain loops back on itself");
                break;
            }
            if visited.len() > MAX_FALLBACK_DEPTH {
                warn!(region_id = %region.id, "Region fallback chain too deep");
                break;
            }

            if region.id != *region_id && self.capacity_exhausted(&region).await?.is_some() {
                debug!(region_id = %region.id, "Skipping full fallback region");
            } else if let Some(placement) = self.place_in_region(&region, allocation_id).await? {
                return Ok(placement);
            }

            next = match region.fallback_region_id {
                Some(fallback) => self.registry.get_region(&fallback).await?,
                None => None,
            };
        }

        Err(CapacityError::NoAvailableNode.into())
    }

    /// Try the online members of one region. `Ok(None)` means keep walking.
    async fn place_in_region(
        &self,
        region: &Region,
        allocation_id: Option<&AllocationId>,
    ) -> FleetResult<Option<Placement>> {
        let nodes = self.registry.online_nodes_in_region(&region.id).await?;
        if nodes.is_empty() {
            debug!(region_id = %region.id, "No online nodes in region");
            return Ok(None);
        }

        if let Some(id) = allocation_id {
            let allocation = self
                .registry
                .get_allocation(id)
                .await?
                .ok_or_else(|| FleetError::not_found("allocation", id))?;
            let Some(node) = nodes.into_iter().find(|n| n.id == allocation.node_id) else {
                return Ok(None);
            };
            if allocation.assigned {
                return Err(FleetError::conflict(format!(
                    "allocation {id} is already assigned"
                )));
            }
            return Ok(Some(Placement {
                node,
                allocation_id: allocation.id,
                capacity_guard: Some(region.id),
            }));
        }

        let first_node = nodes[0].id;
        for node in nodes {
            if let Some(allocation) = self.registry.first_free_allocation(&node.id).await? {
                debug!(
                    region_id = %region.id,
                    node_id = %node.id,
                    allocation_id = %allocation.id,
                    "Selected node"
                );
                return Ok(Some(Placement {
                    node,
                    allocation_id: allocation.id,
                    capacity_guard: Some(region.id),
                }));
            }
        }

        Err(CapacityError::NoAvailableAllocation {
            node_id: first_node.to_string(),
        }
        .into())
    }

    async fn capacity_exhausted(&self, region: &Region) -> FleetResult<Option<CapacityError>> {
        let Some(limit) = region.server_limit else {
            return Ok(None);
        };
        let current = self.registry.count_region_servers(&region.id).await?;
        Ok((current >= limit).then(|| CapacityError::RegionFull {
            region_id: region.id.to_string(),
            limit,
            current,
        }))
    }
}
