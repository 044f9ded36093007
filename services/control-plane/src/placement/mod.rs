//! Placement planner: picks the node and allocation a new server lands on.
//!
//! Two entry points:
//! - direct: the caller names a node (and optionally an allocation)
//! - region: the caller names a region; the planner walks its fallback chain
//!   until it finds an online node with a free allocation
//!
//! The planner only reads the registry. The claim itself happens later in
//! [`crate::registry::Registry::claim_and_insert_server`], which re-checks
//! everything the planner saw.

mod planner;

pub use planner::{Placement, PlacementRequest, PlacementTarget, Planner, MAX_FALLBACK_DEPTH};
