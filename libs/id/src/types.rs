//! Typed ID definitions for fleet records.

use crate::define_id;

// =============================================================================
// Fleet topology
// =============================================================================

define_id!(RegionId, "reg");
define_id!(NodeId, "node");
define_id!(AllocationId, "alloc");

// =============================================================================
// Workloads
// =============================================================================

define_id!(ServerId, "srv");
define_id!(UnitId, "unit");
define_id!(UserId, "usr");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");
