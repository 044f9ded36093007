//! # berth-id
//!
//! Typed identifiers for every record the berth control plane stores.
//!
//! All ids share the `{prefix}_{ulid}` shape, e.g. `srv_01HV4Z4NYPLTRS0JTUA8XDME5F`.
//! The prefix makes a mixed-up id fail at parse time instead of matching the
//! wrong row, and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
