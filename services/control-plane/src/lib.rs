//! berth control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose the
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod placement;
pub mod registry;
pub mod state;
pub mod telemetry;
