//! Lifecycle controller: the server state machine.
//!
//! ```text
//! creating -> installing -> installed | running
//!                 running <-> starting | stopping | restarting
//!                 any     ->  updating | reinstalling | deleting
//! failures: install_failed, update_failed, errored
//! ```
//!
//! `unknown` is only ever returned to callers when the daemon cannot be
//! reached. It is never persisted.

mod controller;
mod token;

pub use controller::{ConsoleTarget, CreateServer, FleetController, ServerView, UpdateServer};
pub use token::{generate_validation_token, tokens_match};
