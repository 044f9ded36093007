//! Telemetry relay: console and resource streams from a daemon to viewers.
//!
//! One [`RelaySession`] runs per (server, viewer) pair. Sessions share no
//! state; each owns its daemon channel, its reconnect loop and its metric
//! history, and all of it goes away when the viewer detaches.

mod connector;
mod events;
mod history;
mod relay;

pub use connector::{ChannelConnector, DaemonChannel, WsConnector};
pub use events::{DaemonCommand, DaemonEvent, StatsSample, ViewerEvent, ViewerRequest};
pub use history::{HistorySnapshot, NetworkRate, RingBuffer, StatsHistory, HISTORY_CAPACITY};
pub use relay::{BackoffPolicy, RelayConfig, RelaySession};

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to daemon channel: {0}")]
    Connect(String),

    #[error("daemon channel connect timed out after {0:?}")]
    Timeout(Duration),
}
