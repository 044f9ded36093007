//! Daemon RPC errors.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// The daemon did not answer within the RPC timeout.
    #[error("daemon on node {node_id} timed out after {timeout:?}")]
    Timeout { node_id: String, timeout: Duration },

    /// The daemon answered with a failure and explained why.
    #[error("daemon rejected request ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Connection failure or a failure response without a message.
    #[error("daemon transport failure: {0}")]
    Transport(String),

    /// The daemon answered successfully with a body we cannot read.
    #[error("invalid daemon response: {0}")]
    InvalidResponse(String),
}

#[derive(Deserialize)]
struct UpstreamBody {
    error: Option<String>,
    message: Option<String>,
}

impl UpstreamBody {
    fn into_message(self) -> Option<String> {
        let non_empty = |m: &String| !m.trim().is_empty();
        self.error
            .filter(non_empty)
            .or_else(|| self.message.filter(non_empty))
    }
}

impl DaemonError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Build the error for a non-success response.
    ///
    /// Daemons answer `{"error": "..."}` or `{"message": "..."}`, with `error`
    /// preferred when both are set; plain text bodies are used as-is.
    pub(crate) fn from_response(status: u16, body: &str) -> Self {
        let body = body.trim();
        let message = match serde_json::from_str::<UpstreamBody>(body) {
            Ok(parsed) => parsed.into_message(),
            Err(_) if !body.is_empty() && !body.starts_with('{') => Some(body.to_string()),
            Err(_) => None,
        };

        match message {
            Some(message) => Self::Upstream { status, message },
            None => Self::Transport(format!("daemon responded with status {status}")),
        }
    }
}
