//! Wire frames on both sides of the relay.
//!
//! Every frame is a JSON object tagged by `event`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::history::{HistorySnapshot, NetworkRate};
use crate::daemon::{MemoryUsage, NetworkUsage, PowerAction};

/// One resource sample pushed by the daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSample {
    #[serde(alias = "cpuPercent")]
    pub cpu_percent: f64,
    pub memory: MemoryUsage,
    pub network: NetworkUsage,
}

/// Frames received from the daemon.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DaemonEvent {
    AuthSuccess {
        #[serde(default)]
        logs: Vec<String>,
    },
    ConsoleOutput {
        #[serde(alias = "data")]
        line: String,
    },
    Stats(StatsSample),
    PowerStatus {
        status: String,
    },
    Error {
        message: String,
    },
}

impl DaemonEvent {
    /// Parse a daemon frame. Anything unreadable or untagged is dropped.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "Dropping unreadable daemon frame");
                None
            }
        }
    }
}

/// Frames sent to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DaemonCommand {
    SendCommand { command: String },
    PowerAction { action: PowerAction },
}

/// Frames received from a viewer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ViewerRequest {
    SendCommand { command: String },
    PowerAction { action: PowerAction },
}

impl ViewerRequest {
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(request) => Some(request),
            Err(e) => {
                debug!(error = %e, "Dropping unreadable viewer frame");
                None
            }
        }
    }
}

/// Frames sent to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ViewerEvent {
    /// Log lines the daemon replayed after authenticating.
    Backlog { lines: Vec<String> },
    ConsoleOutput { line: String },
    Stats {
        sample: StatsSample,
        rate: NetworkRate,
        history: HistorySnapshot,
    },
    /// A power action was forwarded and awaits the daemon's answer.
    PowerPending { action: PowerAction },
    PowerStatus { status: String },
    Error { message: String },
    /// The daemon channel dropped; the next attempt starts after `delay_ms`.
    Reconnecting { attempt: u32, delay_ms: u64 },
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_parse_auth_success_without_logs() {
        assert_eq!(
            DaemonEvent::parse(r#"{"event":"auth_success"}"#),
            Some(DaemonEvent::AuthSuccess { logs: vec![] })
        );
    }

    #[test]
    fn test_parse_stats_in_either_case() {
        let snake = DaemonEvent::parse(
            r#"{"event":"stats","cpu_percent":12.5,"memory":{"used":1,"limit":2,"percent":50.0},"network":{"rx_bytes":10,"tx_bytes":20}}"#,
        );
        let camel = DaemonEvent::parse(
            r#"{"event":"stats","cpuPercent":12.5,"memory":{"used":1,"limit":2,"percent":50.0},"network":{"rxBytes":10,"txBytes":20}}"#,
        );
        assert_eq!(snake, camel);
        let Some(DaemonEvent::Stats(sample)) = snake else {
            panic!("expected stats");
        };
        assert_eq!(sample.network.rx_bytes, 10);
        assert_eq!(sample.memory.limit, 2);
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"line":"no tag"}"#)]
    #[case(r#"{"event":"install_output","line":"x"}"#)]
    #[case(r#"{"event":"console_output"}"#)]
    fn test_unreadable_frames_are_dropped(#[case] frame: &str) {
        assert!(DaemonEvent::parse(frame).is_none());
    }

    #[test]
    fn test_viewer_request_parse() {
        assert_eq!(
            ViewerRequest::parse(r#"{"event":"send_command","command":"say hi"}"#),
            Some(ViewerRequest::SendCommand {
                command: "say hi".into()
            })
        );
        assert_eq!(
            ViewerRequest::parse(r#"{"event":"power_action","action":"stop"}"#),
            Some(ViewerRequest::PowerAction {
                action: PowerAction::Stop
            })
        );
        assert!(ViewerRequest::parse(r#"{"event":"power_action","action":"kill"}"#).is_none());
    }

    #[test]
    fn test_daemon_command_shape() {
        let json = serde_json::to_value(DaemonCommand::PowerAction {
            action: PowerAction::Restart,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "power_action", "action": "restart"})
        );
    }
}
