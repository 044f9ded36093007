//! Per-viewer relay session with supervised reconnect.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connector::{ChannelConnector, DaemonChannel};
use super::events::{DaemonCommand, DaemonEvent, ViewerEvent, ViewerRequest};
use super::history::StatsHistory;
use crate::lifecycle::ConsoleTarget;
use crate::registry::ServerState;

/// Reconnect delays. `base == max` gives a fixed delay.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub reconnect: BackoffPolicy,
    /// Most recent backlog lines delivered after authentication.
    pub backlog_lines: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect: BackoffPolicy::default(),
            backlog_lines: 100,
        }
    }
}

/// How a pump over one daemon channel ended.
enum Exit {
    ChannelClosed,
    ViewerGone,
}

/// What the session knows locally about its server.
struct Local {
    state: ServerState,
    pending_power: bool,
    history: StatsHistory,
}

/// One viewer's view of one server's live channel.
pub struct RelaySession {
    target: ConsoleTarget,
    connector: Arc<dyn ChannelConnector>,
    config: RelayConfig,
}

impl RelaySession {
    pub fn new(
        target: ConsoleTarget,
        connector: Arc<dyn ChannelConnector>,
        config: RelayConfig,
    ) -> Self {
        Self {
            target,
            connector,
            config,
        }
    }

    /// Run until the viewer goes away.
    ///
    /// The viewer is gone once `requests` closes or `events` has no receiver.
    /// The daemon channel is reopened after every closure.
    pub async fn run(
        self,
        mut requests: mpsc::Receiver<ViewerRequest>,
        events: mpsc::Sender<ViewerEvent>,
    ) {
        let server_id = self.target.server.id;
        let mut local = Local {
            state: self.target.server.state,
            pending_power: false,
            history: StatsHistory::new(),
        };
        let mut attempt: u32 = 0;

        info!(server_id = %server_id, "Relay session started");

        loop {
            let connected = tokio::select! {
                result = self.connector.connect(&self.target.node, &self.target.server) => result,
                _ = events.closed() => break,
            };

            match connected {
                Ok(mut channel) => {
                    debug!(server_id = %server_id, "Daemon channel open");
                    attempt = 0;
                    let exit = self
                        .pump(&mut channel, &mut requests, &events, &mut local)
                        .await;
                    drop(channel);
                    if let Exit::ViewerGone = exit {
                        break;
                    }
                    debug!(server_id = %server_id, "Daemon channel closed");
                }
                Err(e) => {
                    warn!(server_id = %server_id, error = %e, "Daemon channel connect failed");
                }
            }

            let delay = self.config.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            let notice = ViewerEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            };
            if events.send(notice).await.is_err() {
                break;
            }
            if let Exit::ViewerGone = self.wait(delay, &mut requests, &events).await {
                break;
            }
        }

        info!(server_id = %server_id, "Relay session ended");
    }

    async fn pump(
        &self,
        channel: &mut DaemonChannel,
        requests: &mut mpsc::Receiver<ViewerRequest>,
        events: &mpsc::Sender<ViewerEvent>,
        local: &mut Local,
    ) -> Exit {
        loop {
            tokio::select! {
                frame = channel.inbound.recv() => {
                    let Some(frame) = frame else {
                        return Exit::ChannelClosed;
                    };
                    let Some(event) = DaemonEvent::parse(&frame) else {
                        continue;
                    };
                    for out in self.translate(event, local) {
                        if events.send(out).await.is_err() {
                            return Exit::ViewerGone;
                        }
                    }
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        return Exit::ViewerGone;
                    };
                    match self.forward(request, channel, local).await {
                        Ok(None) => {}
                        Ok(Some(reply)) => {
                            if events.send(reply).await.is_err() {
                                return Exit::ViewerGone;
                            }
                        }
                        Err(exit) => return exit,
                    }
                }
            }
        }
    }

    /// Sleep before reconnecting while still answering the viewer.
    async fn wait(
        &self,
        delay: Duration,
        requests: &mut mpsc::Receiver<ViewerRequest>,
        events: &mpsc::Sender<ViewerEvent>,
    ) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Exit::ChannelClosed,
                request = requests.recv() => {
                    if request.is_none() {
                        return Exit::ViewerGone;
                    }
                    let reply = ViewerEvent::Error {
                        message: "daemon channel is reconnecting".into(),
                    };
                    if events.send(reply).await.is_err() {
                        return Exit::ViewerGone;
                    }
                }
            }
        }
    }

    fn translate(&self, event: DaemonEvent, local: &mut Local) -> Vec<ViewerEvent> {
        match event {
            DaemonEvent::AuthSuccess { mut logs } => {
                let skip = logs.len().saturating_sub(self.config.backlog_lines);
                logs.drain(..skip);
                vec![ViewerEvent::Backlog { lines: logs }]
            }
            DaemonEvent::ConsoleOutput { line } => vec![ViewerEvent::ConsoleOutput { line }],
            DaemonEvent::Stats(sample) => {
                let rate = local.history.record(&sample);
                vec![ViewerEvent::Stats {
                    sample,
                    rate,
                    history: local.history.snapshot(),
                }]
            }
            DaemonEvent::PowerStatus { status } => {
                local.pending_power = false;
                match status.parse::<ServerState>() {
                    Ok(state) => local.state = state,
                    Err(e) => debug!(error = %e, "Unrecognised power status"),
                }
                vec![
                    ViewerEvent::ConsoleOutput {
                        line: format!("[berth] server marked as {status}"),
                    },
                    ViewerEvent::PowerStatus { status },
                ]
            }
            DaemonEvent::Error { message } => {
                local.pending_power = false;
                vec![ViewerEvent::Error { message }]
            }
        }
    }

    /// Forward a viewer request to the daemon, possibly answering the viewer
    /// directly instead.
    async fn forward(
        &self,
        request: ViewerRequest,
        channel: &DaemonChannel,
        local: &mut Local,
    ) -> Result<Option<ViewerEvent>, Exit> {
        let (command, reply) = match request {
            ViewerRequest::SendCommand { command } => {
                if local.state != ServerState::Running {
                    return Ok(Some(ViewerEvent::Error {
                        message: format!("server is {}, commands need it running", local.state),
                    }));
                }
                (DaemonCommand::SendCommand { command }, None)
            }
            ViewerRequest::PowerAction { action } => {
                local.pending_power = true;
                (
                    DaemonCommand::PowerAction { action },
                    Some(ViewerEvent::PowerPending { action }),
                )
            }
        };

        let frame = match serde_json::to_string(&command) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode daemon command");
                return Ok(None);
            }
        };
        if channel.outbound.send(frame).await.is_err() {
            return Err(Exit::ChannelClosed);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use berth_id::{AllocationId, NodeId, ServerId, UnitId, UserId};
    use chrono::Utc;

    use super::*;
    use crate::daemon::PowerAction;
    use crate::registry::{Node, ResourceSpec, Server};
    use crate::telemetry::RelayError;

    /// Daemon end of an in-memory channel.
    struct DaemonEnd {
        to_relay: mpsc::Sender<String>,
        from_relay: mpsc::Receiver<String>,
    }

    fn channel_pair() -> (DaemonChannel, DaemonEnd) {
        let (to_relay, inbound) = mpsc::channel(16);
        let (outbound, from_relay) = mpsc::channel(16);
        (
            DaemonChannel::new(inbound, outbound, vec![]),
            DaemonEnd {
                to_relay,
                from_relay,
            },
        )
    }

    #[derive(Default)]
    struct ScriptedConnector {
        channels: Mutex<VecDeque<DaemonChannel>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn with(channels: Vec<DaemonChannel>) -> Arc<Self> {
            Arc::new(Self {
                channels: Mutex::new(channels.into()),
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelConnector for ScriptedConnector {
        async fn connect(&self, _: &Node, _: &Server) -> Result<DaemonChannel, RelayError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.channels
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RelayError::Connect("connection refused".into()))
        }
    }

    fn target(state: ServerState) -> ConsoleTarget {
        let node = Node {
            id: NodeId::new(),
            name: "n".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            secret: "s".into(),
            is_online: true,
            last_checked_at: None,
            region_id: None,
            created_at: Utc::now(),
        };
        let server = Server {
            id: ServerId::new(),
            name: "s".into(),
            user_id: UserId::new(),
            node_id: node.id,
            allocation_id: AllocationId::new(),
            unit_id: UnitId::new(),
            resources: ResourceSpec {
                memory_mib: 1024,
                disk_mib: 1024,
                cpu_percent: 100,
            },
            state,
            validation_token: "tok".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        ConsoleTarget { server, node }
    }

    struct Viewer {
        requests: mpsc::Sender<ViewerRequest>,
        events: mpsc::Receiver<ViewerEvent>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(state: ServerState, connector: Arc<ScriptedConnector>, config: RelayConfig) -> Viewer {
        let (requests, request_rx) = mpsc::channel(16);
        let (event_tx, events) = mpsc::channel(16);
        let session = RelaySession::new(target(state), connector, config);
        let handle = tokio::spawn(session.run(request_rx, event_tx));
        Viewer {
            requests,
            events,
            handle,
        }
    }

    #[tokio::test]
    async fn test_backlog_is_capped() {
        let (channel, daemon) = channel_pair();
        let config = RelayConfig {
            backlog_lines: 2,
            ..Default::default()
        };
        let mut viewer = start(ServerState::Running, ScriptedConnector::with(vec![channel]), config);

        daemon
            .to_relay
            .send(r#"{"event":"auth_success","logs":["a","b","c"]}"#.into())
            .await
            .unwrap();

        assert_eq!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::Backlog {
                lines: vec!["b".into(), "c".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_bad_frames_are_dropped_and_session_continues() {
        let (channel, daemon) = channel_pair();
        let mut viewer = start(
            ServerState::Running,
            ScriptedConnector::with(vec![channel]),
            RelayConfig::default(),
        );

        daemon.to_relay.send("garbage".into()).await.unwrap();
        daemon
            .to_relay
            .send(r#"{"event":"console_output","line":"Done (3.2s)!"}"#.into())
            .await
            .unwrap();

        assert_eq!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::ConsoleOutput {
                line: "Done (3.2s)!".into()
            }
        );
    }

    #[tokio::test]
    async fn test_commands_only_forwarded_while_running() {
        let (channel, mut daemon) = channel_pair();
        let mut viewer = start(
            ServerState::Stopped,
            ScriptedConnector::with(vec![channel]),
            RelayConfig::default(),
        );

        viewer
            .requests
            .send(ViewerRequest::SendCommand {
                command: "say hi".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::Error { .. }
        ));

        viewer
            .requests
            .send(ViewerRequest::PowerAction {
                action: PowerAction::Start,
            })
            .await
            .unwrap();
        assert_eq!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::PowerPending {
                action: PowerAction::Start
            }
        );
        assert_eq!(
            daemon.from_relay.recv().await.unwrap(),
            r#"{"event":"power_action","action":"start"}"#
        );

        daemon
            .to_relay
            .send(r#"{"event":"power_status","status":"running"}"#.into())
            .await
            .unwrap();
        assert!(matches!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::ConsoleOutput { .. }
        ));
        assert_eq!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::PowerStatus {
                status: "running".into()
            }
        );

        viewer
            .requests
            .send(ViewerRequest::SendCommand {
                command: "say hi".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            daemon.from_relay.recv().await.unwrap(),
            r#"{"event":"send_command","command":"say hi"}"#
        );
    }

    #[tokio::test]
    async fn test_stats_feed_history() {
        let (channel, daemon) = channel_pair();
        let mut viewer = start(
            ServerState::Running,
            ScriptedConnector::with(vec![channel]),
            RelayConfig::default(),
        );

        for rx in [1000, 1500] {
            daemon
                .to_relay
                .send(format!(
                    r#"{{"event":"stats","cpu_percent":5.0,"network":{{"rx_bytes":{rx},"tx_bytes":0}}}}"#
                ))
                .await
                .unwrap();
        }

        let _first = viewer.events.recv().await.unwrap();
        match viewer.events.recv().await.unwrap() {
            ViewerEvent::Stats { rate, history, .. } => {
                assert_eq!(rate.rx_bytes, 500);
                assert_eq!(history.network.len(), 2);
                assert_eq!(history.cpu, vec![5.0, 5.0]);
            }
            other => panic!("expected stats, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_channel_closes() {
        let (first, first_daemon) = channel_pair();
        let (second, second_daemon) = channel_pair();
        let connector = ScriptedConnector::with(vec![first, second]);
        let config = RelayConfig {
            reconnect: BackoffPolicy::fixed(Duration::from_secs(5)),
            ..Default::default()
        };
        let mut viewer = start(ServerState::Running, connector.clone(), config);

        drop(first_daemon);
        assert_eq!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::Reconnecting {
                attempt: 1,
                delay_ms: 5000
            }
        );

        second_daemon
            .to_relay
            .send(r#"{"event":"console_output","line":"back"}"#.into())
            .await
            .unwrap();
        assert_eq!(
            viewer.events.recv().await.unwrap(),
            ViewerEvent::ConsoleOutput {
                line: "back".into()
            }
        );
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_viewer_detach_tears_down_channel() {
        let (channel, mut daemon) = channel_pair();
        let viewer = start(
            ServerState::Running,
            ScriptedConnector::with(vec![channel]),
            RelayConfig::default(),
        );

        drop(viewer.requests);
        viewer.handle.await.unwrap();

        assert!(daemon.from_relay.recv().await.is_none());
        assert!(daemon.to_relay.is_closed());
        drop(viewer.events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_detach_stops_reconnect_loop() {
        let connector = ScriptedConnector::with(vec![]);
        let viewer = start(
            ServerState::Running,
            connector.clone(),
            RelayConfig::default(),
        );

        tokio::time::sleep(Duration::from_secs(12)).await;
        drop(viewer.requests);
        drop(viewer.events);
        viewer.handle.await.unwrap();

        let attempts = connector.connects.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), attempts);
    }

    #[test]
    fn test_backoff_policy() {
        let fixed = BackoffPolicy::fixed(Duration::from_secs(5));
        assert_eq!(fixed.delay(0), Duration::from_secs(5));
        assert_eq!(fixed.delay(10), Duration::from_secs(5));

        let exponential = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(exponential.delay(0), Duration::from_secs(1));
        assert_eq!(exponential.delay(3), Duration::from_secs(8));
        assert_eq!(exponential.delay(20), Duration::from_secs(30));
    }
}
