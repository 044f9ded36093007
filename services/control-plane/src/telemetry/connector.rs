//! Daemon-side live channel.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::RelayError;
use crate::registry::{Node, Server};

const INBOUND_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

/// An open channel to a daemon, as text frames in both directions.
///
/// Dropping the channel tears down the underlying connection.
pub struct DaemonChannel {
    pub inbound: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonChannel {
    pub fn new(
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            tasks,
        }
    }
}

impl Drop for DaemonChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens daemon channels for relay sessions.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, node: &Node, server: &Server) -> Result<DaemonChannel, RelayError>;
}

/// Websocket connector: `ws(s)://{host}:{port}/servers/{id}/ws?token=<validation token>`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    tls: bool,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(tls: bool, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }

    fn url(&self, node: &Node, server: &Server) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/servers/{}/ws?token={}",
            node.host, node.port, server.id, server.validation_token
        )
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, node: &Node, server: &Server) -> Result<DaemonChannel, RelayError> {
        let url = self.url(node, server);
        let (stream, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| RelayError::Timeout(self.connect_timeout))?
        .map_err(|e| RelayError::Connect(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let server_id = server.id;

        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(server_id = %server_id, error = %e, "Daemon channel read failed");
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(server_id = %server_id, error = %e, "Daemon channel write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        Ok(DaemonChannel::new(
            inbound_rx,
            outbound_tx,
            vec![reader, writer],
        ))
    }
}

#[cfg(test)]
mod tests {
    use berth_id::{AllocationId, NodeId, ServerId, UnitId, UserId};
    use chrono::Utc;

    use super::*;
    use crate::registry::{ResourceSpec, ServerState};

    #[test]
    fn test_channel_url_carries_token() {
        let node = Node {
            id: NodeId::new(),
            name: "n".into(),
            host: "daemon.example.com".into(),
            port: 8443,
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
                memory_mib: 1,
                disk_mib: 1,
                cpu_percent: 1,
            },
            state: ServerState::Running,
            validation_token: "abc123".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let connector = WsConnector::new(true, Duration::from_secs(5));
        assert_eq!(
            connector.url(&node, &server),
            format!(
                "wss://daemon.example.com:8443/servers/{}/ws?token=abc123",
                server.id
            )
        );
    }
}
