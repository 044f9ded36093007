//! HTTP implementation of [`DaemonApi`].

use std::time::Duration;

use async_trait::async_trait;
use berth_id::ServerId;
use reqwest::{Method, RequestBuilder, Response};
use tracing::{debug, warn};

use super::{
    CargoItem, CreateServerRequest, DaemonApi, DaemonError, DaemonResult, PatchServerRequest,
    PowerAction, ServerStatus,
};
use crate::registry::Node;

/// Default RPC timeout.
pub const DEFAULT_DAEMON_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DaemonClientConfig {
    /// Upper bound for every RPC, including reading the response body.
    pub timeout: Duration,
    /// Talk to daemons over https instead of http.
    pub tls: bool,
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DAEMON_TIMEOUT,
            tls: false,
        }
    }
}

/// Daemon client over HTTP, authenticated with `Authorization: Bearer <node secret>`.
#[derive(Clone)]
pub struct HttpDaemonClient {
    client: reqwest::Client,
    scheme: &'static str,
    timeout: Duration,
}

impl HttpDaemonClient {
    pub fn new(config: &DaemonClientConfig) -> DaemonResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DaemonError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            scheme: if config.tls { "https" } else { "http" },
            timeout: config.timeout,
        })
    }

    fn url(&self, node: &Node, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, node.host, node.port, path)
    }

    fn request(&self, node: &Node, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(node, path))
            .bearer_auth(&node.secret)
    }

    /// Send a request and turn non-success responses into [`DaemonError`].
    async fn execute(&self, node: &Node, request: RequestBuilder) -> DaemonResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(node, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            node_id = %node.id,
            status = %status,
            body = %body,
            "Daemon returned failure"
        );
        Err(DaemonError::from_response(status.as_u16(), &body))
    }

    async fn execute_empty(&self, node: &Node, request: RequestBuilder) -> DaemonResult<()> {
        self.execute(node, request).await.map(|_| ())
    }

    fn transport_error(&self, node: &Node, err: reqwest::Error) -> DaemonError {
        if err.is_timeout() {
            DaemonError::Timeout {
                node_id: node.id.to_string(),
                timeout: self.timeout,
            }
        } else {
            DaemonError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl DaemonApi for HttpDaemonClient {
    async fn create_server(&self, node: &Node, request: &CreateServerRequest) -> DaemonResult<()> {
        debug!(node_id = %node.id, server_id = %request.id, "Creating server on daemon");
        let builder = self.request(node, Method::POST, "/servers").json(request);
        self.execute_empty(node, builder).await
    }

    async fn patch_server(
        &self,
        node: &Node,
        server_id: &ServerId,
        request: &PatchServerRequest,
    ) -> DaemonResult<()> {
        debug!(node_id = %node.id, server_id = %server_id, "Patching server on daemon");
        let builder = self
            .request(node, Method::PATCH, &format!("/servers/{server_id}"))
            .json(request);
        self.execute_empty(node, builder).await
    }

    async fn delete_server(&self, node: &Node, server_id: &ServerId) -> DaemonResult<()> {
        debug!(node_id = %node.id, server_id = %server_id, "Deleting server on daemon");
        let builder = self.request(node, Method::DELETE, &format!("/servers/{server_id}"));
        self.execute_empty(node, builder).await
    }

    async fn power_action(
        &self,
        node: &Node,
        server_id: &ServerId,
        action: PowerAction,
    ) -> DaemonResult<()> {
        debug!(node_id = %node.id, server_id = %server_id, action = %action, "Sending power action");
        let builder = self.request(
            node,
            Method::POST,
            &format!("/servers/{server_id}/power/{action}"),
        );
        self.execute_empty(node, builder).await
    }

    async fn reinstall_server(&self, node: &Node, server_id: &ServerId) -> DaemonResult<()> {
        debug!(node_id = %node.id, server_id = %server_id, "Reinstalling server on daemon");
        let builder = self.request(
            node,
            Method::POST,
            &format!("/servers/{server_id}/reinstall"),
        );
        self.execute_empty(node, builder).await
    }

    async fn ship_cargo(
        &self,
        node: &Node,
        server_id: &ServerId,
        items: &[CargoItem],
    ) -> DaemonResult<()> {
        debug!(node_id = %node.id, server_id = %server_id, items = items.len(), "Shipping cargo");
        let builder = self
            .request(
                node,
                Method::POST,
                &format!("/servers/{server_id}/cargo/ship"),
            )
            .json(items);
        self.execute_empty(node, builder).await
    }

    async fn get_server_status(
        &self,
        node: &Node,
        server_id: &ServerId,
    ) -> DaemonResult<ServerStatus> {
        let builder = self.request(node, Method::GET, &format!("/servers/{server_id}"));
        let response = self.execute(node, builder).await?;
        response.json::<ServerStatus>().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(node, e)
            } else {
                DaemonError::InvalidResponse(e.to_string())
            }
        })
    }
}
