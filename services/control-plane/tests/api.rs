//! HTTP API integration tests.
//!
//! Drives the full router against the in-memory registry, with wiremock
//! standing in for the node daemon.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use berth_control_plane::{
    api,
    daemon::{DaemonClientConfig, HttpDaemonClient},
    lifecycle::FleetController,
    registry::{MemoryRegistry, Node, Registry, Server, Unit, UnitVariable},
    state::AppState,
    telemetry::{ChannelConnector, DaemonChannel, RelayConfig, RelayError, WsConnector},
};
use berth_id::{UnitId, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NODE_SECRET: &str = "node-secret";

struct Harness {
    app: Router,
    daemon: MockServer,
    registry: Arc<MemoryRegistry>,
}

struct Fleet {
    region_id: String,
    node_id: String,
    allocation_ids: Vec<String>,
    unit_id: String,
}

impl Harness {
    async fn new() -> Self {
        Self::with_connector(Arc::new(WsConnector::new(false, Duration::from_secs(1)))).await
    }

    async fn with_connector(connector: Arc<dyn ChannelConnector>) -> Self {
        let daemon = MockServer::start().await;
        let client = HttpDaemonClient::new(&DaemonClientConfig {
            timeout: Duration::from_millis(300),
            tls: false,
        })
        .expect("daemon client");
        let registry = Arc::new(MemoryRegistry::new());
        let controller = FleetController::new(registry.clone(), Arc::new(client));
        let state = AppState::new(controller, connector, RelayConfig::default(), None);

        Self {
            app: api::create_router(state),
            daemon,
            registry,
        }
    }

    async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Region with one online node, two allocations and a unit.
    async fn seed_fleet(&self, server_limit: Option<i64>) -> Fleet {
        let (status, region) = self
            .request(
                Method::POST,
                "/v1/regions",
                Some(json!({
                    "name": "Frankfurt",
                    "short_code": "eu-central",
                    "server_limit": server_limit,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{region}");
        let region_id = region["id"].as_str().unwrap().to_string();

        let addr = self.daemon.address();
        let (status, node) = self
            .request(
                Method::POST,
                "/v1/nodes",
                Some(json!({
                    "name": "fra-1",
                    "host": addr.ip().to_string(),
                    "port": addr.port(),
                    "secret": NODE_SECRET,
                    "region_id": region_id,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{node}");
        assert!(node.get("secret").is_none());
        let node_id = node["id"].as_str().unwrap().to_string();

        let (status, _) = self
            .request(
                Method::POST,
                &format!("/v1/nodes/{node_id}/status"),
                Some(json!({ "online": true })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, allocations) = self
            .request(
                Method::POST,
                &format!("/v1/nodes/{node_id}/allocations"),
                Some(json!({ "bind_address": "0.0.0.0", "ports": [25566, 25565] })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{allocations}");
        let allocation_ids = allocations["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["id"].as_str().unwrap().to_string())
            .collect();

        // Units come from the catalog, not the HTTP surface.
        let unit = Unit {
            id: UnitId::new(),
            name: "Paper".into(),
            docker_image: "ghcr.io/berth/paper:1.21".into(),
            startup_command: "java -jar server.jar".into(),
            variables: vec![UnitVariable {
                name: "Version".into(),
                env_variable: "MC_VERSION".into(),
                default_value: Some("1.21".into()),
            }],
            config_files: vec![],
            install_script: None,
        };
        self.registry.create_unit(&unit).await.unwrap();
        let unit_id = unit.id.to_string();

        Fleet {
            region_id,
            node_id,
            allocation_ids,
            unit_id,
        }
    }

    async fn create_server(&self, fleet: &Fleet) -> (StatusCode, Value) {
        self.request(
            Method::POST,
            "/v1/servers",
            Some(json!({
                "name": "survival",
                "user_id": UserId::new().to_string(),
                "unit_id": fleet.unit_id,
                "memory_mib": 2048,
                "disk_mib": 10240,
                "cpu_percent": 200,
                "region_id": fleet.region_id,
            })),
        )
        .await
    }

    async fn mock_daemon_create_ok(&self) {
        Mock::given(method("POST"))
            .and(path("/servers"))
            .and(header("authorization", format!("Bearer {NODE_SECRET}").as_str()))
            .respond_with(ResponseTemplate::new(202))
            .mount(&self.daemon)
            .await;
    }

    async fn mock_daemon_status(&self, state: &str) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/servers/srv_[0-9A-Z]+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": state,
                "cpu_percent": 12.5,
                "memory": { "used": 512, "limit": 2048, "percent": 25.0 },
            })))
            .mount(&self.daemon)
            .await;
    }
}

#[tokio::test]
async fn test_health_endpoints() {
    let harness = Harness::new().await;

    let (status, body) = harness.request(Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = harness.request(Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["components"]["registry"]["status"], "ok");
    assert!(body["components"].get("database").is_none());
}

#[tokio::test]
async fn test_create_server_places_on_region_and_resyncs_on_read() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;
    harness.mock_daemon_create_ok().await;
    harness.mock_daemon_status("running").await;

    let (status, created) = harness.create_server(&fleet).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["node_id"], fleet.node_id.as_str());
    assert_eq!(created["state"], "installing");
    assert_eq!(created["validation_token"].as_str().unwrap().len(), 64);

    // Lowest port wins.
    let (_, allocations) = harness
        .request(
            Method::GET,
            &format!("/v1/nodes/{}/allocations", fleet.node_id),
            None,
        )
        .await;
    assert_eq!(allocations["items"][0]["port"], 25565);
    assert_eq!(allocations["items"][0]["assigned"], true);
    assert_eq!(created["allocation_id"], allocations["items"][0]["id"]);

    let server_id = created["id"].as_str().unwrap();
    let (status, server) = harness
        .request(Method::GET, &format!("/v1/servers/{server_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server["state"], "running");
    assert_eq!(server["status"]["cpu_percent"], 12.5);
    assert!(server.get("validation_token").is_none());

    let (status, list) = harness.request(Method::GET, "/v1/servers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_full_region_is_capacity_exhausted() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(Some(1)).await;
    harness.mock_daemon_create_ok().await;

    let (status, _) = harness.create_server(&fleet).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, problem) = harness.create_server(&fleet).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["code"], "capacity_exhausted");
}

#[tokio::test]
async fn test_daemon_failure_rolls_back_allocation() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;
    Mock::given(method("POST"))
        .and(path("/servers"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "disk full" })))
        .expect(1)
        .mount(&harness.daemon)
        .await;

    let (status, problem) = harness.create_server(&fleet).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(problem["code"], "daemon_error");

    let (_, allocations) = harness
        .request(
            Method::GET,
            &format!("/v1/nodes/{}/allocations", fleet.node_id),
            None,
        )
        .await;
    assert!(allocations["items"]
        .as_array()
        .unwrap()
        .iter()
        .all(|a| a["assigned"] == false));

    let (_, list) = harness.request(Method::GET, "/v1/servers", None).await;
    assert!(list["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_explicit_node_and_region_is_rejected() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;

    let (status, problem) = harness
        .request(
            Method::POST,
            "/v1/servers",
            Some(json!({
                "name": "both",
                "user_id": UserId::new().to_string(),
                "unit_id": fleet.unit_id,
                "memory_mib": 1024,
                "disk_mib": 1024,
                "cpu_percent": 100,
                "region_id": fleet.region_id,
                "node_id": fleet.node_id,
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "validation_failed");
}

#[tokio::test]
async fn test_delete_converges_when_daemon_fails() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;
    harness.mock_daemon_create_ok().await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/servers/srv_[0-9A-Z]+$"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&harness.daemon)
        .await;

    let (_, created) = harness.create_server(&fleet).await;
    let server_id = created["id"].as_str().unwrap();

    let (status, _) = harness
        .request(Method::DELETE, &format!("/v1/servers/{server_id}"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, problem) = harness
        .request(Method::GET, &format!("/v1/servers/{server_id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["code"], "server_not_found");

    // Deleting again is a no-op.
    let (status, _) = harness
        .request(Method::DELETE, &format!("/v1/servers/{server_id}"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = harness
        .request(
            Method::DELETE,
            &format!(
                "/v1/nodes/{}/allocations/{}",
                fleet.node_id, fleet.allocation_ids[0]
            ),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_power_timeout_is_gateway_timeout() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;
    harness.mock_daemon_create_ok().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/servers/srv_[0-9A-Z]+/power/stop$"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(2)))
        .mount(&harness.daemon)
        .await;

    let (_, created) = harness.create_server(&fleet).await;
    let server_id = created["id"].as_str().unwrap();

    let (status, problem) = harness
        .request(
            Method::POST,
            &format!("/v1/servers/{server_id}/power/stop"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(problem["code"], "daemon_timeout");
    assert_eq!(problem["retryable"], true);
}

#[tokio::test]
async fn test_unknown_power_action_is_bad_request() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;
    harness.mock_daemon_create_ok().await;

    let (_, created) = harness.create_server(&fleet).await;
    let server_id = created["id"].as_str().unwrap();

    let (status, problem) = harness
        .request(
            Method::POST,
            &format!("/v1/servers/{server_id}/power/kill"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "validation_failed");
}

#[tokio::test]
async fn test_region_fallback_rules() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;

    let (status, problem) = harness
        .request(
            Method::PUT,
            &format!("/v1/regions/{}/fallback", fleet.region_id),
            Some(json!({ "fallback_region_id": fleet.region_id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "validation_failed");

    let (_, other) = harness
        .request(
            Method::POST,
            "/v1/regions",
            Some(json!({ "name": "Amsterdam", "short_code": "eu-west" })),
        )
        .await;
    let (status, region) = harness
        .request(
            Method::PUT,
            &format!("/v1/regions/{}/fallback", fleet.region_id),
            Some(json!({ "fallback_region_id": other["id"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(region["fallback_region_id"], other["id"]);

    // The region still has a member node.
    let (status, problem) = harness
        .request(
            Method::DELETE,
            &format!("/v1/regions/{}", fleet.region_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["code"], "conflict");
}

#[tokio::test]
async fn test_duplicate_allocation_port_conflicts() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;

    let (status, _) = harness
        .request(
            Method::POST,
            &format!("/v1/nodes/{}/allocations", fleet.node_id),
            Some(json!({ "bind_address": "0.0.0.0", "ports": [25567, 25565] })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, allocations) = harness
        .request(
            Method::GET,
            &format!("/v1/nodes/{}/allocations", fleet.node_id),
            None,
        )
        .await;
    assert_eq!(allocations["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_invalid_id_is_bad_request() {
    let harness = Harness::new().await;

    let (status, problem) = harness
        .request(Method::GET, "/v1/servers/node_01HV4Z4NYPLTRS0JTUA8XDME5F", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "invalid_server_id");
}

#[tokio::test]
async fn test_console_rejects_bad_token_before_upgrade() {
    let harness = Harness::new().await;
    let fleet = harness.seed_fleet(None).await;
    harness.mock_daemon_create_ok().await;

    let (_, created) = harness.create_server(&fleet).await;
    let server_id = created["id"].as_str().unwrap();

    let (status, problem) = harness
        .request(
            Method::GET,
            &format!("/v1/servers/{server_id}/console?token=wrong"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(problem["code"], "invalid_token");

    let (status, _) = harness
        .request(Method::GET, &format!("/v1/servers/{server_id}/console"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

/// Hands out one pre-built channel, then refuses.
struct OneShotConnector {
    channel: Mutex<Option<DaemonChannel>>,
}

#[async_trait]
impl ChannelConnector for OneShotConnector {
    async fn connect(&self, _: &Node, _: &Server) -> Result<DaemonChannel, RelayError> {
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RelayError::Connect("connection refused".into()))
    }
}

#[tokio::test]
async fn test_console_bridges_viewer_and_daemon() {
    let (to_relay, inbound) = mpsc::channel(16);
    let (outbound, mut from_relay) = mpsc::channel(16);
    let connector = Arc::new(OneShotConnector {
        channel: Mutex::new(Some(DaemonChannel::new(inbound, outbound, vec![]))),
    });

    let harness = Harness::with_connector(connector).await;
    let fleet = harness.seed_fleet(None).await;
    harness.mock_daemon_create_ok().await;
    harness.mock_daemon_status("running").await;

    let (_, created) = harness.create_server(&fleet).await;
    let server_id = created["id"].as_str().unwrap().to_string();
    let token = created["validation_token"].as_str().unwrap().to_string();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = harness.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let url = format!("ws://{addr}/v1/servers/{server_id}/console?token={token}");
    let (mut viewer, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("console upgrade");

    to_relay
        .send(json!({ "event": "auth_success", "logs": ["[init] ready"] }).to_string())
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), viewer.next())
        .await
        .expect("backlog frame")
        .unwrap()
        .unwrap();
    let event: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(event, json!({ "event": "backlog", "lines": ["[init] ready"] }));

    viewer
        .send(tokio_tungstenite::tungstenite::Message::Text(
            json!({ "event": "send_command", "command": "say hi" })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let forwarded = tokio::time::timeout(Duration::from_secs(5), from_relay.recv())
        .await
        .expect("command forwarded")
        .unwrap();
    let forwarded: Value = serde_json::from_str(&forwarded).unwrap();
    assert_eq!(forwarded["command"], "say hi");

    viewer.close(None).await.unwrap();
}
