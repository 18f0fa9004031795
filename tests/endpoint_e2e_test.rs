//! E2E tests for the endpoint server
//!
//! Runs the real WebSocket server on an ephemeral port and talks to it with
//! tokio-tungstenite and hyper, covering room joins, mesh joins and the
//! control endpoint.

mod common;

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hyper::{Body, Method, Request};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{eventually, test_relay, FakeMedia};

use nestri_relay::transport::{AnswerType, ClientMessage, ControlCommand, ControlReply, JoinerType};
use nestri_relay::{EndpointServer, Relay};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Find an available port for testing
fn find_available_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

struct TestServer {
    relay: Arc<Relay>,
    port: u16,
    shutdown: watch::Sender<bool>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{}", self.port, path)
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Helper to start an endpoint server in background
async fn start_test_server(control_secret: Option<&str>) -> TestServer {
    let port = find_available_port();
    let relay = test_relay(FakeMedia::new());
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("Failed to bind test server");
    let (shutdown, shutdown_rx) = watch::channel(false);

    let server = Arc::new(EndpointServer::new(
        relay.clone(),
        None,
        control_secret.map(str::to_string),
    ));
    tokio::spawn(async move {
        let _ = server.run(listener, shutdown_rx).await;
    });

    TestServer {
        relay,
        port,
        shutdown,
    }
}

async fn send_json<T: serde::Serialize>(ws: &mut Client, message: &T) {
    let text = serde_json::to_string(message).unwrap();
    ws.send(Message::Text(text)).await.expect("send");
}

async fn recv_json<T: serde::de::DeserializeOwned>(ws: &mut Client) -> T {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("valid json");
        }
    }
}

/// Test: Viewer joins a room over WebSocket
/// Given a running endpoint server
/// When a viewer joins a room with no ingest
/// Then it is told the room is offline, then ok
#[tokio::test]
async fn test_viewer_join_over_websocket() {
    let server = start_test_server(None).await;

    let (mut ws, _) = connect_async(server.url("/api/ws/lobby"))
        .await
        .expect("Failed to connect");
    send_json(
        &mut ws,
        &ClientMessage::Join {
            joiner_type: JoinerType::Client,
        },
    )
    .await;

    let first: ClientMessage = recv_json(&mut ws).await;
    assert_eq!(first, ClientMessage::answer(AnswerType::Offline));
    let second: ClientMessage = recv_json(&mut ws).await;
    assert_eq!(second, ClientMessage::answer(AnswerType::Ok));

    assert!(server.relay.get_room_by_name("lobby").is_some());
    let _ = ws.close(None).await;
    assert!(eventually(|| server.relay.get_room_by_name("lobby").is_none()).await);
}

/// Test: Unknown paths are refused during the upgrade
#[tokio::test]
async fn test_unknown_path_rejected() {
    let server = start_test_server(None).await;

    let result = connect_async(server.url("/api/nothing")).await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }
}

/// Test: Two servers form a mesh through the mesh endpoint
#[tokio::test]
async fn test_relays_join_over_websocket() {
    let a = start_test_server(None).await;
    let b = start_test_server(None).await;

    let peer = b
        .relay
        .mesh()
        .connect_to_relay(&a.url("/api/mesh"))
        .await
        .expect("mesh join");

    assert_eq!(peer, a.relay.id());
    assert!(eventually(|| a.relay.mesh().is_connected(&b.relay.id())).await);
}

/// Send one request to the control endpoint, returning status and reply
async fn control_request(
    server: &TestServer,
    method: Method,
    secret: Option<&str>,
    body: &str,
) -> (hyper::StatusCode, Option<ControlReply>) {
    let mut builder = Request::builder()
        .method(method)
        .uri(server.http_url("/api/control"));
    if let Some(secret) = secret {
        builder = builder.header(hyper::header::AUTHORIZATION, secret);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();
    let response = hyper::Client::new()
        .request(request)
        .await
        .expect("control request");
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, serde_json::from_slice(&bytes).ok())
}

/// Test: The control endpoint requires the configured secret
/// Given a relay with a control secret
/// When a command arrives with a wrong or missing Authorization header
/// Then it is refused with 401, and a relay without a secret has no control endpoint
#[tokio::test]
async fn test_control_requires_secret() {
    let server = start_test_server(Some("hunter2")).await;
    let body = r#"{"type":"join_mesh","value":"relay-b:8088"}"#;

    let (status, reply) = control_request(&server, Method::POST, Some("wrong"), body).await;
    assert_eq!(status, hyper::StatusCode::UNAUTHORIZED);
    assert!(!reply.expect("json reply").ok);

    let (status, _) = control_request(&server, Method::POST, None, body).await;
    assert_eq!(status, hyper::StatusCode::UNAUTHORIZED);

    let disabled = start_test_server(None).await;
    let (status, _) = control_request(&disabled, Method::POST, Some("hunter2"), body).await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);
}

/// Test: Malformed control commands are answered with 400
#[tokio::test]
async fn test_control_bad_request() {
    let server = start_test_server(Some("hunter2")).await;

    let (status, _) = control_request(&server, Method::POST, Some("hunter2"), "not json").await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);

    let (status, _) =
        control_request(&server, Method::POST, Some("hunter2"), r#"{"type":"reboot","value":""}"#).await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);

    let (status, reply) =
        control_request(&server, Method::POST, Some("hunter2"), r#"{"type":"join_mesh","value":""}"#).await;
    assert_eq!(status, hyper::StatusCode::BAD_REQUEST);
    assert_eq!(reply.unwrap().message, "missing relay address");
}

/// Test: CORS preflight is answered without credentials
#[tokio::test]
async fn test_control_preflight() {
    let server = start_test_server(Some("hunter2")).await;

    let (status, _) = control_request(&server, Method::OPTIONS, None, "").await;
    assert_eq!(status, hyper::StatusCode::OK);
}

/// Test: join_mesh through the control endpoint
/// Given two running relays, one with a control secret
/// When an operator posts join_mesh with the other relay's address
/// Then the reply is ok and the relays are peers
#[tokio::test]
async fn test_control_join_mesh() {
    let a = start_test_server(None).await;
    let b = start_test_server(Some("hunter2")).await;

    let command = serde_json::to_string(&ControlCommand::JoinMesh(a.url("/api/mesh"))).unwrap();
    let (status, reply) = control_request(&b, Method::POST, Some("hunter2"), &command).await;

    let reply = reply.expect("json reply");
    assert_eq!(status, hyper::StatusCode::OK, "join failed: {}", reply.message);
    assert!(reply.ok);
    assert!(b.relay.mesh().is_connected(&a.relay.id()));
    assert!(eventually(|| a.relay.mesh().is_connected(&b.relay.id())).await);
}

/// Test: An unreachable peer is reported as a server error
#[tokio::test]
async fn test_control_join_mesh_unreachable() {
    let server = start_test_server(Some("hunter2")).await;
    let unused = find_available_port();

    let command =
        serde_json::to_string(&ControlCommand::JoinMesh(format!("ws://127.0.0.1:{}/api/mesh", unused))).unwrap();
    let (status, reply) = control_request(&server, Method::POST, Some("hunter2"), &command).await;

    assert_eq!(status, hyper::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!reply.unwrap().ok);
    assert_eq!(server.relay.mesh().peer_count(), 0);
}
