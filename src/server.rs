//! Endpoint server
//!
//! One HTTP listener serves the relay: WebSocket upgrades for room
//! connections from viewers and ingest nodes and for inbound mesh
//! handshakes, plus the optional operator control endpoint that takes one
//! JSON command per POST. TLS is used when a certificate is configured.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::header::{self, HeaderValue};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, StatusCode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::common::flag_raised;
use crate::relay::{serve_room_connection, Relay};
use crate::transport::{Channel, ControlCommand, ControlReply};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),
}

/// Load TLS certificates from PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(ServerError::NoPrivateKey(path.to_path_buf()))
}

/// Create TLS acceptor from certificate and key files
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// What an upgraded connection is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Room(String),
    Mesh,
    Control,
}

impl Route {
    pub fn parse(path: &str) -> Option<Route> {
        let path = path.split('?').next().unwrap_or(path);
        match path {
            "/api/mesh" => Some(Route::Mesh),
            "/api/control" => Some(Route::Control),
            _ => {
                let room = path.strip_prefix("/api/ws/")?;
                if room.is_empty() || room.contains('/') {
                    None
                } else {
                    Some(Route::Room(room.to_string()))
                }
            }
        }
    }
}

/// WebSocket endpoints
enum Socket {
    Room(String),
    Mesh,
}

/// Request headers carry a WebSocket upgrade; returns the client key
fn websocket_key(request: &Request<Body>) -> Option<&str> {
    let headers = request.headers();
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    if !upgrade {
        return None;
    }
    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
}

fn text_response(status: StatusCode, text: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(text.to_string()));
    *response.status_mut() = status;
    response
}

fn control_response(status: StatusCode, ok: bool, message: String) -> Response<Body> {
    let body = serde_json::to_vec(&ControlReply { ok, message }).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Any origin may call the endpoints
fn allow_any_origin(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    let any = HeaderValue::from_static("*");
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, any);
    response
}

pub struct EndpointServer {
    relay: Arc<Relay>,
    tls: Option<TlsAcceptor>,
    control_secret: Option<String>,
}

impl EndpointServer {
    pub fn new(relay: Arc<Relay>, tls: Option<TlsAcceptor>, control_secret: Option<String>) -> Self {
        Self {
            relay,
            tls,
            control_secret: control_secret.filter(|secret| !secret.is_empty()),
        }
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        info!(
            "Endpoint server listening on {} ({})",
            listener.local_addr()?,
            if self.tls.is_some() { "https" } else { "http" }
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        let server = self.clone();
                        match self.tls.clone() {
                            Some(acceptor) => {
                                tokio::spawn(async move {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => server.serve_http(tls_stream, peer_addr).await,
                                        Err(e) => warn!("TLS handshake failed for {}: {}", peer_addr, e),
                                    }
                                });
                            }
                            None => {
                                tokio::spawn(async move { server.serve_http(stream, peer_addr).await });
                            }
                        }
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = flag_raised(&mut shutdown) => {
                    info!("Endpoint server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_http<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |request| {
            let server = self.clone();
            async move { Ok::<_, Infallible>(server.handle(request, peer_addr).await) }
        });
        if let Err(e) = Http::new()
            .http1_only(true)
            .serve_connection(stream, service)
            .with_upgrades()
            .await
        {
            debug!("HTTP connection from {} ended: {}", peer_addr, e);
        }
    }

    async fn handle(self: Arc<Self>, request: Request<Body>, peer_addr: SocketAddr) -> Response<Body> {
        let route = match Route::parse(request.uri().path()) {
            Some(Route::Control) if self.control_secret.is_none() => None,
            route => route,
        };
        let Some(route) = route else {
            return text_response(StatusCode::NOT_FOUND, "not found");
        };
        if request.method() == Method::OPTIONS {
            return allow_any_origin(text_response(StatusCode::OK, ""));
        }

        let response = match route {
            Route::Control => self.handle_control(request).await,
            Route::Room(room) => self.upgrade(request, Socket::Room(room), peer_addr),
            Route::Mesh => self.upgrade(request, Socket::Mesh, peer_addr),
        };
        allow_any_origin(response)
    }

    /// Answer the WebSocket handshake and serve the socket once upgraded
    fn upgrade(self: Arc<Self>, mut request: Request<Body>, socket: Socket, peer_addr: SocketAddr) -> Response<Body> {
        let Some(key) = websocket_key(&request) else {
            return text_response(StatusCode::BAD_REQUEST, "expected a WebSocket upgrade");
        };
        let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
            return text_response(StatusCode::BAD_REQUEST, "invalid WebSocket key");
        };

        let on_upgrade = hyper::upgrade::on(&mut request);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let ws_stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                    self.serve_websocket(ws_stream, socket, peer_addr).await;
                }
                Err(e) => debug!("WebSocket upgrade failed for {}: {}", peer_addr, e),
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        response
    }

    async fn serve_websocket(&self, ws_stream: WebSocketStream<Upgraded>, socket: Socket, peer_addr: SocketAddr) {
        let (channel, inbox) = Channel::spawn(ws_stream, peer_addr.to_string());
        match socket {
            Socket::Room(room) => {
                if let Err(e) = serve_room_connection(self.relay.clone(), room.clone(), channel, inbox).await {
                    warn!("Room {} connection from {} ended: {}", room, peer_addr, e);
                }
            }
            Socket::Mesh => {
                if let Err(e) = self.relay.mesh().accept_connection(channel, inbox).await {
                    debug!("Mesh connection from {} refused: {}", peer_addr, e);
                }
            }
        }
    }

    /// One operator command per POST request
    async fn handle_control(&self, request: Request<Body>) -> Response<Body> {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| Some(value) == self.control_secret.as_deref());
        if !authorized {
            return control_response(
                StatusCode::UNAUTHORIZED,
                false,
                "missing or invalid Authorization header".to_string(),
            );
        }
        if request.method() != Method::POST {
            return control_response(StatusCode::METHOD_NOT_ALLOWED, false, "expected POST".to_string());
        }

        let body = match hyper::body::to_bytes(request.into_body()).await {
            Ok(body) => body,
            Err(e) => {
                return control_response(StatusCode::BAD_REQUEST, false, format!("failed to read body: {}", e))
            }
        };
        let command = match serde_json::from_slice::<ControlCommand>(&body) {
            Ok(command) => command,
            Err(e) => {
                debug!("Invalid control message: {}", e);
                return control_response(
                    StatusCode::BAD_REQUEST,
                    false,
                    format!("invalid control message: {}", e),
                );
            }
        };

        match command {
            ControlCommand::JoinMesh(address) if address.is_empty() => {
                control_response(StatusCode::BAD_REQUEST, false, "missing relay address".to_string())
            }
            ControlCommand::JoinMesh(address) => {
                info!("Control: joining relay at {}", address);
                match self.relay.mesh().connect_to_relay(&address).await {
                    Ok(relay_id) => control_response(StatusCode::OK, true, format!("joined relay {}", relay_id)),
                    Err(e) => {
                        warn!("Control: failed to join {}: {}", address, e);
                        control_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            false,
                            format!("failed to join mesh network: {}", e),
                        )
                    }
                }
            }
        }
    }
}
