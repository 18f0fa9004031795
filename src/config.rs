//! Relay configuration
//!
//! Every setting can be given as a flag or through the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use thiserror::Error;
use tracing::{info, warn};

use crate::media::MediaSettings;
use crate::mesh::MeshTimings;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("WebRTC UDP range {0}-{1} is empty")]
    InvalidUdpRange(u16, u16),

    #[error("Both --tls-cert and --tls-key must be provided for TLS")]
    IncompleteTls,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// WebRTC stream relay with a federated relay mesh
#[derive(Parser, Debug, Clone)]
#[command(name = "nestri-relay")]
#[command(about = "WebRTC stream relay with a federated relay mesh")]
#[command(version)]
pub struct RelayConfig {
    /// Enable verbose logging
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,

    /// Enable debug mode (trace logging, including the WebRTC stack)
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Port of the HTTP/WebSocket endpoint
    #[arg(long, env = "ENDPOINT_PORT", default_value_t = 8088)]
    pub endpoint_port: u16,

    /// First UDP port for WebRTC
    #[arg(long, env = "WEBRTC_UDP_START", default_value_t = 10000)]
    pub webrtc_udp_start: u16,

    /// Last UDP port for WebRTC
    #[arg(long, env = "WEBRTC_UDP_END", default_value_t = 20000)]
    pub webrtc_udp_end: u16,

    /// STUN server (host:port)
    #[arg(long, env = "STUN_SERVER", default_value = "stun.l.google.com:19302")]
    pub stun_server: String,

    /// Advertise the primary local address as a NAT 1:1 address
    #[arg(long, env = "AUTO_ADD_LOCAL_IP", default_value_t = true, action = ArgAction::Set)]
    pub auto_add_local_ip: bool,

    /// Public addresses to advertise, comma separated
    #[arg(long, env = "WEBRTC_NAT_IPS", value_delimiter = ',')]
    pub webrtc_nat_ips: Vec<String>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Secret for the control endpoint; the endpoint is disabled without one
    #[arg(long, env = "CONTROL_SECRET")]
    pub control_secret: Option<String>,

    /// Peer relay addresses to join at startup, comma separated
    #[arg(long = "join", env = "MESH_PEERS", value_delimiter = ',')]
    pub mesh_peers: Vec<String>,

    /// Heartbeat period in seconds
    #[arg(long, env = "MESH_HEARTBEAT_INTERVAL", default_value_t = 5)]
    pub heartbeat_interval: u64,

    /// Heartbeat silence in seconds before a peer is suspected
    #[arg(long, env = "MESH_HEARTBEAT_TIMEOUT", default_value_t = 15)]
    pub heartbeat_timeout: u64,

    /// Retransmission sweep period in seconds
    #[arg(long, env = "MESH_RETRANSMIT_INTERVAL", default_value_t = 10)]
    pub retransmit_interval: u64,

    /// Seconds before an unacknowledged state update is resent
    #[arg(long, env = "MESH_ACK_TIMEOUT", default_value_t = 10)]
    pub ack_timeout: u64,

    /// Seconds to wait for a handshake reply
    #[arg(long, env = "MESH_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    pub handshake_timeout: u64,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webrtc_udp_start > self.webrtc_udp_end {
            return Err(ConfigError::InvalidUdpRange(
                self.webrtc_udp_start,
                self.webrtc_udp_end,
            ));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        for (name, secs) in [
            ("heartbeat-interval", self.heartbeat_interval),
            ("heartbeat-timeout", self.heartbeat_timeout),
            ("retransmit-interval", self.retransmit_interval),
            ("ack-timeout", self.ack_timeout),
            ("handshake-timeout", self.handshake_timeout),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    pub fn mesh_timings(&self) -> MeshTimings {
        MeshTimings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            retransmit_interval: Duration::from_secs(self.retransmit_interval),
            ack_timeout: Duration::from_secs(self.ack_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
        }
    }

    pub fn media_settings(&self) -> MediaSettings {
        let mut nat_ips: Vec<String> = self
            .webrtc_nat_ips
            .iter()
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect();

        if self.auto_add_local_ip {
            match local_ip_address::local_ip() {
                Ok(ip) => {
                    let ip = ip.to_string();
                    if !nat_ips.contains(&ip) {
                        nat_ips.push(ip);
                    }
                }
                Err(e) => warn!("Could not detect local IP: {}", e),
            }
        }

        MediaSettings {
            udp_port_start: self.webrtc_udp_start,
            udp_port_end: self.webrtc_udp_end,
            stun_server: self.stun_server.clone(),
            nat_ips,
        }
    }

    /// Default filter directive for the log subscriber
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "trace"
        } else if self.verbose {
            "debug,webrtc=info,webrtc_ice=info,webrtc_sctp=info"
        } else {
            "info,webrtc=warn,webrtc_ice=warn,webrtc_sctp=warn"
        }
    }

    /// Log every effective setting
    pub fn log_settings(&self) {
        info!("Relay settings:");
        info!("  verbose: {}", self.verbose);
        info!("  debug: {}", self.debug);
        info!("  endpoint port: {}", self.endpoint_port);
        info!("  WebRTC UDP range: {}-{}", self.webrtc_udp_start, self.webrtc_udp_end);
        info!("  STUN server: {}", self.stun_server);
        info!("  auto add local IP: {}", self.auto_add_local_ip);
        info!("  NAT IPs: {:?}", self.webrtc_nat_ips);
        info!("  TLS: {}", self.tls_cert.is_some());
        info!("  control endpoint: {}", self.control_secret.is_some());
        info!("  mesh peers: {:?}", self.mesh_peers);
        info!("  mesh timings: {:?}", self.mesh_timings());
    }
}
