//! nestri-relay - WebRTC stream relay with a federated relay mesh

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nestri_relay::media::WebRtcFactory;
use nestri_relay::server::create_tls_acceptor;
use nestri_relay::{EndpointServer, Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    config.validate()?;
    config.log_settings();

    let tls = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key).context("loading TLS certificate")?)
        }
        _ => {
            warn!("TLS disabled - running in plain WebSocket mode");
            None
        }
    };

    let media = WebRtcFactory::new(&config.media_settings()).context("setting up WebRTC")?;
    let relay = Relay::new(Arc::new(media), config.mesh_timings());
    info!("Relay {} ready", relay.id());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = relay.start(shutdown_rx.clone());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.endpoint_port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let server = Arc::new(EndpointServer::new(
        relay.clone(),
        tls,
        config.control_secret.clone(),
    ));
    tasks.push(tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = server.run(listener, shutdown).await {
                warn!("Endpoint server stopped: {}", e);
            }
        }
    }));

    for address in &config.mesh_peers {
        let mesh = relay.mesh().clone();
        let address = address.clone();
        tokio::spawn(async move {
            match mesh.connect_to_relay(&address).await {
                Ok(peer) => info!("Joined mesh through {} ({})", address, peer),
                Err(e) => warn!("Could not join mesh through {}: {}", address, e),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send_replace(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
