//! Broker Server - reverse-tunnel broker process.
//!
//! Accepts agent tunnels, relays operator HTTP through them, and keeps
//! mesh links to peer brokers for cross-broker dials.

use anyhow::Result;
use axum::http::{header, HeaderName, Method};
use broker_server::config::BrokerConfig;
use broker_server::hub::BroadcastHub;
use broker_server::readiness::ClusterInspector;
use broker_server::session::SessionManager;
use broker_server::state::AppState;
use broker_server::{mesh, router};
use broker_core::{HeaderAuthorizer, TunnelProvider};
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration
    let config = BrokerConfig::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if config.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting broker-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Listen address: {}", config.listen);
    if !config.peer_id.is_empty() {
        info!("Mesh peer id: {}", config.peer_id);
    }

    // Broadcast hub for lifecycle events
    let (hub, hub_rx) = BroadcastHub::new();
    tokio::spawn(hub.clone().run(hub_rx));

    // Tunnel sessions and mesh links
    let sessions = SessionManager::new(
        config.peer_id.clone(),
        config.peer_token.clone(),
        Arc::new(HeaderAuthorizer),
        hub.publisher(),
        config.dial_timeout(),
        config.reconnect_delay(),
    );
    let provider: Arc<dyn TunnelProvider> = sessions.clone();
    mesh::register_peers(&provider, &config.peers);

    // One-shot startup readiness inspection, off the accept path
    let inspector = Arc::new(ClusterInspector::new(provider.clone()));
    let startup_inspector = inspector.clone();
    tokio::spawn(async move {
        startup_inspector.on_start_up().await;
    });

    let state = AppState {
        provider,
        sessions,
        hub,
        inspector,
        dial_timeout: config.dial_timeout(),
        ack_timeout: config.ack_timeout(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers([
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]);

    let app = router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Broker is ready to accept connections");
    axum::serve(listener, app).await?;

    Ok(())
}
