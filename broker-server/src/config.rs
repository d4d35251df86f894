//! Broker configuration.

use clap::Parser;
use std::time::Duration;

/// Reverse-tunnel broker - routes operator HTTP requests through agent tunnels.
#[derive(Parser, Debug, Clone)]
#[command(name = "broker-server")]
#[command(author, version, about, long_about = None)]
pub struct BrokerConfig {
    /// Listen address for the HTTP server
    #[arg(long, env = "BROKER_LISTEN", default_value = "0.0.0.0:8099")]
    pub listen: String,

    /// This broker's peer id within the mesh
    #[arg(long = "id", env = "BROKER_PEER_ID", default_value = "")]
    pub peer_id: String,

    /// Shared token presented to mesh peers
    #[arg(long = "token", env = "BROKER_PEER_TOKEN", default_value = "")]
    pub peer_token: String,

    /// Mesh peers, format id:token:url,id:token:url
    #[arg(long, env = "BROKER_PEERS", default_value = "")]
    pub peers: String,

    /// Readiness acknowledgment timeout in seconds
    #[arg(long, env = "BROKER_ACK_TIMEOUT", default_value = "40")]
    pub ack_timeout: u64,

    /// Tunnel dial timeout in seconds
    #[arg(long, env = "BROKER_DIAL_TIMEOUT", default_value = "15")]
    pub dial_timeout: u64,

    /// Delay between peer reconnection attempts in seconds
    #[arg(long, env = "BROKER_RECONNECT_DELAY", default_value = "5")]
    pub reconnect_delay: u64,

    /// Enable debug logging
    #[arg(long, env = "BROKER_DEBUG")]
    pub debug: bool,
}

impl BrokerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }
}
