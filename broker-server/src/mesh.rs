//! Peer mesh manager.
//!
//! Translates the static `id:token:url,...` configuration string into peer
//! registrations on the tunnel provider. Malformed entries are dropped, not
//! fatal; an empty list means the broker runs standalone. Registration is
//! fire-and-forget: the provider owns connection attempts and reconnection,
//! so nothing here blocks startup.

use broker_core::{PeerDescriptor, TunnelProvider};
use std::sync::Arc;
use tracing::{debug, info};

/// Parse a comma-separated peer list, dropping malformed entries.
///
/// Well-formed entries are returned exactly once, in input order.
pub fn parse_peer_list(peers: &str) -> Vec<PeerDescriptor> {
    if peers.trim().is_empty() {
        return Vec::new();
    }

    peers
        .split(',')
        .filter_map(|entry| match entry.trim().parse::<PeerDescriptor>() {
            Ok(peer) => Some(peer),
            Err(e) => {
                debug!("Dropping malformed peer entry: {}", e);
                None
            }
        })
        .collect()
}

/// Register every valid peer from the configuration string with the provider.
pub fn register_peers(provider: &Arc<dyn TunnelProvider>, peers: &str) {
    let parsed = parse_peer_list(peers);
    if parsed.is_empty() {
        info!("No mesh peers configured, running standalone");
        return;
    }

    info!("Registering {} mesh peer(s)", parsed.len());
    for peer in parsed {
        debug!("Registering peer '{}' at {}", peer.id, peer.url);
        provider.add_peer(peer);
    }
}
