//! The tunnel-provider seam.
//!
//! The broker core never touches session internals directly: everything it
//! needs from the tunnel layer is expressed through [`TunnelProvider`], so an
//! alternate provider (or a test double) can be substituted without touching
//! dispatch, mesh, or readiness logic.

use crate::error::BrokerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Opaque identifier for one agent's tunnel session.
///
/// Supplied by the agent at authorization time; unique among concurrently
/// live sessions. Always non-empty (the authorizer rejects empty identities
/// before a session is admitted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId(String);

impl TunnelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One mesh peer: another broker instance we connect out to.
///
/// Immutable once parsed from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Peer broker identifier.
    pub id: String,
    /// Shared token presented when connecting to the peer.
    pub token: String,
    /// Base URL of the peer broker (e.g. `http://host:8099`).
    pub url: String,
}

impl FromStr for PeerDescriptor {
    type Err = BrokerError;

    /// Parse an `id:token:url` triple.
    ///
    /// Splits on `:` into at most three fields so URLs containing colons
    /// survive intact in the third field.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let (id, token, url) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(token), Some(url)) => (id, token, url),
            _ => return Err(BrokerError::InvalidPeer(s.to_string())),
        };
        if id.is_empty() || token.is_empty() || url.is_empty() {
            return Err(BrokerError::InvalidPeer(s.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            token: token.to_string(),
            url: url.to_string(),
        })
    }
}

/// A duplex byte stream opened through a tunnel.
pub type TunnelStream = Box<dyn TunnelIo>;

/// Object-safe bound for tunnel streams.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// Capability surface of the tunnel layer.
///
/// `dial` resolves a tunnel id to a live session, locally or across the peer
/// mesh; the caller cannot (and must not) distinguish the two cases. Session
/// and peer registries behind an implementation are mutated concurrently and
/// must be internally synchronized.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a duplex stream addressed to `tunnel_id`.
    ///
    /// Returns [`BrokerError::TunnelNotFound`] when no live session for the
    /// id is reachable anywhere. No retry happens at this layer.
    async fn dial(
        &self,
        tunnel_id: &TunnelId,
        network: &str,
        address: &str,
    ) -> Result<TunnelStream, BrokerError>;

    /// Whether a session for `tunnel_id` is registered locally.
    fn has_session(&self, tunnel_id: &TunnelId) -> bool;

    /// Ids of all locally registered sessions.
    fn session_ids(&self) -> Vec<TunnelId>;

    /// Register a mesh peer. Fire-and-forget: the provider owns the
    /// connection attempt and its reconnection policy.
    fn add_peer(&self, peer: PeerDescriptor);

    /// Ids of all configured peers, in registration order.
    fn peer_ids(&self) -> Vec<String>;

    /// Whether the peer currently has a live mesh connection, in either
    /// direction.
    fn peer_reachable(&self, peer_id: &str) -> bool;
}
