//! Connection lifecycle events for the broadcast hub.
//!
//! Events are serialized to opaque JSON bytes at the producer; the hub and
//! its subscribers never interpret them.

use crate::provider::TunnelId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum LifecycleEvent {
    /// A tunnel session was admitted and registered.
    Connected { tunnel_id: TunnelId, peer: bool },
    /// A session's underlying connection closed.
    Disconnected { tunnel_id: TunnelId },
    /// A session's underlying connection failed.
    Errored { tunnel_id: TunnelId, message: String },
}

impl LifecycleEvent {
    pub fn connected(tunnel_id: TunnelId, peer: bool) -> Self {
        Self::Connected { tunnel_id, peer }
    }

    pub fn disconnected(tunnel_id: TunnelId) -> Self {
        Self::Disconnected { tunnel_id }
    }

    pub fn errored(tunnel_id: TunnelId, message: impl Into<String>) -> Self {
        Self::Errored {
            tunnel_id,
            message: message.into(),
        }
    }

    /// Serialize for the hub's byte-payload channel.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}
