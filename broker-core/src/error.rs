//! Error taxonomy for the broker.
//!
//! Every variant maps to an HTTP status so the dispatcher can surface
//! failures to callers without inspecting error internals. Only socket bind
//! failure at startup is fatal to the process; everything here is a
//! per-request or per-entry condition.

use crate::provider::TunnelId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// No live session for the tunnel id, locally or across the mesh.
    #[error("tunnel '{0}' has no live session")]
    TunnelNotFound(TunnelId),

    /// Tunnel-establishment attempt rejected by the authorizer.
    #[error("authorization rejected: {0}")]
    Unauthorized(String),

    /// Malformed peer-list entry. Dropped by the mesh manager, never fatal.
    #[error("malformed peer entry '{0}'")]
    InvalidPeer(String),

    /// A dial reached a session but the stream could not be opened.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Mid-stream relay failure; the in-flight response is aborted.
    #[error("relay failed: {0}")]
    Relay(String),

    /// A bounded operation ran out of time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// HTTP status surfaced to the caller for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::TunnelNotFound(_) => 502,
            BrokerError::Unauthorized(_) => 401,
            BrokerError::InvalidPeer(_) => 500,
            BrokerError::Dial(_) => 502,
            BrokerError::Relay(_) => 502,
            BrokerError::Timeout(_) => 504,
            BrokerError::Io(_) => 502,
        }
    }
}
