//! Frame codec for logical streams over a single tunnel connection.
//!
//! Many logical byte streams share one websocket. Each frame carries a
//! stream id; the accepting end of a connection allocates even ids, the
//! initiating end odd ids, so the two sides never collide.

use crate::provider::TunnelId;
use serde::{Deserialize, Serialize};

/// Identifier for one logical stream within a tunnel connection.
pub type StreamId = u32;

/// Frame kinds exchanged over a tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Request to open a logical stream; payload is a [`DialRequest`].
    Open,
    /// The remote accepted an `Open`.
    OpenAck,
    /// Stream bytes.
    Data,
    /// Orderly end of a stream.
    Close,
    /// Stream failed; payload is a UTF-8 message.
    Error,
}

/// Target of an `Open` frame.
///
/// `tunnel_id: Some(..)` is a mesh-forwarded dial: the receiving broker
/// resolves the id against its *local* sessions only, never forwarding
/// again, so forwarded dials cannot loop. `None` means the receiving end
/// itself terminates the stream (an agent connecting to `address`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRequest {
    pub tunnel_id: Option<TunnelId>,
    pub network: String,
    pub address: String,
}

/// One frame on the wire, bincode-encoded inside a binary websocket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn open(stream_id: StreamId, request: &DialRequest) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Open,
            payload: bincode::serialize(request).unwrap_or_default(),
        }
    }

    pub fn open_ack(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::OpenAck,
            payload: Vec::new(),
        }
    }

    pub fn data(stream_id: StreamId, data: Vec<u8>) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Data,
            payload: data,
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Close,
            payload: Vec::new(),
        }
    }

    pub fn error(stream_id: StreamId, message: &str) -> Self {
        Self {
            stream_id,
            frame_type: FrameType::Error,
            payload: message.as_bytes().to_vec(),
        }
    }

    /// Decode an `Open` payload.
    pub fn dial_request(&self) -> Option<DialRequest> {
        if self.frame_type != FrameType::Open {
            return None;
        }
        bincode::deserialize(&self.payload).ok()
    }

    /// Error payload as text, for `Error` frames.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::data(4, vec![1, 2, 3]);
        let restored = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(restored.stream_id, 4);
        assert_eq!(restored.frame_type, FrameType::Data);
        assert_eq!(restored.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_open_carries_dial_request() {
        let request = DialRequest {
            tunnel_id: Some(TunnelId::new("agent-1")),
            network: "tcp".to_string(),
            address: "127.0.0.1:80".to_string(),
        };
        let frame = Frame::open(7, &request);
        let restored = Frame::from_bytes(&frame.to_bytes()).unwrap();
        let decoded = restored.dial_request().unwrap();
        assert_eq!(decoded.tunnel_id, Some(TunnelId::new("agent-1")));
        assert_eq!(decoded.address, "127.0.0.1:80");
    }

    #[test]
    fn test_dial_request_only_on_open() {
        let frame = Frame::close(1);
        assert!(frame.dial_request().is_none());
    }

    #[test]
    fn test_error_message() {
        let frame = Frame::error(2, "not found");
        assert_eq!(frame.error_message(), "not found");
    }
}
