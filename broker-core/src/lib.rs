//! Core types and contracts for the reverse-tunnel broker.
//!
//! This crate defines the vocabulary shared between the broker process and
//! anything that implements or consumes a tunnel provider: tunnel
//! identifiers, the provider trait, the authorization adapter, the logical
//! stream frame codec, and lifecycle events.

pub mod auth;
pub mod error;
pub mod event;
pub mod frame;
pub mod provider;

pub use auth::{Authorizer, HeaderAuthorizer, TUNNEL_ID_HEADER};
pub use error::BrokerError;
pub use event::LifecycleEvent;
pub use frame::{DialRequest, Frame, FrameType, StreamId};
pub use provider::{PeerDescriptor, TunnelId, TunnelProvider, TunnelStream};
