//! Authorization adapter for tunnel establishment.
//!
//! The provider invokes the authorizer once per inbound tunnel-establishment
//! attempt, synchronously, before the session is admitted. Implementations
//! must be side-effect free and fast: they run on the connection-accept path.

use crate::error::BrokerError;
use crate::provider::TunnelId;
use http::HeaderMap;

/// Header an agent uses to declare its tunnel identity.
pub const TUNNEL_ID_HEADER: &str = "x-tunnel-id";

/// Policy deciding whether a tunnel-establishment attempt is admitted.
///
/// `Ok(Some(id))` admits the session under `id`; `Ok(None)` rejects it.
/// Errors are reserved for policies that perform real credential checks.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> Result<Option<TunnelId>, BrokerError>;
}

/// Base policy: accept iff the identity header is present and non-empty,
/// using the header value as the tunnel id. Never errors.
#[derive(Debug, Default, Clone)]
pub struct HeaderAuthorizer;

impl Authorizer for HeaderAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<Option<TunnelId>, BrokerError> {
        let id = headers
            .get(TUNNEL_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if id.is_empty() {
            Ok(None)
        } else {
            Ok(Some(TunnelId::new(id)))
        }
    }
}
