//! Shared application state for the HTTP handlers.

use crate::hub::BroadcastHub;
use crate::readiness::ClusterInspector;
use crate::session::SessionManager;
use broker_core::TunnelProvider;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    /// Tunnel provider seam used by the dispatcher and readiness prober.
    pub provider: Arc<dyn TunnelProvider>,
    /// Concrete session manager, needed by the `/connect` upgrade handler.
    pub sessions: Arc<SessionManager>,
    pub hub: Arc<BroadcastHub>,
    pub inspector: Arc<ClusterInspector>,
    pub dial_timeout: Duration,
    pub ack_timeout: Duration,
}
