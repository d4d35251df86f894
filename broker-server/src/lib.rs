//! Reverse-tunnel broker server.
//!
//! Agents behind NAT connect outbound to `/connect` and keep a websocket
//! session open. Operators issue plain HTTP against
//! `/connections/{id}/{path}` and the broker relays each request through
//! the agent's tunnel. Brokers can be meshed: a dial for a tunnel homed on
//! another broker is forwarded over a peer link and resolved there.

pub mod config;
pub mod hub;
pub mod mesh;
pub mod proxy;
pub mod readiness;
pub mod session;
pub mod state;

use axum::{
    routing::{any, get},
    Router,
};
use state::AppState;

/// Full broker route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/connect", get(session::connect_handler))
        .route("/connections/:id", any(proxy::dispatch_root))
        .route("/connections/:id/*path", any(proxy::dispatch))
        .route("/monitoring", get(hub::serve_monitoring))
        .route("/outbound", get(hub::serve_outbound))
        .route("/health", get(readiness::health))
        .route("/healthaknowlegment", get(readiness::acknowledge_handler))
        .with_state(state)
}
