//! Cluster readiness prober.
//!
//! Inspects the tunnel provider's peer and session registries. Startup
//! inspection runs once in the background and never blocks the listener;
//! the acknowledgment operation blocks a single HTTP call, polling until
//! the expected peer set is reachable or a hard timeout elapses. An
//! unreachable peer is a normal, reportable state, never a panic.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use broker_core::TunnelProvider;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Interval between readiness polls inside [`ClusterInspector::acknowledge`].
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time view of mesh reachability.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessSnapshot {
    /// Configured peer ids.
    pub expected: Vec<String>,
    /// Peers with a live mesh connection right now.
    pub reachable: Vec<String>,
    /// Locally registered tunnel sessions.
    pub sessions: usize,
}

impl ReadinessSnapshot {
    /// Ready when every configured peer is reachable. A broker with no
    /// configured peers is standalone and always ready.
    pub fn is_ready(&self) -> bool {
        self.expected
            .iter()
            .all(|id| self.reachable.iter().any(|r| r == id))
    }
}

pub struct ClusterInspector {
    provider: Arc<dyn TunnelProvider>,
}

impl ClusterInspector {
    pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
        Self { provider }
    }

    pub fn snapshot(&self) -> ReadinessSnapshot {
        let expected = self.provider.peer_ids();
        let reachable = expected
            .iter()
            .filter(|id| self.provider.peer_reachable(id))
            .cloned()
            .collect();
        ReadinessSnapshot {
            expected,
            reachable,
            sessions: self.provider.session_ids().len(),
        }
    }

    /// One-shot startup inspection. Spawned at process start; logs the
    /// aggregate health of the configured peer set.
    pub async fn on_start_up(&self) {
        let snapshot = self.snapshot();
        info!(
            "Startup readiness: {}/{} peer(s) reachable, {} local session(s)",
            snapshot.reachable.len(),
            snapshot.expected.len(),
            snapshot.sessions
        );
        for id in &snapshot.expected {
            if snapshot.reachable.iter().any(|r| r == id) {
                info!("Peer '{}' reachable", id);
            } else {
                warn!("Peer '{}' not reachable yet", id);
            }
        }
    }

    /// Block until the expected peer set is fully reachable or `timeout`
    /// elapses. The timeout is a hard upper bound on the wait; on expiry the
    /// last snapshot is returned with `ready = false`.
    pub async fn acknowledge(&self, timeout: Duration) -> (bool, ReadinessSnapshot) {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot();
            if snapshot.is_ready() {
                return (true, snapshot);
            }

            let now = Instant::now();
            if now >= deadline {
                return (false, snapshot);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// `GET /health` - liveness, always 200.
pub async fn health() -> &'static str {
    "broker is running"
}

/// `GET /healthaknowlegment` - readiness, bounded by the configured timeout.
/// Route spelling preserved from the published operational surface.
pub async fn acknowledge_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (ready, snapshot) = state.inspector.acknowledge(state.ack_timeout).await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_core::{BrokerError, PeerDescriptor, TunnelId, TunnelStream};
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;

    struct FakeProvider {
        peers: Vec<String>,
        reachable: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn new(peers: &[&str], reachable: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                peers: peers.iter().map(|s| s.to_string()).collect(),
                reachable: Mutex::new(reachable.iter().map(|s| s.to_string()).collect()),
            })
        }

        fn mark_reachable(&self, id: &str) {
            self.reachable.lock().unwrap().push(id.to_string());
        }
    }

    #[async_trait]
    impl TunnelProvider for FakeProvider {
        async fn dial(
            &self,
            tunnel_id: &TunnelId,
            _network: &str,
            _address: &str,
        ) -> Result<TunnelStream, BrokerError> {
            Err(BrokerError::TunnelNotFound(tunnel_id.clone()))
        }

        fn has_session(&self, _tunnel_id: &TunnelId) -> bool {
            false
        }

        fn session_ids(&self) -> Vec<TunnelId> {
            Vec::new()
        }

        fn add_peer(&self, _peer: PeerDescriptor) {}

        fn peer_ids(&self) -> Vec<String> {
            self.peers.clone()
        }

        fn peer_reachable(&self, peer_id: &str) -> bool {
            self.reachable.lock().unwrap().iter().any(|r| r == peer_id)
        }
    }

    #[tokio::test]
    async fn test_fully_reachable_returns_before_timeout() {
        let provider = FakeProvider::new(&["a", "b"], &["a", "b"]);
        let inspector = ClusterInspector::new(provider);

        let start = StdInstant::now();
        let (ready, snapshot) = inspector.acknowledge(Duration::from_secs(5)).await;
        assert!(ready);
        assert!(snapshot.is_ready());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unreachable_returns_only_after_full_timeout() {
        let provider = FakeProvider::new(&["a"], &[]);
        let inspector = ClusterInspector::new(provider);

        let timeout = Duration::from_millis(300);
        let start = StdInstant::now();
        let (ready, snapshot) = inspector.acknowledge(timeout).await;
        assert!(!ready);
        assert_eq!(snapshot.reachable.len(), 0);
        assert!(start.elapsed() >= timeout);
    }

    #[tokio::test]
    async fn test_becomes_ready_mid_wait() {
        let provider = FakeProvider::new(&["a"], &[]);
        let inspector = ClusterInspector::new(provider.clone());

        let flipper = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flipper.mark_reachable("a");
        });

        let start = StdInstant::now();
        let (ready, _) = inspector.acknowledge(Duration::from_secs(10)).await;
        assert!(ready);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_peers_is_immediately_ready() {
        let provider = FakeProvider::new(&[], &[]);
        let inspector = ClusterInspector::new(provider);

        let (ready, snapshot) = inspector.acknowledge(Duration::from_secs(5)).await;
        assert!(ready);
        assert_eq!(snapshot.expected.len(), 0);
    }

    #[tokio::test]
    async fn test_startup_inspection_never_panics_on_unreachable() {
        let provider = FakeProvider::new(&["a", "b"], &["a"]);
        let inspector = ClusterInspector::new(provider);
        inspector.on_start_up().await;
    }
}
