//! End-to-end tests: a real broker on a local port, a fake agent speaking
//! the tunnel protocol over a websocket, and a plain HTTP client on the
//! operator side.

use broker_core::{
    Frame, FrameType, HeaderAuthorizer, PeerDescriptor, TunnelId, TunnelProvider,
    TUNNEL_ID_HEADER,
};
use broker_server::hub::BroadcastHub;
use broker_server::readiness::ClusterInspector;
use broker_server::router;
use broker_server::session::{SessionManager, PEER_TOKEN_HEADER};
use broker_server::state::AppState;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest,
    tungstenite::protocol::Message,
};

async fn start_broker() -> (SocketAddr, AppState) {
    let (hub, hub_rx) = BroadcastHub::new();
    tokio::spawn(hub.clone().run(hub_rx));

    let sessions = SessionManager::new(
        "test-broker",
        "mesh-secret",
        Arc::new(HeaderAuthorizer),
        hub.publisher(),
        Duration::from_secs(2),
        Duration::from_secs(1),
    );
    let provider: Arc<dyn TunnelProvider> = sessions.clone();
    let state = AppState {
        inspector: Arc::new(ClusterInspector::new(provider.clone())),
        provider,
        sessions,
        hub,
        dial_timeout: Duration::from_secs(2),
        ack_timeout: Duration::from_millis(200),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Fake agent: connects to `/connect` with the given tunnel id, acks every
/// open, and once a logical stream has received a full HTTP request head
/// replies with the canned `response` bytes followed by a close.
fn spawn_fake_agent(addr: SocketAddr, tunnel_id: &str, response: Vec<u8>) {
    let tunnel_id = tunnel_id.to_string();
    tokio::spawn(async move {
        let mut request = format!("ws://{}/connect", addr)
            .as_str()
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(TUNNEL_ID_HEADER, tunnel_id.parse().unwrap());
        let (stream, _) = connect_async(request).await.unwrap();
        let (mut tx, mut rx) = stream.split();

        let mut inbound: HashMap<u32, Vec<u8>> = HashMap::new();
        while let Some(Ok(message)) = rx.next().await {
            let Message::Binary(data) = message else { continue };
            let Some(frame) = Frame::from_bytes(&data) else { continue };
            match frame.frame_type {
                FrameType::Open => {
                    tx.send(Message::Binary(Frame::open_ack(frame.stream_id).to_bytes()))
                        .await
                        .unwrap();
                }
                FrameType::Data => {
                    let buffer = inbound.entry(frame.stream_id).or_default();
                    buffer.extend_from_slice(&frame.payload);
                    if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
                        tx.send(Message::Binary(
                            Frame::data(frame.stream_id, response.clone()).to_bytes(),
                        ))
                        .await
                        .unwrap();
                        tx.send(Message::Binary(Frame::close(frame.stream_id).to_bytes()))
                            .await
                            .unwrap();
                        inbound.remove(&frame.stream_id);
                    }
                }
                _ => {}
            }
        }
    });
}

async fn wait_for_session(state: &AppState, tunnel_id: &str) {
    let id = TunnelId::new(tunnel_id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !state.provider.has_session(&id) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "tunnel '{}' never connected",
            tunnel_id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_operator_request_relayed_through_agent_tunnel() {
    let (addr, state) = start_broker().await;
    spawn_fake_agent(
        addr,
        "agent-1",
        b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 12\r\n\r\nagent online".to_vec(),
    );
    wait_for_session(&state, "agent-1").await;

    let response = reqwest::get(format!("http://{}/connections/agent-1/status", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "agent online");
}

#[tokio::test]
async fn test_unknown_tunnel_is_bad_gateway() {
    let (addr, _state) = start_broker().await;

    let response = reqwest::get(format!("http://{}/connections/missing-id/status", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert!(response.text().await.unwrap().contains("missing-id"));
}

#[tokio::test]
async fn test_connect_without_identity_rejected() {
    let (addr, _state) = start_broker().await;

    let request = format!("ws://{}/connect", addr)
        .as_str()
        .into_client_request()
        .unwrap();
    let error = connect_async(request).await.unwrap_err();
    match error {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_tunnel_id_rejected_with_conflict() {
    let (addr, state) = start_broker().await;
    spawn_fake_agent(addr, "dup-agent", Vec::new());
    wait_for_session(&state, "dup-agent").await;

    let mut request = format!("ws://{}/connect", addr)
        .as_str()
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(TUNNEL_ID_HEADER, "dup-agent".parse().unwrap());
    let error = connect_async(request).await.unwrap_err();
    match error {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 409);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_peer_link_requires_matching_token() {
    let (addr, state) = start_broker().await;
    // Registering the peer makes "peer-x" a mesh identity; its url is
    // never reachable in this test.
    state.provider.add_peer(PeerDescriptor {
        id: "peer-x".to_string(),
        token: "their-secret".to_string(),
        url: "http://127.0.0.1:9".to_string(),
    });

    let mut request = format!("ws://{}/connect", addr)
        .as_str()
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(TUNNEL_ID_HEADER, "peer-x".parse().unwrap());
    request
        .headers_mut()
        .insert(PEER_TOKEN_HEADER, "totally-wrong".parse().unwrap());
    let error = connect_async(request).await.unwrap_err();
    match error {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 403);
        }
        other => panic!("expected HTTP rejection, got {:?}", other),
    }

    // The broker's own token admits the link.
    let mut request = format!("ws://{}/connect", addr)
        .as_str()
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(TUNNEL_ID_HEADER, "peer-x".parse().unwrap());
    request
        .headers_mut()
        .insert(PEER_TOKEN_HEADER, "mesh-secret".parse().unwrap());
    connect_async(request).await.expect("valid peer token rejected");
}

#[tokio::test]
async fn test_monitoring_subscriber_sees_lifecycle_events() {
    let (addr, state) = start_broker().await;

    let (monitor, _) = connect_async(format!("ws://{}/monitoring", addr))
        .await
        .unwrap();
    let (_tx, mut monitor_rx) = monitor.split();

    spawn_fake_agent(addr, "watched-agent", Vec::new());
    wait_for_session(&state, "watched-agent").await;

    let message = tokio::time::timeout(Duration::from_secs(2), monitor_rx.next())
        .await
        .expect("no event before timeout")
        .unwrap()
        .unwrap();
    let Message::Binary(payload) = message else {
        panic!("expected binary event frame");
    };
    let event: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(event["event"], "connected");
    assert_eq!(event["tunnel_id"], "watched-agent");
}

#[tokio::test]
async fn test_health_and_readiness_endpoints() {
    let (addr, _state) = start_broker().await;

    let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), "broker is running");

    // No peers configured: standalone broker is immediately ready.
    let ready = reqwest::get(format!("http://{}/healthaknowlegment", addr))
        .await
        .unwrap();
    assert_eq!(ready.status(), reqwest::StatusCode::OK);
    let snapshot: serde_json::Value = ready.json().await.unwrap();
    assert_eq!(snapshot["expected"].as_array().unwrap().len(), 0);
}
