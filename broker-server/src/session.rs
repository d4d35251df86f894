//! Websocket-backed tunnel provider.
//!
//! Agents establish outbound connections to `/connect`; each admitted
//! connection becomes a session in a concurrent registry keyed by tunnel id.
//! Logical byte streams are multiplexed over the session with the
//! `broker-core` frame codec. Mesh peers are ordinary sessions established
//! in the outbound direction: a dial for an id with no local session is
//! forwarded over each live peer link in turn, and the receiving broker
//! resolves it against its local sessions only.

use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use async_trait::async_trait;
use broker_core::{
    Authorizer, BrokerError, DialRequest, Frame, FrameType, LifecycleEvent, PeerDescriptor,
    StreamId, TunnelId, TunnelProvider, TunnelStream,
};
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest,
    tungstenite::protocol::Message as TungsteniteMessage,
};
use tracing::{debug, error, info, warn};

/// Header carrying the shared token on peer-to-peer connections.
pub const PEER_TOKEN_HEADER: &str = "x-peer-token";

/// Outbound frame queue depth per session.
const SESSION_BUFFER: usize = 256;

/// Per-stream inbound byte queue depth.
const STREAM_BUFFER: usize = 64;

/// Duplex buffer size for dialed streams.
const STREAM_WINDOW: usize = 64 * 1024;

/// One live tunnel connection: a frame channel to the remote plus the
/// tables for its multiplexed streams.
pub struct Session {
    pub id: TunnelId,
    outbound: mpsc::Sender<Frame>,
    streams: DashMap<StreamId, mpsc::Sender<Vec<u8>>>,
    pending_opens: DashMap<StreamId, oneshot::Sender<Result<(), String>>>,
    next_stream_id: AtomicU32,
}

impl Session {
    /// `first_stream_id` is 2 on the accepting end and 1 on the initiating
    /// end, so the two sides allocate from disjoint id spaces.
    fn new(id: TunnelId, outbound: mpsc::Sender<Frame>, first_stream_id: u32) -> Self {
        Self {
            id,
            outbound,
            streams: DashMap::new(),
            pending_opens: DashMap::new(),
            next_stream_id: AtomicU32::new(first_stream_id),
        }
    }

    fn allocate_stream(&self) -> StreamId {
        self.next_stream_id.fetch_add(2, Ordering::SeqCst)
    }

    /// Open a logical stream over this session.
    ///
    /// Sends `Open` and waits for the remote's `OpenAck` within `timeout`;
    /// a rejection or a closed session surfaces as a dial error, never a
    /// hang. On success the returned duplex stream is pumped by a dedicated
    /// task until either side closes.
    pub async fn open_stream(
        self: &Arc<Self>,
        request: &DialRequest,
        timeout: Duration,
    ) -> Result<TunnelStream, BrokerError> {
        let stream_id = self.allocate_stream();
        let (ack_tx, ack_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(STREAM_BUFFER);
        self.pending_opens.insert(stream_id, ack_tx);
        self.streams.insert(stream_id, data_tx);

        if self
            .outbound
            .send(Frame::open(stream_id, request))
            .await
            .is_err()
        {
            self.forget_stream(stream_id);
            return Err(BrokerError::Dial("session closed".to_string()));
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(message))) => {
                self.forget_stream(stream_id);
                return Err(BrokerError::Dial(message));
            }
            Ok(Err(_)) => {
                self.forget_stream(stream_id);
                return Err(BrokerError::Dial("session closed".to_string()));
            }
            Err(_) => {
                self.forget_stream(stream_id);
                return Err(BrokerError::Timeout(timeout));
            }
        }

        let (io, far) = tokio::io::duplex(STREAM_WINDOW);
        let session = self.clone();
        tokio::spawn(async move {
            run_stream_pump(session, stream_id, far, data_rx).await;
        });
        Ok(Box::new(io))
    }

    fn forget_stream(&self, stream_id: StreamId) {
        self.pending_opens.remove(&stream_id);
        self.streams.remove(&stream_id);
    }

    /// Drop every stream table entry, ending the associated pumps.
    fn shutdown_streams(&self) {
        self.streams.clear();
        self.pending_opens.clear();
    }
}

/// Relay bytes between a local duplex endpoint and the session's frame
/// channel. The two directions run as independent tasks: backpressure on
/// one must never stop the other, or two bridged streams with full windows
/// in both directions stall each other permanently.
async fn run_stream_pump(
    session: Arc<Session>,
    stream_id: StreamId,
    io: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
) {
    let (mut reader, mut writer) = tokio::io::split(io);

    let outbound = session.outbound.clone();
    let to_remote = tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = outbound.send(Frame::close(stream_id)).await;
                    break;
                }
                Ok(n) => {
                    if outbound
                        .send(Frame::data(stream_id, buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    while let Some(bytes) = data_rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            let _ = session.outbound.send(Frame::close(stream_id)).await;
            break;
        }
    }
    // Remote closed the stream or the local side failed; signal EOF to the
    // local reader. The outbound half drains to its own EOF.
    let _ = writer.shutdown().await;
    let _ = to_remote.await;

    session.streams.remove(&stream_id);
    debug!("Stream {} on tunnel {} finished", stream_id, session.id);
}

/// Registry of live tunnel sessions and mesh peer links.
pub struct SessionManager {
    me: Weak<Self>,
    local_id: String,
    /// This broker's own token; inbound peer links must present it.
    local_token: String,
    authorizer: Arc<dyn Authorizer>,
    sessions: DashMap<TunnelId, Arc<Session>>,
    /// Configured peers, in registration order.
    peers: Mutex<Vec<PeerDescriptor>>,
    /// Live outbound links to peers, keyed by peer id.
    peer_links: DashMap<String, Arc<Session>>,
    events: mpsc::Sender<Bytes>,
    dial_timeout: Duration,
    reconnect_delay: Duration,
}

impl SessionManager {
    pub fn new(
        local_id: impl Into<String>,
        local_token: impl Into<String>,
        authorizer: Arc<dyn Authorizer>,
        events: mpsc::Sender<Bytes>,
        dial_timeout: Duration,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_id: local_id.into(),
            local_token: local_token.into(),
            authorizer,
            sessions: DashMap::new(),
            peers: Mutex::new(Vec::new()),
            peer_links: DashMap::new(),
            events,
            dial_timeout,
            reconnect_delay,
        })
    }

    fn publish(&self, event: LifecycleEvent) {
        // Lifecycle delivery is best-effort; a saturated hub never blocks
        // session handling.
        let _ = self.events.try_send(event.to_bytes());
    }

    fn is_configured_peer(&self, id: &TunnelId) -> bool {
        self.peers
            .lock()
            .map(|peers| peers.iter().any(|p| p.id == id.as_str()))
            .unwrap_or(false)
    }

    /// A connection claiming a configured peer's id must present this
    /// broker's own token. Ordinary agent ids carry no token requirement.
    fn peer_token_valid(&self, id: &TunnelId, headers: &HeaderMap) -> bool {
        if !self.is_configured_peer(id) {
            return true;
        }
        let presented = headers
            .get(PEER_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        !self.local_token.is_empty() && presented == self.local_token
    }

    /// Register `session` under `id` unless a live session already holds
    /// the id. Check and insert are one atomic map operation, so two racing
    /// connections cannot both register.
    fn register_session(&self, id: &TunnelId, session: &Arc<Session>) -> bool {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                true
            }
        }
    }

    /// Remove only this session's own registration; an entry owned by
    /// another session under the same id stays live.
    fn unregister_session(&self, id: &TunnelId, session: &Arc<Session>) {
        self.sessions
            .remove_if(id, |_, registered| Arc::ptr_eq(registered, session));
    }

    /// Dispatch one frame received on `session`, in either direction.
    async fn handle_frame(self: &Arc<Self>, session: &Arc<Session>, frame: Frame) {
        match frame.frame_type {
            FrameType::OpenAck => {
                if let Some((_, ack)) = session.pending_opens.remove(&frame.stream_id) {
                    let _ = ack.send(Ok(()));
                }
            }
            FrameType::Error => {
                let message = frame.error_message();
                if let Some((_, ack)) = session.pending_opens.remove(&frame.stream_id) {
                    let _ = ack.send(Err(message));
                } else {
                    debug!(
                        "Stream {} on tunnel {} errored: {}",
                        frame.stream_id, session.id, message
                    );
                }
                session.streams.remove(&frame.stream_id);
            }
            FrameType::Close => {
                session.streams.remove(&frame.stream_id);
            }
            FrameType::Data => {
                let sender = session
                    .streams
                    .get(&frame.stream_id)
                    .map(|entry| entry.value().clone());
                if let Some(sender) = sender {
                    if sender.send(frame.payload).await.is_err() {
                        session.streams.remove(&frame.stream_id);
                    }
                } else {
                    debug!(
                        "Dropping data for unknown stream {} on tunnel {}",
                        frame.stream_id, session.id
                    );
                }
            }
            FrameType::Open => self.handle_remote_open(session, frame).await,
        }
    }

    /// A remote broker forwarded a dial over this session. Resolve the
    /// target against local sessions only (forwarded dials never hop twice)
    /// and bridge the two streams.
    async fn handle_remote_open(self: &Arc<Self>, session: &Arc<Session>, frame: Frame) {
        let stream_id = frame.stream_id;
        let Some(request) = frame.dial_request() else {
            let _ = session
                .outbound
                .send(Frame::error(stream_id, "malformed open"))
                .await;
            return;
        };
        let Some(target) = request.tunnel_id.clone() else {
            let _ = session
                .outbound
                .send(Frame::error(stream_id, "broker does not terminate dials"))
                .await;
            return;
        };

        let local = self.sessions.get(&target).map(|entry| entry.value().clone());
        let Some(local) = local else {
            let _ = session
                .outbound
                .send(Frame::error(stream_id, "tunnel not found"))
                .await;
            return;
        };

        let inner_request = DialRequest {
            tunnel_id: None,
            network: request.network,
            address: request.address,
        };
        let session = session.clone();
        let dial_timeout = self.dial_timeout;
        tokio::spawn(async move {
            match local.open_stream(&inner_request, dial_timeout).await {
                Ok(inner) => {
                    let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
                    session.streams.insert(stream_id, data_tx);
                    if session
                        .outbound
                        .send(Frame::open_ack(stream_id))
                        .await
                        .is_err()
                    {
                        session.streams.remove(&stream_id);
                        return;
                    }
                    run_stream_pump(session, stream_id, inner, data_rx).await;
                }
                Err(e) => {
                    let _ = session
                        .outbound
                        .send(Frame::error(stream_id, &e.to_string()))
                        .await;
                }
            }
        });
    }

    /// Run an admitted inbound connection until it closes or errors.
    async fn run_inbound_session(self: Arc<Self>, socket: WebSocket, id: TunnelId, peer: bool) {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(SESSION_BUFFER);
        let session = Arc::new(Session::new(id.clone(), outbound_tx, 2));
        if !self.register_session(&id, &session) {
            warn!("Tunnel '{}' raced an existing session, dropping", id);
            return;
        }
        self.publish(LifecycleEvent::connected(id.clone(), peer));
        info!("Tunnel '{}' connected{}", id, if peer { " (peer)" } else { "" });

        let (mut ws_tx, mut ws_rx) = socket.split();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if ws_tx
                    .send(WsMessage::Binary(frame.to_bytes()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut failure: Option<String> = None;
        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(WsMessage::Binary(data)) => match Frame::from_bytes(&data) {
                    Some(frame) => self.handle_frame(&session, frame).await,
                    None => warn!("Undecodable frame from tunnel '{}'", id),
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        writer.abort();
        self.unregister_session(&id, &session);
        session.shutdown_streams();
        match failure {
            Some(message) => {
                error!("Tunnel '{}' failed: {}", id, message);
                self.publish(LifecycleEvent::errored(id, message));
            }
            None => {
                info!("Tunnel '{}' disconnected", id);
                self.publish(LifecycleEvent::disconnected(id));
            }
        }
    }

    /// Maintain one outbound link to a peer, reconnecting forever. An
    /// unreachable peer is retried at the configured delay and never fails
    /// the process.
    async fn run_peer_loop(self: Arc<Self>, peer: PeerDescriptor) {
        loop {
            match self.clone().run_peer_link(&peer).await {
                Ok(()) => info!("Peer '{}' link closed", peer.id),
                Err(e) => warn!("Peer '{}' link failed: {}", peer.id, e),
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn run_peer_link(self: Arc<Self>, peer: &PeerDescriptor) -> Result<()> {
        let base = peer.url.trim_end_matches('/');
        let ws_url = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}/connect", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}/connect", rest)
        } else {
            format!("{}/connect", base)
        };

        let mut request = ws_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            broker_core::TUNNEL_ID_HEADER,
            http::HeaderValue::from_str(&self.local_id)?,
        );
        request.headers_mut().insert(
            PEER_TOKEN_HEADER,
            http::HeaderValue::from_str(&peer.token)?,
        );

        let (stream, _) = connect_async(request).await?;
        info!("Connected to peer '{}' at {}", peer.id, peer.url);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(SESSION_BUFFER);
        let session = Arc::new(Session::new(TunnelId::new(&peer.id), outbound_tx, 1));
        self.peer_links.insert(peer.id.clone(), session.clone());
        self.publish(LifecycleEvent::connected(TunnelId::new(&peer.id), true));

        let (mut ws_tx, mut ws_rx) = stream.split();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if ws_tx
                    .send(TungsteniteMessage::Binary(frame.to_bytes()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut result = Ok(());
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(TungsteniteMessage::Binary(data)) => match Frame::from_bytes(&data) {
                    Some(frame) => self.handle_frame(&session, frame).await,
                    None => warn!("Undecodable frame from peer '{}'", peer.id),
                },
                Ok(TungsteniteMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }

        writer.abort();
        self.peer_links.remove(&peer.id);
        session.shutdown_streams();
        self.publish(LifecycleEvent::disconnected(TunnelId::new(&peer.id)));
        result
    }
}

#[async_trait]
impl TunnelProvider for SessionManager {
    async fn dial(
        &self,
        tunnel_id: &TunnelId,
        network: &str,
        address: &str,
    ) -> Result<TunnelStream, BrokerError> {
        let session = self.sessions.get(tunnel_id).map(|entry| entry.value().clone());
        if let Some(session) = session {
            let request = DialRequest {
                tunnel_id: None,
                network: network.to_string(),
                address: address.to_string(),
            };
            return session.open_stream(&request, self.dial_timeout).await;
        }

        // Not local: forward over each live peer link in registration order.
        let peer_ids: Vec<String> = self
            .peers
            .lock()
            .map(|peers| peers.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default();
        for peer_id in peer_ids {
            let link = self.peer_links.get(&peer_id).map(|entry| entry.value().clone());
            let Some(link) = link else { continue };
            let request = DialRequest {
                tunnel_id: Some(tunnel_id.clone()),
                network: network.to_string(),
                address: address.to_string(),
            };
            match link.open_stream(&request, self.dial_timeout).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(
                        "Peer '{}' cannot reach tunnel '{}': {}",
                        peer_id, tunnel_id, e
                    );
                }
            }
        }

        Err(BrokerError::TunnelNotFound(tunnel_id.clone()))
    }

    fn has_session(&self, tunnel_id: &TunnelId) -> bool {
        self.sessions.contains_key(tunnel_id)
    }

    fn session_ids(&self) -> Vec<TunnelId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn add_peer(&self, peer: PeerDescriptor) {
        if peer.id == self.local_id {
            return;
        }
        if let Ok(mut peers) = self.peers.lock() {
            if peers.iter().any(|p| p.id == peer.id) {
                return;
            }
            peers.push(peer.clone());
        }
        let Some(mgr) = self.me.upgrade() else { return };
        tokio::spawn(mgr.run_peer_loop(peer));
    }

    fn peer_ids(&self) -> Vec<String> {
        self.peers
            .lock()
            .map(|peers| peers.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    fn peer_reachable(&self, peer_id: &str) -> bool {
        self.peer_links.contains_key(peer_id)
            || self.sessions.contains_key(&TunnelId::new(peer_id))
    }
}

/// `GET /connect` - tunnel establishment. Authorization runs before the
/// protocol upgrade: a missing identity is rejected with 401, a peer id
/// with a bad token with 403, and a duplicate id with 409. The 409 here is
/// a fast pre-check; the registration itself is atomic in
/// [`SessionManager::register_session`].
pub async fn connect_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let manager = state.sessions.clone();

    let id = match manager.authorizer.authorize(&headers) {
        Ok(Some(id)) => id,
        Ok(None) => {
            return (StatusCode::UNAUTHORIZED, "missing tunnel identity").into_response();
        }
        Err(e) => {
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::UNAUTHORIZED);
            return (status, e.to_string()).into_response();
        }
    };

    if !manager.peer_token_valid(&id, &headers) {
        warn!("Rejecting peer link '{}': bad or missing peer token", id);
        return (StatusCode::FORBIDDEN, "invalid peer token").into_response();
    }

    if manager.has_session(&id) {
        return (StatusCode::CONFLICT, "tunnel id already connected").into_response();
    }

    let peer = manager.is_configured_peer(&id);
    ws.on_upgrade(move |socket| manager.run_inbound_session(socket, id, peer))
        .into_response()
}
