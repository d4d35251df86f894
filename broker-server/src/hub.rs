//! Broadcast hub: connection lifecycle fan-out.
//!
//! A single background task drains one byte-payload channel and delivers
//! each payload to every registered websocket subscriber. Delivery to an
//! individual subscriber is best-effort: a full or closed subscriber queue
//! evicts that subscriber and the loop continues, so one slow or dead
//! viewer never stalls the rest.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Per-subscriber queue depth. A subscriber that falls this far behind is
/// treated as dead and evicted.
const SUBSCRIBER_BUFFER: usize = 64;

/// Capacity of the inbound message channel drained by [`BroadcastHub::run`].
const MESSAGE_BUFFER: usize = 256;

pub struct BroadcastHub {
    subscribers: DashMap<Uuid, mpsc::Sender<Bytes>>,
    messages: mpsc::Sender<Bytes>,
}

impl BroadcastHub {
    /// Create the hub and the receiver its dispatch loop drains.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (messages, rx) = mpsc::channel(MESSAGE_BUFFER);
        let hub = Arc::new(Self {
            subscribers: DashMap::new(),
            messages,
        });
        (hub, rx)
    }

    /// Handle producers use to enqueue events.
    pub fn publisher(&self) -> mpsc::Sender<Bytes> {
        self.messages.clone()
    }

    /// Register a subscriber; returns its id and event queue.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<Bytes>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(id, tx);
        debug!("Subscriber {} registered ({} active)", id, self.subscribers.len());
        (id, rx)
    }

    /// Remove a subscriber; it receives no further events.
    pub fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.remove(&id).is_some() {
            debug!("Subscriber {} unregistered", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drain the message channel, fanning each payload out to every
    /// subscriber. Suspends while the channel is empty; returns when all
    /// producer handles are dropped.
    pub async fn run(self: Arc<Self>, mut messages: mpsc::Receiver<Bytes>) {
        info!("Broadcast hub dispatch loop started");
        while let Some(payload) = messages.recv().await {
            self.dispatch(&payload);
        }
        info!("Broadcast hub dispatch loop stopped");
    }

    fn dispatch(&self, payload: &Bytes) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().try_send(payload.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        // Removing inside the iteration would contend on the shard lock.
        for id in dead {
            debug!("Evicting unresponsive subscriber {}", id);
            self.subscribers.remove(&id);
        }
    }
}

/// `GET /monitoring` - websocket upgrade for monitoring viewers.
pub async fn serve_monitoring(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_subscriber(socket, hub, "monitoring"))
}

/// `GET /outbound` - websocket upgrade for outbound listeners. Same event
/// stream as `/monitoring`; only the connecting clients differ.
pub async fn serve_outbound(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_subscriber(socket, hub, "outbound"))
}

async fn run_subscriber(socket: WebSocket, hub: Arc<BroadcastHub>, endpoint: &'static str) {
    let (id, mut events) = hub.subscribe();
    info!("{} subscriber {} connected", endpoint, id);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Forward events from the subscriber queue to the socket; any write
    // failure ends the subscription.
    let forward = tokio::spawn(async move {
        while let Some(payload) = events.recv().await {
            if ws_tx
                .send(WsMessage::Binary(payload.to_vec()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Drain the client side so close frames are observed promptly.
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    forward.abort();
    hub.unsubscribe(id);
    info!("{} subscriber {} disconnected", endpoint, id);
}
