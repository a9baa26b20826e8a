//! WebSocket message relay with path-based rooms.
//!
//! ```text
//! Client A ──┐   ws://host/plans/42
//!            ├── Room "/plans/42" ── BroadcastGroup ──┬──► Client B
//! Client B ──┘                                        └──► Client A (skipped)
//! ```
//!
//! The relay is stateless with respect to events: every valid text frame is
//! forwarded to the other peers of its room and then forgotten. Frames that
//! don't decode as an event are dropped.

use futures_util::{SinkExt, StreamExt};
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastGroup, Frame, PeerInfo, RoomManager};
use crate::event::Event;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Room '{0}' is full")]
    RoomFull(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per peer before a slow peer starts losing them
    pub broadcast_capacity: usize,
    pub max_peers_per_room: usize,
    /// When set, the handshake must carry `Authorization: Bearer <token>`
    pub auth_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
            auth_token: None,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `WAYFARE_RELAY_ADDR` and `WAYFARE_RELAY_TOKEN`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = env::var("WAYFARE_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        config.auth_token = env::var("WAYFARE_RELAY_TOKEN").ok().filter(|t| !t.is_empty());
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub invalid_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_frames: AtomicU64,
    invalid_frames: AtomicU64,
    total_bytes: AtomicU64,
}

#[derive(Clone)]
pub struct RelayServer {
    config: Arc<RelayConfig>,
    rooms: Arc<RoomManager>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config: Arc::new(config),
            rooms,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection from {addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let expected = self.config.auth_token.clone();
        let mut room_name = String::from("/");

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if let Some(expected) = &expected {
                let presented = request
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "));
                if presented != Some(expected.as_str()) {
                    let mut denied = ErrorResponse::new(Some("invalid or missing bearer token".to_string()));
                    *denied.status_mut() = StatusCode::UNAUTHORIZED;
                    return Err(denied);
                }
            }
            room_name = request.uri().path().to_string();
            Ok(response)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let peer = PeerInfo::new(Some(addr));
        let peer_id = peer.peer_id;
        let Some((room, rx)) = self
            .rooms
            .join(&room_name, peer, self.config.max_peers_per_room)
            .await
        else {
            self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            let mut ws = ws;
            let _ = ws.close(None).await;
            return Err(RelayError::RoomFull(room_name));
        };
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Peer {peer_id} from {addr} joined room '{room_name}'");

        let outcome = self.pump(ws, &room, peer_id, rx).await;

        self.rooms.leave(&room_name, &peer_id).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Peer {peer_id} left room '{room_name}'");
        outcome
    }

    async fn pump(
        &self,
        ws: WebSocketStream<TcpStream>,
        room: &BroadcastGroup,
        peer_id: uuid::Uuid,
        mut rx: tokio::sync::broadcast::Receiver<Frame>,
    ) -> Result<(), RelayError> {
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.relay(room, peer_id, text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.relay(room, peer_id, text),
                        Err(_) => {
                            self.stats.invalid_frames.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },

                frame = rx.recv() => match frame {
                    Ok(frame) => {
                        // Don't echo back to sender
                        if frame.sender != peer_id {
                            sink.send(Message::text(frame.text.to_string())).await?;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Peer {peer_id} lagged by {n} frames");
                        room.record_dropped(n);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    fn relay(&self, room: &BroadcastGroup, peer_id: uuid::Uuid, text: &str) {
        self.stats.total_frames.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

        match Event::decode(text) {
            Ok(event) => {
                let receivers = room.broadcast(Frame::new(peer_id, text));
                log::trace!("Relayed {} to {} receivers", event.event_id, receivers.saturating_sub(1));
            }
            Err(e) => {
                self.stats.invalid_frames.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping invalid frame from {peer_id}: {e}");
            }
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
            invalid_frames: self.stats.invalid_frames.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
