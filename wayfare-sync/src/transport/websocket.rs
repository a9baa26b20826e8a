//! Networked transport: JSON events over a WebSocket relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Bearer-token handshake with hot-swappable credentials
//! - Fixed-interval, bounded reconnect after a failed connect or a dropped
//!   connection (a 401 waits for new credentials instead)
//! - Offline queue for events sent while disconnected
//!
//! ```text
//!  send() ──► outgoing channel ──► writer task ──► relay
//!                                                   │
//!  handler ◄── Event::decode ◄── reader task ◄──────┘
//!                                    │ (stream ends)
//!                                    ▼
//!                            reconnect loop: sleep(interval) × max_attempts
//! ```
//!
//! Once the reconnect loop gives up, the next `send` triggers a fresh
//! connect attempt.
//!
//! Reference: Kleppmann, Chapter 8 — Unreliable Networks

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{InboundHandler, Transport, TransportError, TransportType};
use crate::event::Event;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Fixed-interval, bounded reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// Events sent while disconnected, replayed in order on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedEvent>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event_id: String,
    frame: String,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded event. Returns `false` when full.
    pub fn enqueue(&mut self, event_id: &str, frame: String) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedEvent {
            event_id: event_id.to_string(),
            frame,
            queued_at: Instant::now(),
        });
        true
    }

    /// Take every queued frame, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.queue.drain(..).map(|q| q.frame).collect()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.queue.iter().any(|q| q.event_id == event_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.frame.len()).sum()
    }

    /// How long the oldest queued event has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }
}

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct WsInner {
    url: String,
    token: RwLock<Option<String>>,
    policy: Mutex<ReconnectPolicy>,
    handler: RwLock<Option<InboundHandler>>,
    state: RwLock<ConnectionState>,
    connection: Mutex<Option<Connection>>,
    offline: Mutex<OfflineQueue>,
    /// Bumped per connection; a reader only reports loss for its own
    generation: AtomicU64,
    reconnecting: AtomicBool,
    /// Set by an explicit disconnect; suppresses reconnects
    closed: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WsInner {
                url: url.into(),
                token: RwLock::new(None),
                policy: Mutex::new(ReconnectPolicy::default()),
                handler: RwLock::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                connection: Mutex::new(None),
                offline: Mutex::new(OfflineQueue::new(1_000)),
                generation: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn with_reconnect_policy(self, policy: ReconnectPolicy) -> Self {
        *self.inner.policy.lock() = policy;
        self
    }

    pub fn with_offline_capacity(self, capacity: usize) -> Self {
        *self.inner.offline.lock() = OfflineQueue::new(capacity);
        self
    }

    pub fn with_auth_token(self, token: Option<String>) -> Self {
        *self.inner.token.write() = token;
        self
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        *self.inner.policy.lock()
    }

    pub fn offline_queue_len(&self) -> usize {
        self.inner.offline.lock().len()
    }
}

impl WsInner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn build_request(&self) -> Result<Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if let Some(token) = self.token.read().as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Auth(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    /// Boxed so the reconnect loop can call back into it. Leaves `closed`
    /// alone; only the public entry points reopen a closed transport.
    fn connect(self: Arc<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        async move {
            let _guard = self.connect_lock.lock().await;
            if self.is_connected() {
                return Ok(());
            }
            self.set_state(ConnectionState::Connecting);

            let request = match self.build_request() {
                Ok(request) => request,
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            };

            match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _)) => {
                    self.attach(stream);
                    log::info!("Connected to relay {}", self.url);
                    Ok(())
                }
                Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                    // Not retried: needs new credentials via set_auth_token
                    self.set_state(ConnectionState::Disconnected);
                    log::warn!("Relay {} rejected credentials", self.url);
                    Err(TransportError::Auth(format!("relay answered {}", response.status())))
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    log::warn!("Relay connect to {} failed: {e}", self.url);
                    if !self.closed.load(Ordering::SeqCst) {
                        self.schedule_reconnect();
                    }
                    Err(TransportError::ConnectionFailed(e.to_string()))
                }
            }
        }
        .boxed()
    }

    /// Spawn reader/writer tasks for a fresh stream and replay the offline queue.
    fn attach(self: &Arc<Self>, stream: RelayStream) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    log::warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inner = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => inner.deliver(text.as_str()),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => inner.deliver(text),
                        Err(_) => log::warn!("Discarding non-UTF-8 relay frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Relay read error: {e}");
                        break;
                    }
                }
            }
            inner.connection_lost(generation);
        });

        let queued = self.offline.lock().drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued events", queued.len());
        }
        for frame in queued {
            let _ = out_tx.send(frame);
        }

        if let Some(old) = self.connection.lock().replace(Connection {
            outgoing: out_tx,
            reader,
            writer,
        }) {
            old.abort();
        }
        self.set_state(ConnectionState::Connected);
    }

    fn deliver(&self, text: &str) {
        match Event::decode(text) {
            Ok(event) => {
                let handler = self.handler.read().clone();
                if let Some(handler) = handler {
                    handler(event);
                }
            }
            Err(e) => log::warn!("Discarding malformed relay frame: {e}"),
        }
    }

    fn connection_lost(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Some(conn) = self.connection.lock().take() {
            conn.writer.abort();
        }
        self.set_state(ConnectionState::Disconnected);
        log::info!("Relay connection to {} lost", self.url);

        if !self.closed.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let policy = *inner.policy.lock();
            for attempt in 1..=policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
                if inner.closed.load(Ordering::SeqCst) || inner.is_connected() {
                    break;
                }
                inner.set_state(ConnectionState::Reconnecting);
                match Arc::clone(&inner).connect().await {
                    Ok(()) => {
                        log::info!("Reconnected to relay after {attempt} attempt(s)");
                        break;
                    }
                    Err(e) => log::warn!(
                        "Reconnect attempt {attempt}/{} failed: {e}",
                        policy.max_attempts
                    ),
                }
            }
            if !inner.is_connected() && !inner.closed.load(Ordering::SeqCst) {
                log::warn!(
                    "Giving up on relay after {} attempts; next send will retry",
                    policy.max_attempts
                );
            }
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Tear down the current connection without reporting it as lost.
    fn drop_connection(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = self.connection.lock().take() {
            conn.abort();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn outgoing(&self) -> Option<mpsc::UnboundedSender<String>> {
        if !self.is_connected() {
            return None;
        }
        self.connection.lock().as_ref().map(|c| c.outgoing.clone())
    }

    async fn send(self: &Arc<Self>, event: &Event) -> Result<(), TransportError> {
        let mut frame = event.encode()?;

        if !self.is_connected()
            && !self.closed.load(Ordering::SeqCst)
            && !self.reconnecting.load(Ordering::SeqCst)
        {
            if let Err(e) = Arc::clone(self).connect().await {
                log::debug!("Send-triggered connect failed: {e}");
            }
        }

        if let Some(tx) = self.outgoing() {
            match tx.send(frame) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => frame = returned,
            }
        }

        if self.offline.lock().enqueue(&event.event_id, frame) {
            log::debug!("Queued {} until the relay is reachable", event.event_id);
            Ok(())
        } else {
            Err(TransportError::QueueFull)
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        Arc::clone(&self.inner).connect().await
    }

    async fn send(&self, event: &Event) -> Result<(), TransportError> {
        self.inner.send(event).await
    }

    fn on_message(&self, handler: InboundHandler) {
        *self.inner.handler.write() = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn is_network_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn set_auth_token(&self, token: Option<String>) -> Result<(), TransportError> {
        *self.inner.token.write() = token;
        self.inner.drop_connection();
        self.inner.closed.store(false, Ordering::SeqCst);
        log::info!("Auth token changed; reconnecting to {}", self.inner.url);
        Arc::clone(&self.inner).connect().await
    }

    async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.drop_connection();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.drop_connection();
    }
}
