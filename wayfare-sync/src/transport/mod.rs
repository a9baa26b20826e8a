//! Pluggable event delivery between execution contexts.
//!
//! ```text
//!              ┌────────────────────┐
//! EventBus ───►│  dyn Transport     │───► other tabs / devices
//!          ◄───│  on_message(cb)    │◄───
//!              └─────────┬──────────┘
//!        ┌───────────────┼────────────────┐
//!        ▼               ▼                ▼
//!  LocalBroadcast    WebSocket         Hybrid
//!  (StorageArea)     (relay, retry)    (both, de-dup)
//! ```
//!
//! Transports never surface failures to bus callers. Connect and send
//! errors are returned to the bus, which logs them; degraded mode is
//! visible only through `is_connected()`.

pub mod hybrid;
pub mod local;
pub mod storage;
pub mod websocket;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ConfigError, SyncConfig, TransportKind};
use crate::event::Event;

pub use hybrid::HybridTransport;
pub use local::LocalBroadcastTransport;
pub use storage::{StorageArea, StorageChange, StorageError};
pub use websocket::{ConnectionState, OfflineQueue, ReconnectPolicy, WebSocketTransport};

/// Callback invoked once per decoded inbound event.
pub type InboundHandler = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Storage quota exceeded")]
    QuotaExceeded,
    #[error("Offline queue full")]
    QueueFull,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid auth token: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    LocalBroadcast,
    WebSocket,
    Hybrid,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalBroadcast => "local-broadcast",
            Self::WebSocket => "websocket",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Delivery channel contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel. Idempotent while connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Best-effort delivery of one event.
    async fn send(&self, event: &Event) -> Result<(), TransportError>;

    /// Register the inbound callback, replacing any previous one.
    fn on_message(&self, handler: InboundHandler);

    fn is_connected(&self) -> bool;

    fn transport_type(&self) -> TransportType;

    /// Whether cross-device delivery is currently live.
    fn is_network_connected(&self) -> bool {
        false
    }

    /// Swap credentials and reconnect. Only networked transports care.
    async fn set_auth_token(&self, _token: Option<String>) -> Result<(), TransportError> {
        Ok(())
    }

    /// Tear down the channel and stop any reconnect attempts.
    async fn disconnect(&self) {}
}

/// Build the transport `config` asks for.
///
/// `storage` is the shared same-origin storage area; networked-only
/// transports ignore it.
pub fn create_transport(
    config: &SyncConfig,
    storage: StorageArea,
) -> Result<Arc<dyn Transport>, ConfigError> {
    config.validate()?;

    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Local => Arc::new(LocalBroadcastTransport::new(storage, &config.storage_key)),
        TransportKind::Websocket => Arc::new(websocket_from(config)?),
        TransportKind::Hybrid => Arc::new(HybridTransport::new(
            LocalBroadcastTransport::new(storage, &config.storage_key),
            websocket_from(config)?,
        )),
    };
    log::debug!("Created {} transport", transport.transport_type().as_str());
    Ok(transport)
}

fn websocket_from(config: &SyncConfig) -> Result<WebSocketTransport, ConfigError> {
    let url = config
        .relay_url
        .clone()
        .ok_or(ConfigError::MissingRelayUrl(config.transport))?;
    Ok(WebSocketTransport::new(url)
        .with_reconnect_policy(config.reconnect_policy())
        .with_offline_capacity(config.offline_queue_capacity)
        .with_auth_token(config.auth_token.clone()))
}
