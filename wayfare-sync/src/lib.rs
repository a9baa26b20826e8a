//! # wayfare-sync — event bus and transports for collaborative plans
//!
//! Moves [`Event`]s between execution contexts: other tabs of the same
//! origin through shared storage, other devices through a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   storage key    ┌─────────────┐
//! │ EventBus    │ ◄──────────────► │ EventBus    │   same origin
//! │ (tab A)     │                  │ (tab B)     │
//! └──────┬──────┘                  └─────────────┘
//!        │ WebSocket (JSON events)
//!        ▼
//! ┌─────────────┐                  ┌─────────────┐
//! │ RelayServer │ ───────────────► │ EventBus    │   other device
//! │ (rooms)     │    fan-out       │ (device C)  │
//! └─────────────┘                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`] — Event envelope, JSON wire form, type catalog
//! - [`bus`] — Batched pub/sub with de-duplication and causal stamping
//! - [`transport`] — Local-broadcast, WebSocket and hybrid transports
//! - [`config`] — Serde-loadable sync configuration
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`relay`] — WebSocket message relay server

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod event;
pub mod relay;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, PeerInfo, RoomManager};
pub use bus::{
    BusStats, DebugEntry, Direction, EmitOptions, EventBus, Handler, HandlerError, Subscription,
};
pub use config::{ConfigError, SyncConfig, TransportKind};
pub use event::{types, Event, EventDecodeError};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use transport::{
    create_transport, ConnectionState, HybridTransport, InboundHandler, LocalBroadcastTransport,
    OfflineQueue, ReconnectPolicy, StorageArea, StorageChange, StorageError, Transport,
    TransportError, TransportType, WebSocketTransport,
};
