//! Sync configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//! local-broadcast only, 500-entry de-dup window, 100-entry debug log.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::transport::websocket::ReconnectPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sync config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Transport '{0:?}' requires a relay URL")]
    MissingRelayUrl(TransportKind),
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which transport variant to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Same-origin multi-tab broadcast through shared storage
    #[default]
    Local,
    /// Cross-device delivery through a WebSocket relay
    Websocket,
    /// Both of the above, de-duplicated on receipt
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub transport: TransportKind,
    /// Relay endpoint, e.g. `ws://relay.example.com/plans/42`
    pub relay_url: Option<String>,
    /// Bearer credential, if already available at startup
    pub auth_token: Option<String>,
    /// Storage key holding the most recent broadcast event
    pub storage_key: String,
    pub dedup_capacity: usize,
    pub debug_log_capacity: usize,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Events held while the network transport is down
    pub offline_queue_capacity: usize,
    pub protection_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Local,
            relay_url: None,
            auth_token: None,
            storage_key: "wayfare:sync-event".to_string(),
            dedup_capacity: 500,
            debug_log_capacity: 100,
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: 5,
            offline_queue_capacity: 1_000,
            protection_window_ms: wayfare_core::DEFAULT_PROTECTION_WINDOW_MS,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.transport, TransportKind::Websocket | TransportKind::Hybrid)
            && self.relay_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::MissingRelayUrl(self.transport));
        }
        if let Some(url) = &self.relay_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::Invalid {
                    field: "relayUrl",
                    reason: format!("expected ws:// or wss:// URL, got {url}"),
                });
            }
        }
        if self.storage_key.is_empty() {
            return Err(ConfigError::Invalid {
                field: "storageKey",
                reason: "must not be empty".to_string(),
            });
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "dedupCapacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_millis(self.reconnect_interval_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    /// Local-only config with the given storage key.
    pub fn local(storage_key: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            ..Self::default()
        }
    }

    /// Networked config pointing at `relay_url`.
    pub fn websocket(relay_url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Websocket,
            relay_url: Some(relay_url.into()),
            ..Self::default()
        }
    }
}
