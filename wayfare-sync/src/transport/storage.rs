//! Shared same-origin storage with change notifications.
//!
//! Models the storage area every context of one origin sees. A write from
//! one context notifies every *other* subscribed context, in write order,
//! over an unbounded channel, so a burst is observed in full. Contexts that
//! subscribe later see only later writes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: need {needed} bytes, quota {quota}")]
    QuotaExceeded { needed: usize, quota: usize },
}

/// One key mutation as seen by other contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed
    pub new_value: Option<String>,
}

struct Listener {
    context_id: Uuid,
    tx: mpsc::UnboundedSender<StorageChange>,
}

#[derive(Default)]
struct StorageInner {
    items: HashMap<String, String>,
    quota_bytes: Option<usize>,
    listeners: Vec<Listener>,
}

impl StorageInner {
    fn used_bytes(&self) -> usize {
        self.items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn notify(&mut self, origin: Uuid, change: StorageChange) {
        self.listeners.retain(|listener| {
            if listener.context_id == origin {
                return !listener.tx.is_closed();
            }
            listener.tx.send(change.clone()).is_ok()
        });
    }
}

/// Cloneable handle; all clones share one area.
///
/// With a quota, usage is the byte length of every key plus its value. A
/// write is charged as `used - old + new`, so overwriting a key only needs
/// room for the difference.
#[derive(Clone, Default)]
pub struct StorageArea {
    inner: Arc<Mutex<StorageInner>>,
}

impl StorageArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Area that rejects writes once keys + values exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        let area = Self::default();
        area.inner.lock().quota_bytes = Some(bytes);
        area
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.inner.lock().items.get(key).cloned()
    }

    /// Write `value` under `key` on behalf of context `origin`.
    pub fn set_item(&self, origin: Uuid, key: &str, value: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();

        if let Some(quota) = inner.quota_bytes {
            let replaced = inner.items.get(key).map_or(0, |old| key.len() + old.len());
            let needed = inner.used_bytes() - replaced + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }

        let old_value = inner.items.insert(key.to_string(), value.to_string());
        inner.notify(
            origin,
            StorageChange {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    pub fn remove_item(&self, origin: Uuid, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(old_value) = inner.items.remove(key) {
            inner.notify(
                origin,
                StorageChange {
                    key: key.to_string(),
                    old_value: Some(old_value),
                    new_value: None,
                },
            );
        }
    }

    /// Receive changes made by contexts other than `context_id`.
    pub fn subscribe(&self, context_id: Uuid) -> mpsc::UnboundedReceiver<StorageChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().listeners.push(Listener { context_id, tx });
        rx
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}
