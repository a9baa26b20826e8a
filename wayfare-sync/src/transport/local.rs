//! Same-origin multi-tab transport over a shared storage key.
//!
//! Sending writes the serialized event to one well-known key; every other
//! context subscribed to the storage area sees the key change and decodes
//! the new value. Only contexts connected at send time observe an event.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::storage::{StorageArea, StorageError};
use super::{InboundHandler, Transport, TransportError, TransportType};
use crate::event::Event;

pub struct LocalBroadcastTransport {
    storage: StorageArea,
    key: String,
    /// Identifies this context to the storage area
    context_id: Uuid,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    connected: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LocalBroadcastTransport {
    pub fn new(storage: StorageArea, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            context_id: Uuid::new_v4(),
            handler: Arc::new(RwLock::new(None)),
            connected: AtomicBool::new(false),
            reader: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    fn write(&self, text: &str) -> Result<(), StorageError> {
        self.storage.set_item(self.context_id, &self.key, text)
    }
}

#[async_trait]
impl Transport for LocalBroadcastTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Ok(());
        }

        let mut changes = self.storage.subscribe(self.context_id);
        let key = self.key.clone();
        let handler = self.handler.clone();

        *reader = Some(tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                if change.key != key {
                    continue;
                }
                // Removal of the key (quota recovery) carries no event
                let Some(text) = change.new_value else {
                    continue;
                };
                match Event::decode(&text) {
                    Ok(event) => {
                        let callback = handler.read().clone();
                        if let Some(callback) = callback {
                            callback(event);
                        }
                    }
                    Err(e) => log::warn!("Discarding malformed broadcast on '{key}': {e}"),
                }
            }
        }));

        self.connected.store(true, Ordering::Release);
        log::debug!("Local broadcast listening on '{}'", self.key);
        Ok(())
    }

    async fn send(&self, event: &Event) -> Result<(), TransportError> {
        let text = event.encode()?;

        match self.write(&text) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("Broadcast write failed ({e}); clearing '{}' and retrying", self.key);
                self.storage.remove_item(self.context_id, &self.key);
                self.write(&text).map_err(|e| {
                    log::debug!("Dropping cross-tab delivery of {}: {e}", event.event_id);
                    TransportError::QuotaExceeded
                })
            }
        }
    }

    fn on_message(&self, handler: InboundHandler) {
        *self.handler.write() = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::LocalBroadcast
    }

    async fn disconnect(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::Release);
    }
}

impl Drop for LocalBroadcastTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
