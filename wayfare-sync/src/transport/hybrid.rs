//! Local broadcast and relay together.
//!
//! Every event goes out on both channels. A peer that is both same-origin
//! and relay-connected therefore receives it twice; the hybrid keeps a
//! bounded window of seen event ids and forwards only the first copy.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use wayfare_core::RecentSet;

use super::local::LocalBroadcastTransport;
use super::websocket::WebSocketTransport;
use super::{InboundHandler, Transport, TransportError, TransportType};
use crate::event::Event;

const SEEN_CAPACITY: usize = 500;

pub struct HybridTransport {
    local: LocalBroadcastTransport,
    network: WebSocketTransport,
    seen: Arc<Mutex<RecentSet>>,
}

impl HybridTransport {
    pub fn new(local: LocalBroadcastTransport, network: WebSocketTransport) -> Self {
        Self {
            local,
            network,
            seen: Arc::new(Mutex::new(RecentSet::new(SEEN_CAPACITY))),
        }
    }

    pub fn local(&self) -> &LocalBroadcastTransport {
        &self.local
    }

    pub fn network(&self) -> &WebSocketTransport {
        &self.network
    }
}

#[async_trait]
impl Transport for HybridTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let local = self.local.connect().await;
        let network = self.network.connect().await;

        match (local, network) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                log::warn!("Hybrid running local-only: {e}");
                Ok(())
            }
            (Err(e), Ok(())) => {
                log::warn!("Hybrid running relay-only: {e}");
                Ok(())
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    async fn send(&self, event: &Event) -> Result<(), TransportError> {
        // Outbound ids count as seen so a relay echo is dropped here too
        self.seen.lock().insert(&event.event_id);

        let local = self.local.send(event).await;
        let network = self.network.send(event).await;

        if let Err(e) = &local {
            log::debug!("Hybrid local leg failed for {}: {e}", event.event_id);
        }
        if let Err(e) = &network {
            log::debug!("Hybrid relay leg failed for {}: {e}", event.event_id);
        }
        local.or(network)
    }

    fn on_message(&self, handler: InboundHandler) {
        let seen = self.seen.clone();
        let dedup: InboundHandler = Arc::new(move |event: Event| {
            if seen.lock().insert(&event.event_id) {
                handler(event);
            } else {
                log::trace!("Hybrid dropped duplicate {}", event.event_id);
            }
        });
        self.local.on_message(dedup.clone());
        self.network.on_message(dedup);
    }

    fn is_connected(&self) -> bool {
        self.local.is_connected() || self.network.is_connected()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Hybrid
    }

    fn is_network_connected(&self) -> bool {
        self.network.is_network_connected()
    }

    async fn set_auth_token(&self, token: Option<String>) -> Result<(), TransportError> {
        self.network.set_auth_token(token).await
    }

    async fn disconnect(&self) {
        self.local.disconnect().await;
        self.network.disconnect().await;
    }
}
