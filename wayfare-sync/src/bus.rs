//! Per-context publish/subscribe hub.
//!
//! ```text
//!  emit() ─► clock++ ─► Event ─► debug ring ─► de-dup ─► pending ─► flush ─► handlers
//!                                   │                       ▲
//!                                   ▼ (unless local_only)   │
//!                             outbound pump ─► Transport ───┼──► other contexts
//!                                                           │
//!  Transport inbound ─► self-echo? ─► de-dup ─► clock merge ┘
//! ```
//!
//! Dispatch is batched: events queue up and one flush task delivers the whole
//! batch, FIFO, to the handlers registered when the batch is taken. Outside a
//! tokio runtime there is nothing to schedule onto, so the flush runs
//! immediately instead.
//!
//! Transport failures never reach `emit` callers. `connect` reports whether
//! cross-context delivery is live and the bus keeps dispatching locally either
//! way.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

use wayfare_core::{now_millis, Operation, RecentSet, VectorClock};

use crate::config::{ConfigError, SyncConfig};
use crate::event::{types, Event};
use crate::transport::{
    create_transport, InboundHandler, StorageArea, Transport, TransportError, TransportType,
};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback. Errors and panics are logged and counted; they never
/// stop the rest of the batch.
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
    /// Dispatch to this context's subscribers only
    pub local_only: bool,
}

impl EmitOptions {
    pub fn local_only() -> Self {
        Self { local_only: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One entry in the debug ring.
#[derive(Debug, Clone)]
pub struct DebugEntry {
    pub direction: Direction,
    pub event: Arc<Event>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub emitted: u64,
    pub received: u64,
    pub dispatched: u64,
    pub duplicates: u64,
    pub self_echoes: u64,
    pub handler_failures: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct AtomicBusStats {
    emitted: AtomicU64,
    received: AtomicU64,
    dispatched: AtomicU64,
    duplicates: AtomicU64,
    self_echoes: AtomicU64,
    handler_failures: AtomicU64,
    send_failures: AtomicU64,
}

impl AtomicBusStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            self_echoes: self.self_echoes.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
}

impl Registry {
    fn remove(&mut self, event_type: &str, id: u64) {
        if let Some(list) = self.handlers.get_mut(event_type) {
            list.retain(|(handler_id, _)| *handler_id != id);
            if list.is_empty() {
                self.handlers.remove(event_type);
            }
        }
    }
}

/// Clock state advanced together on every emission.
struct Stamp {
    clock: VectorClock,
    last_version: u64,
    counter: u64,
}

struct BusInner {
    session_id: String,
    stamp: Mutex<Stamp>,
    registry: RwLock<Registry>,
    seen: Mutex<RecentSet>,
    debug_log: Mutex<VecDeque<DebugEntry>>,
    debug_capacity: usize,
    pending: Mutex<VecDeque<Arc<Event>>>,
    flush_scheduled: AtomicBool,
    flushing: AtomicBool,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Arc<Event>>>>,
    stats: AtomicBusStats,
}

/// Cloneable handle; clones share one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it leaves the handler registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove exactly this handler. Later calls are no-ops.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.registry.write().remove(&self.event_type, self.id);
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl EventBus {
    /// A bus with a fresh random session id and no transport.
    pub fn new(config: &SyncConfig) -> Self {
        let session_id = Uuid::new_v4().to_string();
        log::debug!("Event bus session {session_id}");

        Self {
            inner: Arc::new(BusInner {
                session_id,
                stamp: Mutex::new(Stamp {
                    clock: VectorClock::new(),
                    last_version: 0,
                    counter: 0,
                }),
                registry: RwLock::new(Registry::default()),
                seen: Mutex::new(RecentSet::new(config.dedup_capacity)),
                debug_log: Mutex::new(VecDeque::with_capacity(config.debug_log_capacity)),
                debug_capacity: config.debug_log_capacity,
                pending: Mutex::new(VecDeque::new()),
                flush_scheduled: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                transport: RwLock::new(None),
                outbound: Mutex::new(None),
                stats: AtomicBusStats::default(),
            }),
        }
    }

    /// Validate `config`, build its transport over `storage` and attach it.
    ///
    /// The transport is not connected yet; call [`EventBus::connect`].
    pub fn from_config(config: &SyncConfig, storage: StorageArea) -> Result<Self, ConfigError> {
        let transport = create_transport(config, storage)?;
        let bus = Self::new(config);
        bus.attach_transport(transport);
        Ok(bus)
    }

    /// Route outbound events through `transport` and inbound ones into this bus.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        let weak = Arc::downgrade(&self.inner);
        let inbound: InboundHandler = Arc::new(move |event: Event| {
            if let Some(inner) = weak.upgrade() {
                EventBus { inner }.handle_transport_message(event);
            }
        });
        transport.on_message(inbound);

        *self.inner.transport.write() = Some(transport);
        // A replaced transport's pump ends once its sender is dropped
        self.inner.outbound.lock().take();
        self.ensure_pump();
    }

    /// Connect the attached transport. Returns whether it is now connected;
    /// on failure the bus keeps working locally.
    pub async fn connect(&self) -> bool {
        let Some(transport) = self.transport() else {
            return false;
        };
        self.ensure_pump();

        match transport.connect().await {
            Ok(()) => {
                log::info!(
                    "Session {} connected over {}",
                    self.inner.session_id,
                    transport.transport_type().as_str()
                );
                true
            }
            Err(e) => {
                log::warn!("Transport connect failed, continuing local-only: {e}");
                false
            }
        }
    }

    /// Swap the transport's credentials and reconnect.
    pub async fn set_auth_token(&self, token: Option<String>) -> bool {
        let Some(transport) = self.transport() else {
            return false;
        };
        match transport.set_auth_token(token).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Reconnect with new credentials failed: {e}");
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Some(transport) = self.transport() {
            transport.disconnect().await;
        }
    }

    /// Register `handler` for `event_type`.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.write();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type: event_type.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Stamp, record and dispatch a new event; forward it unless `local_only`.
    ///
    /// Never waits for delivery.
    pub fn emit(&self, event_type: &str, payload: Value, options: EmitOptions) -> Arc<Event> {
        let event = Arc::new(self.stamp(event_type, payload));
        AtomicBusStats::bump(&self.inner.stats.emitted);
        self.record(Direction::Outbound, &event);

        if self.inner.seen.lock().insert(&event.event_id) {
            self.enqueue(event.clone());
        }
        if !options.local_only {
            self.forward(event.clone());
        }
        event
    }

    /// Emit `op` as a `plan:operation` event.
    pub fn emit_operation(&self, op: &Operation) -> Result<Arc<Event>, serde_json::Error> {
        let payload = serde_json::to_value(op)?;
        Ok(self.emit(types::PLAN_OPERATION, payload, EmitOptions::default()))
    }

    /// Inbound path for events delivered by a transport.
    ///
    /// Returns `false` when the event is dropped as a self-echo or duplicate.
    pub fn handle_transport_message(&self, event: Event) -> bool {
        if event.session_id == self.inner.session_id {
            AtomicBusStats::bump(&self.inner.stats.self_echoes);
            log::debug!("Dropping self-echo {}", event.event_id);
            return false;
        }
        if !self.inner.seen.lock().insert(&event.event_id) {
            AtomicBusStats::bump(&self.inner.stats.duplicates);
            log::debug!("Dropping duplicate {}", event.event_id);
            return false;
        }

        {
            let mut stamp = self.inner.stamp.lock();
            stamp.clock = stamp.clock.merge(&event.vector_clock);
        }
        AtomicBusStats::bump(&self.inner.stats.received);

        let event = Arc::new(event);
        self.record(Direction::Inbound, &event);
        self.enqueue(event);
        true
    }

    /// Dispatch everything pending now. Returns the number of events dispatched.
    ///
    /// A call made while a flush is already running returns 0; the running
    /// flush picks up whatever was queued.
    pub fn flush(&self) -> usize {
        if self.inner.flushing.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let mut dispatched = 0;
        loop {
            self.inner.flush_scheduled.store(false, Ordering::Release);
            let batch: Vec<Arc<Event>> = self.inner.pending.lock().drain(..).collect();
            if batch.is_empty() {
                break;
            }

            let handlers = self.snapshot_handlers(&batch);
            for event in &batch {
                if let Some(list) = handlers.get(event.event_type.as_str()) {
                    for handler in list {
                        self.invoke(handler, event);
                    }
                }
                AtomicBusStats::bump(&self.inner.stats.dispatched);
                dispatched += 1;
            }
        }

        self.inner.flushing.store(false, Ordering::Release);
        // Anything queued between the last drain and releasing the flag
        if !self.inner.pending.lock().is_empty() {
            dispatched += self.flush();
        }
        dispatched
    }

    fn stamp(&self, event_type: &str, payload: Value) -> Event {
        let session_id = &self.inner.session_id;
        let now = now_millis();

        let mut stamp = self.inner.stamp.lock();
        stamp.clock = stamp.clock.increment(session_id);
        stamp.last_version = now.max(stamp.last_version + 1);
        stamp.counter += 1;

        let nonce = Uuid::new_v4().as_fields().0;
        Event {
            event_type: event_type.to_string(),
            event_id: format!("{session_id}-{}-{nonce:08x}", stamp.counter),
            session_id: session_id.clone(),
            version: stamp.last_version,
            vector_clock: stamp.clock.clone(),
            timestamp: now,
            payload,
        }
    }

    fn record(&self, direction: Direction, event: &Arc<Event>) {
        if self.inner.debug_capacity == 0 {
            return;
        }
        let mut log = self.inner.debug_log.lock();
        while log.len() >= self.inner.debug_capacity {
            log.pop_front();
        }
        log.push_back(DebugEntry {
            direction,
            event: event.clone(),
        });
    }

    fn enqueue(&self, event: Arc<Event>) {
        self.inner.pending.lock().push_back(event);
        self.schedule_flush();
    }

    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.clone();
                handle.spawn(async move {
                    bus.flush();
                });
            }
            Err(_) => {
                self.flush();
            }
        }
    }

    fn snapshot_handlers(&self, batch: &[Arc<Event>]) -> HashMap<String, Vec<Handler>> {
        let registry = self.inner.registry.read();
        let mut snapshot: HashMap<String, Vec<Handler>> = HashMap::new();
        for event in batch {
            if snapshot.contains_key(&event.event_type) {
                continue;
            }
            if let Some(list) = registry.handlers.get(&event.event_type) {
                snapshot.insert(
                    event.event_type.clone(),
                    list.iter().map(|(_, handler)| handler.clone()).collect(),
                );
            }
        }
        snapshot
    }

    fn invoke(&self, handler: &Handler, event: &Event) {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                AtomicBusStats::bump(&self.inner.stats.handler_failures);
                log::error!("Handler for '{}' failed: {e}", event.event_type);
            }
            Err(panic) => {
                AtomicBusStats::bump(&self.inner.stats.handler_failures);
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("Handler for '{}' panicked: {reason}", event.event_type);
            }
        }
    }

    /// Start the task that hands outbound events to the transport in order.
    fn ensure_pump(&self) {
        let Some(transport) = self.transport() else {
            return;
        };
        let mut outbound = self.inner.outbound.lock();
        if outbound.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Event>>();
        let weak = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                match transport.send(&event).await {
                    Ok(()) => {}
                    // Local dispatch already happened; only this emission's
                    // cross-tab copy is lost
                    Err(TransportError::QuotaExceeded) => {
                        log::debug!("Cross-tab copy of {} dropped: storage full", event.event_id);
                    }
                    Err(e) => {
                        log::warn!("Cross-context delivery of {} failed: {e}", event.event_id);
                        if let Some(inner) = weak.upgrade() {
                            AtomicBusStats::bump(&inner.stats.send_failures);
                        }
                    }
                }
            }
        });
        *outbound = Some(tx);
    }

    fn forward(&self, event: Arc<Event>) {
        if self.inner.transport.read().is_none() {
            return;
        }
        self.ensure_pump();
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => log::debug!("No runtime for outbound delivery; {} stays local", event.event_id),
        }
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.read().clone()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Snapshot of the live clock.
    pub fn vector_clock(&self) -> VectorClock {
        self.inner.stamp.lock().clock.clone()
    }

    /// The debug ring, oldest first.
    pub fn recent_events(&self) -> Vec<DebugEntry> {
        self.inner.debug_log.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> BusStats {
        self.inner.stats.snapshot()
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .registry
            .read()
            .handlers
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_some_and(|t| t.is_connected())
    }

    pub fn is_network_connected(&self) -> bool {
        self.transport().is_some_and(|t| t.is_network_connected())
    }

    pub fn transport_type(&self) -> Option<TransportType> {
        self.transport().map(|t| t.transport_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use wayfare_core::{OperationKind, OperationLog};

    fn bus() -> EventBus {
        EventBus::new(&SyncConfig::default())
    }

    fn counter(bus: &EventBus, event_type: &str) -> (Arc<AtomicU64>, Subscription) {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let sub = bus.subscribe(event_type, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, sub)
    }

    fn remote(session: &str, id: &str, counter: u64) -> Event {
        let mut clock = VectorClock::new();
        for _ in 0..counter {
            clock = clock.increment(session);
        }
        Event {
            event_type: types::PLAN_UPDATED.to_string(),
            event_id: id.to_string(),
            session_id: session.to_string(),
            version: 1,
            vector_clock: clock,
            timestamp: 1,
            payload: json!({}),
        }
    }

    /// Records sends; optionally refuses to connect.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Event>>,
        refuse_connect: bool,
        handler: RwLock<Option<InboundHandler>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            if self.refuse_connect {
                Err(TransportError::ConnectionFailed("refused".to_string()))
            } else {
                Ok(())
            }
        }

        async fn send(&self, event: &Event) -> Result<(), TransportError> {
            self.sent.lock().push(event.clone());
            Ok(())
        }

        fn on_message(&self, handler: InboundHandler) {
            *self.handler.write() = Some(handler);
        }

        fn is_connected(&self) -> bool {
            !self.refuse_connect
        }

        fn transport_type(&self) -> TransportType {
            TransportType::LocalBroadcast
        }
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(bus().session_id(), bus().session_id());
    }

    #[test]
    fn test_emit_stamps_envelope() {
        let bus = bus();
        let first = bus.emit("x", json!({}), EmitOptions::default());
        let second = bus.emit("x", json!({}), EmitOptions::default());

        assert_eq!(first.session_id, bus.session_id());
        assert_eq!(first.vector_clock.get(bus.session_id()), 1);
        assert_eq!(second.vector_clock.get(bus.session_id()), 2);
        assert!(second.version > first.version);
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(bus.vector_clock(), second.vector_clock);
    }

    #[test]
    fn test_subscribe_and_dispatch_without_runtime() {
        let bus = bus();
        let (count, _sub) = counter(&bus, "plan:updated");
        let (other, _other_sub) = counter(&bus, "photo:created");

        bus.emit("plan:updated", json!({ "id": "p1" }), EmitOptions::default());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
        assert_eq!(bus.stats().dispatched, 1);
    }

    #[test]
    fn test_unsubscribe_is_exact_and_idempotent() {
        let bus = bus();
        let (first, sub1) = counter(&bus, "x");
        let (second, _sub2) = counter(&bus, "x");
        assert_eq!(bus.subscriber_count("x"), 2);

        assert!(sub1.unsubscribe());
        assert!(!sub1.unsubscribe());
        assert!(!sub1.is_active());
        assert_eq!(bus.subscriber_count("x"), 1);

        bus.emit("x", json!({}), EmitOptions::default());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handlers_isolated() {
        let bus = bus();
        let _err = bus.subscribe("x", |_| Err("boom".into()));
        let _panics = bus.subscribe("x", |_| panic!("handler exploded"));
        let (count, _sub) = counter(&bus, "x");

        bus.emit("x", json!({}), EmitOptions::default());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[test]
    fn test_self_echo_dropped() {
        let bus = bus();
        let (count, _sub) = counter(&bus, types::PLAN_UPDATED);

        let echo = remote(bus.session_id(), "echo-1", 1);
        assert!(!bus.handle_transport_message(echo));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.stats().self_echoes, 1);
    }

    #[test]
    fn test_duplicate_dropped() {
        let bus = bus();
        let (count, _sub) = counter(&bus, types::PLAN_UPDATED);

        assert!(bus.handle_transport_message(remote("B", "b-1", 1)));
        assert!(!bus.handle_transport_message(remote("B", "b-1", 1)));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().duplicates, 1);
        assert_eq!(bus.stats().received, 1);
    }

    #[test]
    fn test_inbound_merges_clock() {
        let bus = bus();
        bus.emit("x", json!({}), EmitOptions::default());
        bus.handle_transport_message(remote("B", "b-1", 4));

        let clock = bus.vector_clock();
        assert_eq!(clock.get(bus.session_id()), 1);
        assert_eq!(clock.get("B"), 4);

        let next = bus.emit("x", json!({}), EmitOptions::default());
        assert_eq!(next.vector_clock.get("B"), 4);
        assert_eq!(next.vector_clock.get(bus.session_id()), 2);
    }

    #[test]
    fn test_debug_ring_bounded() {
        let config = SyncConfig {
            debug_log_capacity: 3,
            ..SyncConfig::default()
        };
        let bus = EventBus::new(&config);
        for n in 0..5 {
            bus.emit("x", json!({ "n": n }), EmitOptions::default());
        }
        bus.handle_transport_message(remote("B", "b-1", 1));

        let recent = bus.recent_events();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].event.payload["n"], json!(3));
        assert_eq!(recent[2].direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn test_batch_dispatched_fifo_in_one_flush() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = bus.subscribe("x", move |event| {
            s.lock().push(event.payload["n"].as_u64().unwrap_or(0));
            Ok(())
        });

        for n in 0..3 {
            bus.emit("x", json!({ "n": n }), EmitOptions::default());
        }
        assert_eq!(bus.pending_count(), 3);
        assert!(seen.lock().is_empty());

        assert_eq!(bus.flush(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_handler_registered_mid_flush_misses_queued_events() {
        let bus = bus();
        let late = Arc::new(AtomicU64::new(0));
        let subs = Arc::new(Mutex::new(Vec::new()));

        let (b, l, s) = (bus.clone(), late.clone(), subs.clone());
        let _registrar = bus.subscribe("x", move |_| {
            if s.lock().is_empty() {
                let l = l.clone();
                let sub = b.subscribe("x", move |_| {
                    l.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                s.lock().push(sub);
            }
            Ok(())
        });

        bus.emit("x", json!({}), EmitOptions::default());
        bus.emit("x", json!({}), EmitOptions::default());
        bus.flush();
        assert_eq!(late.load(Ordering::SeqCst), 0);

        bus.emit("x", json!({}), EmitOptions::default());
        bus.flush();
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduled_flush_runs_on_runtime() {
        let bus = bus();
        let (count, _sub) = counter(&bus, "x");

        bus.emit("x", json!({}), EmitOptions::default());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_forwards_unless_local_only() {
        let bus = bus();
        let transport = Arc::new(RecordingTransport::default());
        bus.attach_transport(transport.clone());
        assert!(bus.connect().await);

        bus.emit("x", json!({ "n": 1 }), EmitOptions::default());
        bus.emit("x", json!({ "n": 2 }), EmitOptions::local_only());
        bus.emit("x", json!({ "n": 3 }), EmitOptions::default());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = transport.sent.lock();
        let ns: Vec<_> = sent.iter().map(|e| e.payload["n"].clone()).collect();
        assert_eq!(ns, vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn test_inbound_through_transport_handler() {
        let bus = bus();
        let transport = Arc::new(RecordingTransport::default());
        bus.attach_transport(transport.clone());
        let (count, _sub) = counter(&bus, types::PLAN_UPDATED);

        let handler = transport.handler.read().clone().unwrap();
        handler(remote("B", "b-1", 1));
        bus.flush();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_degrades_to_local() {
        let bus = bus();
        bus.attach_transport(Arc::new(RecordingTransport {
            refuse_connect: true,
            ..RecordingTransport::default()
        }));
        let (count, _sub) = counter(&bus, "x");

        assert!(!bus.connect().await);
        assert!(!bus.is_connected());

        bus.emit("x", json!({}), EmitOptions::default());
        bus.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_storage_quota_gives_up_silently() {
        let storage = StorageArea::with_quota(16);
        let bus = EventBus::from_config(&SyncConfig::local("k"), storage.clone()).unwrap();
        assert!(bus.connect().await);
        let (count, _sub) = counter(&bus, "x");

        bus.emit("x", json!({ "big": "x".repeat(64) }), EmitOptions::default());
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.flush();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().send_failures, 0);
        assert!(storage.get_item("k").is_none());
    }

    #[test]
    fn test_no_transport_introspection() {
        let bus = bus();
        assert!(!bus.is_connected());
        assert!(!bus.is_network_connected());
        assert!(bus.transport_type().is_none());
    }

    #[test]
    fn test_from_config_attaches_transport() {
        let bus = EventBus::from_config(&SyncConfig::local("k"), StorageArea::new()).unwrap();
        assert_eq!(bus.transport_type(), Some(TransportType::LocalBroadcast));
    }

    #[test]
    fn test_emit_operation() {
        let bus = bus();
        let received = Arc::new(Mutex::new(None));
        let r = received.clone();
        let _sub = bus.subscribe(types::PLAN_OPERATION, move |event| {
            *r.lock() = event.operation();
            Ok(())
        });

        let mut log = OperationLog::new(bus.session_id());
        let op = log.record(OperationKind::CompleteItem { item_id: "i1".to_string() });
        bus.emit_operation(&op).unwrap();

        let got = received.lock().clone().unwrap();
        assert_eq!(got.id, op.id);
        assert_eq!(got.item_id(), Some("i1"));
    }
}
