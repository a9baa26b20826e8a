//! Merge a remote update into local entity state.
//!
//! Decision order:
//! ```text
//! no local state ─────────────────────────────► seed
//! optimistic id matches local id ─────────────► replace with canonical
//! both clocks present:
//!     concurrent ─────────────────────────────► resolver / default merge
//!     local before incoming ──────────────────► accept
//!     local after incoming ───────────────────► stale (None)
//!     equal ──────────────────────────────────► fall through
//! incoming.version > local.version ───────────► accept
//! otherwise ──────────────────────────────────► stale (None)
//! ```
//! Every accepting path re-applies locally protected fields last, so a
//! field edited within the protection window is never clobbered by a remote
//! echo of an older value.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::clock::{CausalOrder, VectorClock};
use crate::now_millis;

/// Default protection window for locally edited fields.
pub const DEFAULT_PROTECTION_WINDOW_MS: u64 = 5_000;

// ───────────────────────────────────────────────────────────────────
// Inputs
// ───────────────────────────────────────────────────────────────────

/// Local entity state at reconciliation time.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub data: Map<String, Value>,
    pub version: u64,
    pub vector_clock: Option<VectorClock>,
}

impl StateSnapshot {
    pub fn new(data: Map<String, Value>, version: u64) -> Self {
        Self {
            data,
            version,
            vector_clock: None,
        }
    }

    pub fn with_vector_clock(mut self, clock: Option<VectorClock>) -> Self {
        self.vector_clock = clock;
        self
    }

    /// The entity's `id` field, when it is a string.
    pub fn id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

/// A remote update carried by an event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingUpdate {
    pub data: Map<String, Value>,
    pub version: Option<u64>,
    pub vector_clock: Option<VectorClock>,
    /// Client-generated placeholder id this canonical entity replaces
    pub optimistic_id: Option<String>,
}

impl IncomingUpdate {
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_vector_clock(mut self, clock: VectorClock) -> Self {
        self.vector_clock = Some(clock);
        self
    }

    pub fn with_optimistic_id(mut self, id: impl Into<String>) -> Self {
        self.optimistic_id = Some(id.into());
        self
    }
}

/// Field name → time (ms since epoch) of the last local edit.
///
/// Owned by whoever performs local edits; the reconciler only reads it.
#[derive(Debug, Clone, Default)]
pub struct LocalModificationMap {
    edits: HashMap<String, u64>,
}

impl LocalModificationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local edit of `field` now.
    pub fn mark(&mut self, field: impl Into<String>) {
        self.mark_at(field, now_millis());
    }

    pub fn mark_at(&mut self, field: impl Into<String>, at_ms: u64) {
        self.edits.insert(field.into(), at_ms);
    }

    pub fn last_modified(&self, field: &str) -> Option<u64> {
        self.edits.get(field).copied()
    }

    /// Whether `field` was edited within `window_ms` before `now_ms`.
    pub fn is_recent(&self, field: &str, now_ms: u64, window_ms: u64) -> bool {
        self.last_modified(field)
            .is_some_and(|at| now_ms.saturating_sub(at) < window_ms)
    }

    pub fn clear(&mut self, field: &str) {
        self.edits.remove(field);
    }

    /// Drop entries older than the window.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) {
        self.edits.retain(|_, at| now_ms.saturating_sub(*at) < window_ms);
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Reconciler
// ───────────────────────────────────────────────────────────────────

/// Which branch produced the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Seeded,
    OptimisticConfirmed,
    ConflictMerged,
    CausallyNewer,
    VersionNewer,
    Stale,
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub resolution: Resolution,
    /// `None` means leave local state untouched.
    pub state: Option<StateSnapshot>,
}

/// Custom merge for concurrent edits: `(local, incoming) → merged data`.
pub type ConflictResolver =
    dyn Fn(&StateSnapshot, &IncomingUpdate) -> Map<String, Value> + Send + Sync;

pub struct Reconciler {
    protected_fields: Vec<String>,
    window_ms: u64,
    resolver: Option<Box<ConflictResolver>>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            protected_fields: Vec::new(),
            window_ms: DEFAULT_PROTECTION_WINDOW_MS,
            resolver: None,
        }
    }

    pub fn with_protected_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }

    pub fn with_conflict_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&StateSnapshot, &IncomingUpdate) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn protected_fields(&self) -> &[String] {
        &self.protected_fields
    }

    /// Reconcile against the current wall clock.
    pub fn reconcile(
        &self,
        current: Option<&StateSnapshot>,
        incoming: &IncomingUpdate,
        local_mods: &LocalModificationMap,
    ) -> Option<StateSnapshot> {
        self.reconcile_at(current, incoming, local_mods, now_millis())
            .state
    }

    /// Reconcile as of `now_ms`. Pure: inputs are never modified.
    pub fn reconcile_at(
        &self,
        current: Option<&StateSnapshot>,
        incoming: &IncomingUpdate,
        local_mods: &LocalModificationMap,
        now_ms: u64,
    ) -> Reconciliation {
        let Some(local) = current else {
            return Reconciliation {
                resolution: Resolution::Seeded,
                state: Some(StateSnapshot {
                    data: incoming.data.clone(),
                    version: incoming.version.unwrap_or(0),
                    vector_clock: incoming.vector_clock.clone(),
                }),
            };
        };

        if let (Some(placeholder), Some(local_id)) = (&incoming.optimistic_id, local.id()) {
            if placeholder == local_id {
                let mut data = incoming.data.clone();
                self.protect(&mut data, local, local_mods, now_ms);
                return Reconciliation {
                    resolution: Resolution::OptimisticConfirmed,
                    state: Some(StateSnapshot {
                        data,
                        version: incoming.version.unwrap_or(local.version),
                        vector_clock: merged_clock(local, incoming),
                    }),
                };
            }
        }

        if let (Some(local_clock), Some(incoming_clock)) = (&local.vector_clock, &incoming.vector_clock) {
            match local_clock.compare(incoming_clock) {
                CausalOrder::Concurrent => {
                    let mut data = match &self.resolver {
                        Some(resolve) => resolve(local, incoming),
                        None => overlay(&local.data, &incoming.data),
                    };
                    self.protect(&mut data, local, local_mods, now_ms);
                    log::debug!("Merged concurrent update for {:?}", local.id());
                    return Reconciliation {
                        resolution: Resolution::ConflictMerged,
                        state: Some(StateSnapshot {
                            data,
                            version: local.version.max(incoming.version.unwrap_or(0)),
                            vector_clock: Some(local_clock.merge(incoming_clock)),
                        }),
                    };
                }
                CausalOrder::Before => {
                    return Reconciliation {
                        resolution: Resolution::CausallyNewer,
                        state: Some(self.accept(local, incoming, local_mods, now_ms)),
                    };
                }
                CausalOrder::After => {
                    log::debug!("Discarding causally stale update for {:?}", local.id());
                    return stale();
                }
                CausalOrder::Equal => {}
            }
        }

        match incoming.version {
            Some(version) if version > local.version => Reconciliation {
                resolution: Resolution::VersionNewer,
                state: Some(self.accept(local, incoming, local_mods, now_ms)),
            },
            _ => {
                log::debug!(
                    "Discarding stale update for {:?} (local v{}, incoming {:?})",
                    local.id(),
                    local.version,
                    incoming.version
                );
                stale()
            }
        }
    }

    fn accept(
        &self,
        local: &StateSnapshot,
        incoming: &IncomingUpdate,
        local_mods: &LocalModificationMap,
        now_ms: u64,
    ) -> StateSnapshot {
        let mut data = overlay(&local.data, &incoming.data);
        self.protect(&mut data, local, local_mods, now_ms);
        StateSnapshot {
            data,
            version: local.version.max(incoming.version.unwrap_or(0)),
            vector_clock: merged_clock(local, incoming),
        }
    }

    /// Restore protected fields edited within the window to their local value.
    fn protect(
        &self,
        data: &mut Map<String, Value>,
        local: &StateSnapshot,
        local_mods: &LocalModificationMap,
        now_ms: u64,
    ) {
        for field in &self.protected_fields {
            if !local_mods.is_recent(field, now_ms, self.window_ms) {
                continue;
            }
            match local.data.get(field) {
                Some(value) => {
                    data.insert(field.clone(), value.clone());
                }
                None => {
                    data.remove(field);
                }
            }
        }
    }
}

fn stale() -> Reconciliation {
    Reconciliation {
        resolution: Resolution::Stale,
        state: None,
    }
}

/// Incoming fields over local ones.
fn overlay(local: &Map<String, Value>, incoming: &Map<String, Value>) -> Map<String, Value> {
    let mut data = local.clone();
    for (key, value) in incoming {
        data.insert(key.clone(), value.clone());
    }
    data
}

fn merged_clock(local: &StateSnapshot, incoming: &IncomingUpdate) -> Option<VectorClock> {
    match (&local.vector_clock, &incoming.vector_clock) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const T: u64 = 1_700_000_000_000;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn local_plan() -> StateSnapshot {
        StateSnapshot::new(data(json!({ "id": "p1", "title": "Local title", "notes": "a" })), 10)
    }

    #[test]
    fn test_seeds_when_no_local_state() {
        let incoming = IncomingUpdate::new(data(json!({ "id": "p1" }))).with_version(3);
        let out = Reconciler::new().reconcile_at(None, &incoming, &LocalModificationMap::new(), T);

        assert_eq!(out.resolution, Resolution::Seeded);
        let state = out.state.unwrap();
        assert_eq!(state.version, 3);
        assert_eq!(state.id(), Some("p1"));
    }

    #[test]
    fn test_stale_version_without_clock_discarded() {
        let incoming = IncomingUpdate::new(data(json!({ "title": "old" }))).with_version(5);
        let out = Reconciler::new().reconcile(Some(&local_plan()), &incoming, &LocalModificationMap::new());
        assert!(out.is_none());
    }

    #[test]
    fn test_equal_version_discarded() {
        let incoming = IncomingUpdate::new(data(json!({ "title": "same" }))).with_version(10);
        let out = Reconciler::new().reconcile_at(Some(&local_plan()), &incoming, &LocalModificationMap::new(), T);
        assert_eq!(out.resolution, Resolution::Stale);
    }

    #[test]
    fn test_newer_version_accepted() {
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote" }))).with_version(11);
        let out = Reconciler::new().reconcile_at(Some(&local_plan()), &incoming, &LocalModificationMap::new(), T);

        assert_eq!(out.resolution, Resolution::VersionNewer);
        let state = out.state.unwrap();
        assert_eq!(state.data["title"], json!("Remote"));
        assert_eq!(state.data["notes"], json!("a"));
        assert_eq!(state.version, 11);
    }

    #[test]
    fn test_protection_window_boundaries() {
        let reconciler = Reconciler::new().with_protected_fields(["title"]);
        let mut mods = LocalModificationMap::new();
        mods.mark_at("title", T);
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote", "notes": "b" }))).with_version(11);

        let early = reconciler.reconcile_at(Some(&local_plan()), &incoming, &mods, T + 2_000);
        let early = early.state.unwrap();
        assert_eq!(early.data["title"], json!("Local title"));
        assert_eq!(early.data["notes"], json!("b"));

        let late = reconciler.reconcile_at(Some(&local_plan()), &incoming, &mods, T + 6_000);
        assert_eq!(late.state.unwrap().data["title"], json!("Remote"));
    }

    #[test]
    fn test_unprotected_field_not_shielded_by_recent_edit() {
        let reconciler = Reconciler::new().with_protected_fields(["notes"]);
        let mut mods = LocalModificationMap::new();
        mods.mark_at("title", T);
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote" }))).with_version(11);

        let state = reconciler.reconcile_at(Some(&local_plan()), &incoming, &mods, T + 100).state.unwrap();
        assert_eq!(state.data["title"], json!("Remote"));
    }

    #[test]
    fn test_causally_newer_accepted_even_with_lower_version() {
        let local = local_plan().with_vector_clock(Some(clock(&[("a", 1)])));
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote" })))
            .with_version(1)
            .with_vector_clock(clock(&[("a", 1), ("b", 1)]));

        let out = Reconciler::new().reconcile_at(Some(&local), &incoming, &LocalModificationMap::new(), T);
        assert_eq!(out.resolution, Resolution::CausallyNewer);
        let state = out.state.unwrap();
        assert_eq!(state.data["title"], json!("Remote"));
        assert_eq!(state.vector_clock, Some(clock(&[("a", 1), ("b", 1)])));
    }

    #[test]
    fn test_causally_older_discarded_even_with_higher_version() {
        let local = local_plan().with_vector_clock(Some(clock(&[("a", 2)])));
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote" })))
            .with_version(99)
            .with_vector_clock(clock(&[("a", 1)]));

        let out = Reconciler::new().reconcile_at(Some(&local), &incoming, &LocalModificationMap::new(), T);
        assert_eq!(out.resolution, Resolution::Stale);
        assert!(out.state.is_none());
    }

    #[test]
    fn test_equal_clocks_fall_back_to_version() {
        let local = local_plan().with_vector_clock(Some(clock(&[("a", 1)])));
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote" })))
            .with_version(12)
            .with_vector_clock(clock(&[("a", 1)]));

        let out = Reconciler::new().reconcile_at(Some(&local), &incoming, &LocalModificationMap::new(), T);
        assert_eq!(out.resolution, Resolution::VersionNewer);
    }

    #[test]
    fn test_concurrent_default_policy() {
        let reconciler = Reconciler::new().with_protected_fields(["title"]);
        let mut mods = LocalModificationMap::new();
        mods.mark_at("title", T);
        let local = local_plan().with_vector_clock(Some(clock(&[("a", 2), ("b", 1)])));
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote", "notes": "remote notes" })))
            .with_version(4)
            .with_vector_clock(clock(&[("a", 1), ("b", 2)]));

        let out = reconciler.reconcile_at(Some(&local), &incoming, &mods, T + 1_000);
        assert_eq!(out.resolution, Resolution::ConflictMerged);
        let state = out.state.unwrap();
        assert_eq!(state.data["title"], json!("Local title"));
        assert_eq!(state.data["notes"], json!("remote notes"));
        assert_eq!(state.vector_clock, Some(clock(&[("a", 2), ("b", 2)])));
        assert_eq!(state.version, 10);
    }

    #[test]
    fn test_concurrent_custom_resolver() {
        let reconciler = Reconciler::new().with_conflict_resolver(|local, _incoming| local.data.clone());
        let local = local_plan().with_vector_clock(Some(clock(&[("a", 1)])));
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote" })))
            .with_vector_clock(clock(&[("b", 1)]));

        let state = reconciler
            .reconcile_at(Some(&local), &incoming, &LocalModificationMap::new(), T)
            .state
            .unwrap();
        assert_eq!(state.data["title"], json!("Local title"));
        assert_eq!(state.vector_clock, Some(clock(&[("a", 1), ("b", 1)])));
    }

    #[test]
    fn test_optimistic_placeholder_replaced() {
        let reconciler = Reconciler::new().with_protected_fields(["notes"]);
        let mut mods = LocalModificationMap::new();
        mods.mark_at("notes", T);
        let local = StateSnapshot::new(data(json!({ "id": "tmp-1", "title": "Draft", "notes": "typing" })), 0);
        let incoming = IncomingUpdate::new(data(json!({ "id": "srv-9", "title": "Draft", "notes": "" })))
            .with_version(1)
            .with_optimistic_id("tmp-1");

        let out = reconciler.reconcile_at(Some(&local), &incoming, &mods, T + 500);
        assert_eq!(out.resolution, Resolution::OptimisticConfirmed);
        let state = out.state.unwrap();
        assert_eq!(state.id(), Some("srv-9"));
        assert_eq!(state.data["notes"], json!("typing"));
    }

    #[test]
    fn test_inputs_not_mutated() {
        let local = local_plan();
        let before = local.clone();
        let incoming = IncomingUpdate::new(data(json!({ "title": "Remote" }))).with_version(50);
        let _ = Reconciler::new().reconcile_at(Some(&local), &incoming, &LocalModificationMap::new(), T);
        assert_eq!(local, before);
    }

    #[test]
    fn test_modification_map_prune() {
        let mut mods = LocalModificationMap::new();
        mods.mark_at("a", T);
        mods.mark_at("b", T + 4_000);
        mods.prune(T + 6_000, DEFAULT_PROTECTION_WINDOW_MS);

        assert!(mods.last_modified("a").is_none());
        assert!(mods.is_recent("b", T + 6_000, DEFAULT_PROTECTION_WINDOW_MS));
        assert_eq!(mods.len(), 1);
    }
}
