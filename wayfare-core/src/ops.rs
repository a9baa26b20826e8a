//! Typed, idempotent plan mutations.
//!
//! Every operation is safe to apply more than once: inserts check for
//! existence, deletes filter, and completion toggles are no-ops when the item
//! is already in the target state. Operations on different items commute, so
//! replicas that receive the same set in different orders converge.
//!
//! Wire shape (JSON):
//! ```text
//! { "id": "<session>:<n>", "type": "ADD_ITEM", "payload": { "item": {…} },
//!   "sessionId": "…", "vectorClock": { "<session>": n }, "timestamp": 1700000000000 }
//! ```
//!
//! Reference: Shapiro et al. — Conflict-free Replicated Data Types (op-based)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;

use crate::clock::VectorClock;
use crate::now_millis;
use crate::recent::RecentSet;
use crate::state::{Permission, PlanItem, PlanState};

// ───────────────────────────────────────────────────────────────────
// Operation types
// ───────────────────────────────────────────────────────────────────

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum OperationKind {
    /// Seed a plan, or resurrect one that was deleted
    CreatePlan { state: PlanState },
    DeletePlan { plan_id: String },
    AddItem { item: PlanItem },
    UpdateItem { item_id: String, changes: Map<String, Value> },
    DeleteItem { item_id: String },
    CompleteItem { item_id: String },
    UncompleteItem { item_id: String },
    /// Full order replacement; unnamed items are appended
    ReorderItems { item_ids: Vec<String> },
    AddCollaborator { permission: Permission },
    RemoveCollaborator { user_id: String },
    /// Last-write-wins on the named user's permission fields
    UpdatePermission { user_id: String, changes: Map<String, Value> },
}

impl OperationKind {
    /// The wire tag, e.g. `ADD_ITEM`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreatePlan { .. } => "CREATE_PLAN",
            Self::DeletePlan { .. } => "DELETE_PLAN",
            Self::AddItem { .. } => "ADD_ITEM",
            Self::UpdateItem { .. } => "UPDATE_ITEM",
            Self::DeleteItem { .. } => "DELETE_ITEM",
            Self::CompleteItem { .. } => "COMPLETE_ITEM",
            Self::UncompleteItem { .. } => "UNCOMPLETE_ITEM",
            Self::ReorderItems { .. } => "REORDER_ITEMS",
            Self::AddCollaborator { .. } => "ADD_COLLABORATOR",
            Self::RemoveCollaborator { .. } => "REMOVE_COLLABORATOR",
            Self::UpdatePermission { .. } => "UPDATE_PERMISSION",
        }
    }

    /// Item this operation targets, if it targets exactly one.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::AddItem { item } => Some(&item.id),
            Self::UpdateItem { item_id, .. }
            | Self::DeleteItem { item_id }
            | Self::CompleteItem { item_id }
            | Self::UncompleteItem { item_id } => Some(item_id),
            _ => None,
        }
    }

    fn is_plan_lifecycle(&self) -> bool {
        matches!(self, Self::CreatePlan { .. } | Self::DeletePlan { .. })
    }
}

/// A stamped, replayable mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(flatten)]
    pub kind: OperationKind,
    pub session_id: String,
    #[serde(default)]
    pub vector_clock: VectorClock,
    pub timestamp: u64,
}

impl Operation {
    /// Build an operation stamped with the current wall-clock time.
    pub fn new(
        id: impl Into<String>,
        kind: OperationKind,
        session_id: impl Into<String>,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            session_id: session_id.into(),
            vector_clock,
            timestamp: now_millis(),
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        self.kind.item_id()
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.name()
    }
}

// ───────────────────────────────────────────────────────────────────
// Reducer
// ───────────────────────────────────────────────────────────────────

/// Apply one operation to a plan snapshot, returning the next state.
///
/// `None` is a deleted (or never created) plan. Only `CREATE_PLAN` turns
/// `None` into a plan; every other operation is a no-op against it.
pub fn apply_operation(state: Option<&PlanState>, op: &Operation) -> Option<PlanState> {
    let Some(current) = state else {
        return match &op.kind {
            OperationKind::CreatePlan { state } => Some(stamp(state.clone(), op)),
            _ => {
                log::debug!("Ignoring {} against deleted plan", op.type_name());
                None
            }
        };
    };

    let mut next = current.clone();
    match &op.kind {
        OperationKind::CreatePlan { .. } => {}
        OperationKind::DeletePlan { .. } => return None,
        OperationKind::AddItem { item } => {
            if !next.has_item(&item.id) {
                next.items.push(item.clone());
            }
        }
        OperationKind::UpdateItem { item_id, changes } => {
            if let Some(item) = next.item_mut(item_id) {
                item.apply_changes(changes);
            }
        }
        OperationKind::DeleteItem { item_id } => {
            next.items.retain(|item| &item.id != item_id);
        }
        OperationKind::CompleteItem { item_id } => {
            if let Some(item) = next.item_mut(item_id) {
                item.complete = true;
            }
        }
        OperationKind::UncompleteItem { item_id } => {
            if let Some(item) = next.item_mut(item_id) {
                item.complete = false;
            }
        }
        OperationKind::ReorderItems { item_ids } => {
            next.items = reorder(&next.items, item_ids);
        }
        OperationKind::AddCollaborator { permission } => {
            if !next.has_collaborator(&permission.user_id) {
                next.permissions.push(permission.clone());
            }
        }
        OperationKind::RemoveCollaborator { user_id } => {
            next.permissions.retain(|p| &p.user_id != user_id);
        }
        OperationKind::UpdatePermission { user_id, changes } => {
            if let Some(perm) = next.permissions.iter_mut().find(|p| &p.user_id == user_id) {
                for (key, value) in changes {
                    if key != "userId" {
                        perm.fields.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    Some(stamp(next, op))
}

/// Fold `operations` left to right over `state`.
pub fn apply_operations(state: Option<&PlanState>, operations: &[Operation]) -> Option<PlanState> {
    let mut current = state.cloned();
    for op in operations {
        current = apply_operation(current.as_ref(), op);
    }
    current
}

/// Whether applying `a` then `b` is guaranteed to equal `b` then `a`.
pub fn commutes(a: &Operation, b: &Operation) -> bool {
    if a.kind.is_plan_lifecycle() || b.kind.is_plan_lifecycle() {
        return false;
    }

    match (&a.kind, &b.kind) {
        (OperationKind::ReorderItems { .. }, OperationKind::ReorderItems { .. }) => false,
        (OperationKind::AddItem { item }, OperationKind::DeleteItem { item_id })
        | (OperationKind::DeleteItem { item_id }, OperationKind::AddItem { item }) => {
            &item.id != item_id
        }
        _ => true,
    }
}

/// Replace item order with `order`; items it doesn't name keep their
/// relative order and go last. Unknown and repeated ids are skipped.
fn reorder(items: &[PlanItem], order: &[String]) -> Vec<PlanItem> {
    let mut placed = vec![false; items.len()];
    let mut result = Vec::with_capacity(items.len());

    for id in order {
        if let Some(idx) = items.iter().position(|item| &item.id == id) {
            if !placed[idx] {
                placed[idx] = true;
                result.push(items[idx].clone());
            }
        }
    }
    for (idx, item) in items.iter().enumerate() {
        if !placed[idx] {
            result.push(item.clone());
        }
    }
    result
}

/// Record operation metadata on the resulting state. Every step is
/// idempotent so re-application leaves the state unchanged.
fn stamp(mut state: PlanState, op: &Operation) -> PlanState {
    state.vector_clock = state.vector_clock.merge(&op.vector_clock);
    state.version = state.version.max(op.timestamp);
    state.last_operation = Some(op.id.clone());
    state
}

// ───────────────────────────────────────────────────────────────────
// Operation log
// ───────────────────────────────────────────────────────────────────

/// Default number of applied operation ids remembered.
pub const DEFAULT_APPLIED_CAPACITY: usize = 1000;

/// Default number of undelivered local operations kept for catch-up.
pub const DEFAULT_LOCAL_CAPACITY: usize = 150;

/// Per-session operation producer and replay guard.
///
/// Stamps locally created operations with this session's clock and keeps a
/// bounded set of applied ids so remote replays are skipped even if the
/// operation itself would be a no-op.
///
/// Local operations are held in a capped ring (oldest evicted) until a
/// peer's clock acknowledges them via [`OperationLog::prune_acknowledged`].
pub struct OperationLog {
    session_id: String,
    clock: VectorClock,
    applied: RecentSet,
    local: VecDeque<Operation>,
    local_capacity: usize,
}

impl OperationLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_capacity(session_id, DEFAULT_APPLIED_CAPACITY)
    }

    pub fn with_capacity(session_id: impl Into<String>, applied_capacity: usize) -> Self {
        Self {
            session_id: session_id.into(),
            clock: VectorClock::new(),
            applied: RecentSet::new(applied_capacity),
            local: VecDeque::new(),
            local_capacity: DEFAULT_LOCAL_CAPACITY,
        }
    }

    /// Cap the local record (minimum 1).
    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = capacity.max(1);
        while self.local.len() > self.local_capacity {
            self.local.pop_front();
        }
        self
    }

    /// Create a local operation. It is marked applied: the caller has
    /// already applied it optimistically.
    pub fn record(&mut self, kind: OperationKind) -> Operation {
        self.clock = self.clock.increment(&self.session_id);
        let counter = self.clock.get(&self.session_id);
        let op = Operation::new(
            format!("{}:{}", self.session_id, counter),
            kind,
            self.session_id.clone(),
            self.clock.clone(),
        );
        self.applied.insert(&op.id);
        if self.local.len() >= self.local_capacity {
            self.local.pop_front();
        }
        self.local.push_back(op.clone());
        op
    }

    /// Apply an operation unless its id was seen before.
    ///
    /// Returns `None` when skipped; otherwise the next state (which is itself
    /// `None` if the plan is deleted).
    pub fn apply(&mut self, state: Option<&PlanState>, op: &Operation) -> Option<Option<PlanState>> {
        if !self.applied.insert(&op.id) {
            log::debug!("Skipping already applied operation {}", op.id);
            return None;
        }
        self.clock = self.clock.merge(&op.vector_clock);
        Some(apply_operation(state, op))
    }

    /// Apply a batch, skipping ids already seen.
    pub fn apply_all(&mut self, state: Option<&PlanState>, ops: &[Operation]) -> Option<PlanState> {
        let mut current = state.cloned();
        for op in ops {
            if let Some(next) = self.apply(current.as_ref(), op) {
                current = next;
            }
        }
        current
    }

    pub fn has_applied(&self, op_id: &str) -> bool {
        self.applied.contains(op_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Retained local operations, oldest first.
    pub fn local_operations(&self) -> impl Iterator<Item = &Operation> {
        self.local.iter()
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn local_capacity(&self) -> usize {
        self.local_capacity
    }

    /// Drop local operations the given clock already covers. Returns how
    /// many were removed.
    pub fn prune_acknowledged(&mut self, seen: &VectorClock) -> usize {
        let seen_counter = seen.get(&self.session_id);
        let before = self.local.len();
        self.local
            .retain(|op| op.vector_clock.get(&self.session_id) > seen_counter);
        before - self.local.len()
    }

    /// Retained local operations the given clock has not yet seen. Anything
    /// evicted from the ring is gone; a peer further behind needs a fresh
    /// snapshot instead.
    pub fn operations_since(&self, seen: &VectorClock) -> Vec<Operation> {
        let seen_counter = seen.get(&self.session_id);
        self.local
            .iter()
            .filter(|op| op.vector_clock.get(&self.session_id) > seen_counter)
            .cloned()
            .collect()
    }
}
