//! # wayfare-core — causal ordering and plan mutation model
//!
//! Pure, synchronous building blocks for collaborative plan editing. Nothing
//! here touches a runtime or a transport; `wayfare-sync` carries these values
//! between sessions.
//!
//! ## Modules
//!
//! - [`clock`] — Vector clocks and causal comparison
//! - [`state`] — Plan state (items, collaborators, sync metadata)
//! - [`ops`] — Idempotent plan operations, reducer, and operation log
//! - [`reconcile`] — Merge policy for remote updates with field protection
//! - [`recent`] — Bounded id set used for de-duplication

pub mod clock;
pub mod ops;
pub mod recent;
pub mod reconcile;
pub mod state;

pub use clock::{CausalOrder, VectorClock};
pub use ops::{
    apply_operation, apply_operations, commutes, Operation, OperationKind, OperationLog,
    DEFAULT_LOCAL_CAPACITY,
};
pub use recent::RecentSet;
pub use reconcile::{
    IncomingUpdate, LocalModificationMap, Reconciler, Reconciliation, Resolution, StateSnapshot,
    DEFAULT_PROTECTION_WINDOW_MS,
};
pub use state::{Permission, PlanItem, PlanState};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
