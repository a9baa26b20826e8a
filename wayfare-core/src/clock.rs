//! Vector clocks for causal ordering between sessions.
//!
//! A clock maps a session id to the number of events that session has
//! emitted. Every operation here is pure: inputs are never mutated and a new
//! clock is returned, so a clock can be handed across ownership boundaries
//! without aliasing anyone else's copy.
//!
//! ```text
//!   A: {a:2, b:1}      B: {a:1, b:3}
//!          │                  │
//!          └──── compare ─────┘  → Concurrent
//!          └───── merge ──────┘  → {a:2, b:3}
//! ```
//!
//! Reference: Kleppmann, Chapter 5 — Detecting Concurrent Writes

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalOrder {
    /// Left happened before right
    Before,
    /// Left happened after right
    After,
    /// Identical histories
    Equal,
    /// Neither dominates — a true concurrent edit
    Concurrent,
}

impl CausalOrder {
    /// The ordering seen from the other side of the comparison.
    pub fn inverse(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::After => Self::Before,
            other => other,
        }
    }
}

/// Per-session event counters.
///
/// Backed by a `BTreeMap` so equality and serialization are independent of
/// insertion order. Serialized as a plain JSON object: `{"<session>": n}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// An empty clock.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Counter for `session_id` (0 when absent).
    pub fn get(&self, session_id: &str) -> u64 {
        self.0.get(session_id).copied().unwrap_or(0)
    }

    /// Return a copy with `session_id`'s counter advanced by one.
    pub fn increment(&self, session_id: &str) -> Self {
        let mut next = self.clone();
        *next.0.entry(session_id.to_string()).or_insert(0) += 1;
        next
    }

    /// Pairwise maximum over the union of both key sets.
    pub fn merge(&self, other: &VectorClock) -> Self {
        let mut merged = self.clone();
        for (session, &counter) in &other.0 {
            let slot = merged.0.entry(session.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
        merged
    }

    /// Compare causally. Missing keys count as zero.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for session in self.0.keys().chain(other.0.keys()) {
            match self.get(session).cmp(&other.get(session)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True if `self` has seen everything `other` has.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            CausalOrder::After | CausalOrder::Equal
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate `(session_id, counter)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_new_clock_is_empty() {
        let c = VectorClock::new();
        assert!(c.is_empty());
        assert_eq!(c.get("anyone"), 0);
    }

    #[test]
    fn test_increment_is_pure() {
        let base = clock(&[("a", 1)]);
        let next = base.increment("a");

        assert_eq!(base.get("a"), 1);
        assert_eq!(next.get("a"), 2);
        assert_eq!(next.increment("b").get("b"), 1);
    }

    #[test]
    fn test_merge_takes_pairwise_max() {
        let a = clock(&[("a", 3), ("b", 1)]);
        let b = clock(&[("b", 4), ("c", 2)]);

        let merged = a.merge(&b);
        assert_eq!(merged, clock(&[("a", 3), ("b", 4), ("c", 2)]));
    }

    #[test]
    fn test_merge_commutative_and_idempotent() {
        let a = clock(&[("a", 3), ("b", 1)]);
        let b = clock(&[("a", 1), ("c", 7)]);

        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn test_compare_equal() {
        let a = clock(&[("a", 2), ("b", 1)]);
        assert_eq!(a.compare(&a), CausalOrder::Equal);
        assert_eq!(a.compare(&a.clone()), CausalOrder::Equal);
        assert_eq!(VectorClock::new().compare(&VectorClock::new()), CausalOrder::Equal);
    }

    #[test]
    fn test_compare_before_after_are_inverse() {
        let ancestor = clock(&[("a", 1)]);
        let descendant = ancestor.increment("a").increment("b");

        assert_eq!(ancestor.compare(&descendant), CausalOrder::Before);
        assert_eq!(descendant.compare(&ancestor), CausalOrder::After);
        assert_eq!(
            ancestor.compare(&descendant).inverse(),
            descendant.compare(&ancestor)
        );
    }

    #[test]
    fn test_compare_concurrent_branches() {
        let ancestor = clock(&[("a", 1), ("b", 1)]);
        let left = ancestor.increment("a");
        let right = ancestor.increment("b");

        assert_eq!(left.compare(&right), CausalOrder::Concurrent);
        assert_eq!(right.compare(&left), CausalOrder::Concurrent);
    }

    #[test]
    fn test_compare_missing_keys_count_as_zero() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);
        assert_eq!(a.compare(&b), CausalOrder::Before);
        assert_eq!(clock(&[("a", 0)]).compare(&VectorClock::new()), CausalOrder::Equal);
    }

    #[test]
    fn test_merged_clock_dominates_inputs() {
        let left = clock(&[("a", 2)]);
        let right = clock(&[("b", 5)]);
        let merged = left.merge(&right);

        assert!(merged.dominates(&left));
        assert!(merged.dominates(&right));
        assert!(!left.dominates(&right));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let c = clock(&[("s1", 4)]);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"s1":4}"#);

        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_rejects_non_numeric_counters() {
        let parsed: Result<VectorClock, _> = serde_json::from_str(r#"{"s1":"four"}"#);
        assert!(parsed.is_err());
    }
}
