//! Plan state: the reconciliation target held by the view/store layer.
//!
//! Nothing in this crate keeps a reference to the canonical copy. Operations
//! and the reconciler take snapshots by reference and return new values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::VectorClock;
use crate::reconcile::StateSnapshot;

/// One itinerary entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    #[serde(default)]
    pub complete: bool,
    /// Free-form item fields (title, location, times, notes, ...)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PlanItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            complete: false,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Apply a set of field changes.
    ///
    /// `id` is immutable; `complete` is routed to the typed flag when the
    /// value is a boolean. Everything else overwrites the free-form fields.
    pub fn apply_changes(&mut self, changes: &Map<String, Value>) {
        for (key, value) in changes {
            match key.as_str() {
                "id" => {}
                "complete" => {
                    if let Some(flag) = value.as_bool() {
                        self.complete = flag;
                    }
                }
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// A collaborator's access entry on a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub user_id: String,
    /// Role and capability flags (role, canEdit, canInvite, ...)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Permission {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Collaborative plan state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub items: Vec<PlanItem>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(rename = "_version", default)]
    pub version: u64,
    #[serde(rename = "_vectorClock", default)]
    pub vector_clock: VectorClock,
    #[serde(rename = "_lastOperation", default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<String>,
    /// Remaining plan fields (title, destination, dates, ...)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PlanState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_items(mut self, items: Vec<PlanItem>) -> Self {
        self.items = items;
        self
    }

    pub fn item(&self, item_id: &str) -> Option<&PlanItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn item_mut(&mut self, item_id: &str) -> Option<&mut PlanItem> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    pub fn has_item(&self, item_id: &str) -> bool {
        self.item(item_id).is_some()
    }

    pub fn permission(&self, user_id: &str) -> Option<&Permission> {
        self.permissions.iter().find(|p| p.user_id == user_id)
    }

    pub fn has_collaborator(&self, user_id: &str) -> bool {
        self.permission(user_id).is_some()
    }

    /// Item ids in display order.
    pub fn item_ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }

    /// View this plan as a reconciliation snapshot.
    pub fn to_snapshot(&self) -> Result<StateSnapshot, serde_json::Error> {
        let data = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let clock = if self.vector_clock.is_empty() {
            None
        } else {
            Some(self.vector_clock.clone())
        };
        Ok(StateSnapshot::new(data, self.version).with_vector_clock(clock))
    }

    /// Rebuild a plan from a reconciled snapshot.
    ///
    /// The snapshot's version and clock take precedence over any `_version`
    /// or `_vectorClock` carried inside the data.
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Result<Self, serde_json::Error> {
        let mut plan: PlanState = serde_json::from_value(Value::Object(snapshot.data.clone()))?;
        plan.version = snapshot.version;
        if let Some(clock) = &snapshot.vector_clock {
            plan.vector_clock = clock.clone();
        }
        Ok(plan)
    }
}
