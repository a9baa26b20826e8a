//! Event envelope and its JSON wire form.
//!
//! ```text
//! { "type": "plan:updated", "eventId": "…", "sessionId": "…", "version": 1700000000000,
//!   "vectorClock": { "<session>": 3 }, "timestamp": 1700000000000, "payload": { … } }
//! ```
//!
//! Inbound text is validated here, at the deserialization boundary: a frame
//! that fails to decode never reaches dispatch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use wayfare_core::{IncomingUpdate, Operation, VectorClock};

/// Well-known event types.
pub mod types {
    pub const PLAN_CREATED: &str = "plan:created";
    pub const PLAN_UPDATED: &str = "plan:updated";
    pub const PLAN_DELETED: &str = "plan:deleted";
    /// Carries a serialized plan operation
    pub const PLAN_OPERATION: &str = "plan:operation";
    pub const ITEM_CREATED: &str = "item:created";
    pub const ITEM_UPDATED: &str = "item:updated";
    pub const ITEM_DELETED: &str = "item:deleted";
    pub const PHOTO_CREATED: &str = "photo:created";
    pub const PHOTO_DELETED: &str = "photo:deleted";
    pub const DOCUMENT_CREATED: &str = "document:created";
    pub const DOCUMENT_DELETED: &str = "document:deleted";
    pub const COLLABORATOR_ADDED: &str = "collaborator:added";
    pub const COLLABORATOR_REMOVED: &str = "collaborator:removed";
}

/// Errors decoding an inbound event.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("Malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Event field '{0}' is empty")]
    EmptyField(&'static str),
}

/// An immutable, broadcast-once envelope.
///
/// Handlers receive `&Event` from a shared `Arc`, so nothing downstream of
/// emission can modify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub event_id: String,
    pub session_id: String,
    pub version: u64,
    pub vector_clock: VectorClock,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse and validate a JSON wire frame.
    pub fn decode(text: &str) -> Result<Self, EventDecodeError> {
        let event: Event = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EventDecodeError> {
        if self.event_type.is_empty() {
            return Err(EventDecodeError::EmptyField("type"));
        }
        if self.event_id.is_empty() {
            return Err(EventDecodeError::EmptyField("eventId"));
        }
        if self.session_id.is_empty() {
            return Err(EventDecodeError::EmptyField("sessionId"));
        }
        Ok(())
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// The plan operation carried by a `plan:operation` event.
    pub fn operation(&self) -> Option<Operation> {
        if self.event_type != types::PLAN_OPERATION {
            return None;
        }
        match self.payload_as::<Operation>() {
            Ok(op) => Some(op),
            Err(e) => {
                log::warn!("Undecodable operation in event {}: {e}", self.event_id);
                None
            }
        }
    }

    /// View the payload as a reconciler input.
    ///
    /// Accepts either `{ "data": {…}, "version"?, "optimisticId"? }` or a bare
    /// entity object. The envelope's clock is used, and its version when the
    /// payload doesn't carry one.
    pub fn incoming_update(&self) -> Option<IncomingUpdate> {
        let payload = self.payload.as_object()?;
        let (data, version, optimistic_id) = match payload.get("data") {
            Some(Value::Object(data)) => (
                data.clone(),
                payload.get("version").and_then(Value::as_u64),
                payload
                    .get("optimisticId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            _ => (payload.clone(), None, None),
        };

        Some(IncomingUpdate {
            data,
            version: Some(version.unwrap_or(self.version)),
            vector_clock: Some(self.vector_clock.clone()),
            optimistic_id,
        })
    }
}
