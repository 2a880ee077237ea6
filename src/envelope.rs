//! Event envelope: the unit of transport.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Prefix for generated event ids.
const EVENT_ID_PREFIX: &str = "evt_";

/// Opaque key/value annotations carried alongside the payload.
pub type Meta = BTreeMap<String, Value>;

/// An event as it travels through the broker.
///
/// Immutable once built; fields are exposed through accessors only.
/// Serialized with camelCase field names (`eventId`, `event`, `timestamp`,
/// `payload`, `meta`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: String,
    event: String,
    timestamp: DateTime<Utc>,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<Meta>,
}

impl EventEnvelope {
    /// Build an envelope with a fresh event id and the current time.
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: new_event_id(),
            event: event.into(),
            timestamp: Utc::now(),
            payload,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn meta(&self) -> Option<&Meta> {
        self.meta.as_ref()
    }

    /// Look up a string field in the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Look up a string annotation.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Time-ordered id, so ids sort roughly by creation.
fn new_event_id() -> String {
    format!("{}{}", EVENT_ID_PREFIX, Uuid::now_v7().simple())
}
