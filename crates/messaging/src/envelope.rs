use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::version::SemVer;

/// Unique identifier for an event or command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A versioned message travelling on the bus.
///
/// Commands and events share this shape. `correlation_id` groups every
/// message of one saga; `causation_id` points at the message that triggered
/// this one, so following it backwards reconstructs the saga's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this message.
    pub event_id: EventId,

    /// The type of the message (e.g., "inventory.reserved").
    pub event_type: String,

    /// Schema version of `data`.
    pub event_version: SemVer,

    /// When the message was created.
    pub timestamp: DateTime<Utc>,

    /// The producing component (e.g., "order-saga").
    pub source: String,

    /// The saga this message belongs to.
    pub correlation_id: Option<Uuid>,

    /// The message that caused this one.
    pub causation_id: Option<EventId>,

    /// The type-specific payload.
    pub data: serde_json::Value,

    /// Additional metadata about the message.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Starts building an envelope of the given type and schema version.
    pub fn builder(event_type: impl Into<String>, event_version: SemVer) -> EventEnvelopeBuilder {
        EventEnvelopeBuilder {
            event_id: None,
            event_type: event_type.into(),
            event_version,
            timestamp: None,
            source: String::new(),
            correlation_id: None,
            causation_id: None,
            data: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    /// Starts building a reply to this envelope: same correlation, caused by this one.
    pub fn reply(
        &self,
        event_type: impl Into<String>,
        event_version: SemVer,
    ) -> EventEnvelopeBuilder {
        let mut builder = Self::builder(event_type, event_version).causation_id(self.event_id);
        builder.correlation_id = self.correlation_id;
        builder
    }

    /// Deserializes `data` into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: String,
    event_version: SemVer,
    timestamp: Option<DateTime<Utc>>,
    source: String,
    correlation_id: Option<Uuid>,
    causation_id: Option<EventId>,
    data: serde_json::Value,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn correlation_id(mut self, id: impl Into<Uuid>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn causation_id(mut self, id: EventId) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn data<T: Serialize>(mut self, data: &T) -> Result<Self, serde_json::Error> {
        self.data = serde_json::to_value(data)?;
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn data_raw(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type,
            event_version: self.event_version,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source: self.source,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            data: self.data,
            metadata: self.metadata,
        }
    }
}
