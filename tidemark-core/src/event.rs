//! Event records and identifiers.
//!
//! [`NewEvent`] is the write-side form a caller hands to the store;
//! [`Event`] is the stored form with the store-assigned stream version,
//! global position, and timestamp. Payloads are opaque `serde_json::Value`s;
//! the store never inspects them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Globally unique event identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Whether this is the nil (all-zero) identifier.
    ///
    /// Nil ids are rejected before storage.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one entity's event stream.
///
/// Use lowercase, kebab-case identifiers for consistency: `"order-1042"`,
/// `"user-account-7"`, etc.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Structured key/value metadata attached to an event.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// An event as submitted for appending, before the store assigns a stream
/// version and global position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: EventId,
    /// Event type tag, e.g. `"user-created"`. Handlers and reducers dispatch
    /// on this string.
    pub kind: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
    pub causation_id: Option<EventId>,
    pub correlation_id: Option<EventId>,
}

impl NewEvent {
    /// Create an event with a fresh id and no causation links.
    #[must_use]
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId::generate(),
            kind: kind.into(),
            data,
            metadata: Metadata::new(),
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Record the event that directly caused this one.
    #[must_use]
    pub fn caused_by(mut self, cause: EventId) -> Self {
        self.causation_id = Some(cause);
        self
    }

    /// Tag this event with a correlation id shared across a workflow.
    #[must_use]
    pub fn correlate(mut self, correlation: EventId) -> Self {
        self.correlation_id = Some(correlation);
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn metadata_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), MalformedEvent> {
        if self.id.is_nil() {
            return Err(MalformedEvent::NilEventId);
        }
        if self.kind.trim().is_empty() {
            return Err(MalformedEvent::BlankKind { id: self.id });
        }
        Ok(())
    }
}

/// A stored, immutable event.
///
/// `version` is the 1-based, contiguous sequence number within the stream;
/// `position` is the 1-based, gapless sequence number across all streams.
/// Once stored an event is never mutated or deleted; corrections are
/// modelled as new events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub stream_id: StreamId,
    pub kind: String,
    pub version: u64,
    pub position: u64,
    pub recorded_at: DateTime<Utc>,
    pub causation_id: Option<EventId>,
    pub correlation_id: Option<EventId>,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Event {
    pub(crate) fn from_new(
        new: NewEvent,
        stream_id: StreamId,
        version: u64,
        position: u64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new.id,
            stream_id,
            kind: new.kind,
            version,
            position,
            recorded_at,
            causation_id: new.causation_id,
            correlation_id: new.correlation_id,
            data: new.data,
            metadata: new.metadata,
        }
    }
}

/// A submitted event failed validation.
///
/// Malformed events are rejected before any mutation; the batch containing
/// one is not partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    /// The event id is the nil UUID.
    #[error("event id must not be nil")]
    NilEventId,
    /// The event kind is empty or whitespace.
    #[error("event {id} has a blank kind")]
    BlankKind { id: EventId },
    /// The target stream id is empty or whitespace.
    #[error("stream id must not be blank")]
    BlankStreamId,
    /// Another event with the same id already exists in the store or batch.
    #[error("event id {id} is already taken")]
    DuplicateEventId { id: EventId },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_event_generates_unique_ids() {
        let a = NewEvent::new("user-created", json!({}));
        let b = NewEvent::new("user-created", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn builder_sets_causation_and_metadata() {
        let cause = EventId::generate();
        let event = NewEvent::new("order-shipped", json!({"carrier": "dhl"}))
            .caused_by(cause)
            .metadata_entry("source", json!("api"));
        assert_eq!(event.causation_id, Some(cause));
        assert_eq!(event.metadata["source"], json!("api"));
    }

    #[test]
    fn blank_kind_is_rejected() {
        let event = NewEvent::new("   ", json!({}));
        assert!(matches!(
            event.validate(),
            Err(MalformedEvent::BlankKind { .. })
        ));
    }

    #[test]
    fn nil_id_is_rejected() {
        let mut event = NewEvent::new("user-created", json!({}));
        event.id = EventId::from(Uuid::nil());
        assert_eq!(event.validate(), Err(MalformedEvent::NilEventId));
    }

    #[test]
    fn event_round_trips_through_json() {
        let new = NewEvent::new("user-created", json!({"name": "ada"}));
        let stored = Event::from_new(new, StreamId::from("u1"), 1, 1, Utc::now());
        let bytes = serde_json::to_vec(&stored).unwrap();
        let decoded: Event = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, stored.id);
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.position, 1);
        assert_eq!(decoded.data, json!({"name": "ada"}));
    }
}
