//! Contains the identifier and envelope types events travel in: opaque
//! [`EventId`]s, totally-ordered [`EventReference`]s, raw [`StoredEvent`]
//! rows and the decoded [`Event`] envelope returned by a
//! [stream facade][crate::stream::EventStream].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream_id::EventStreamId;
use crate::tag::{Tag, Tags};

/// An opaque, globally-unique event identifier.
///
/// Equality is value-equality; an [`EventId`] never appears twice in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random identifier.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The store-wide position of a committed event.
///
/// Positions are strictly positive, dense and strictly monotonic in commit
/// order across the entire store, not per stream. The first committed event
/// gets position `1`.
pub type Position = u64;

/// The `(id, position)` pair that uniquely identifies a stored event and its
/// location in the global order.
///
/// Ordering between references is determined by [`Position`] alone, through
/// [`happened_before`](EventReference::happened_before) and
/// [`happened_after`](EventReference::happened_after); equality is on the
/// whole pair. "Beginning of log" is expressed as the *absence* of a
/// reference, distinct from any reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventReference {
    pub id: EventId,
    pub position: Position,
}

impl EventReference {
    pub fn new(id: EventId, position: Position) -> Self {
        Self { id, position }
    }

    /// Whether this reference precedes `other` in the global order.
    pub fn happened_before(&self, other: &EventReference) -> bool {
        self.position < other.position
    }

    /// Whether this reference follows `other` in the global order.
    pub fn happened_after(&self, other: &EventReference) -> bool {
        self.position > other.position
    }

    /// Of two optional references, the one further along the log.
    ///
    /// Used by the notification dispatcher to advance its coalescing target.
    pub fn max_by_position(
        a: Option<EventReference>,
        b: Option<EventReference>,
    ) -> Option<EventReference> {
        match (a, b) {
            (Some(a), Some(b)) if b.position > a.position => Some(b),
            (Some(a), _) => Some(a),
            (None, b) => b,
        }
    }
}

impl fmt::Display for EventReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.position)
    }
}

/// The name of an event type.
///
/// Typically derived from a domain-side type symbol, but treated opaquely by
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event row as persisted by the [storage engine][crate::store].
///
/// Immutable after creation; the only permitted change is the out-of-band
/// administrative replacement of `erasable_data` with absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// The stream the event was written to. Never a wildcard.
    pub stream: EventStreamId,

    pub event_type: EventType,

    /// The event's identity and place in the global order.
    pub reference: EventReference,

    /// The serialized non-erasable part of the payload.
    pub immutable_data: Vec<u8>,

    /// The serialized privacy-regulated part of the payload, if any is left.
    pub erasable_data: Option<Vec<u8>>,

    pub tags: Tags,

    pub timestamp: DateTime<Utc>,
}

/// An event handed to the [storage engine][crate::store] for appending,
/// not yet assigned an identity or position.
#[derive(Debug, Clone, PartialEq)]
pub struct UncommittedEvent {
    /// The target stream; when absent, the append-level default stream
    /// applies.
    pub stream: Option<EventStreamId>,

    pub event_type: EventType,
    pub immutable_data: Vec<u8>,
    pub erasable_data: Option<Vec<u8>>,
    pub tags: Tags,
}

/// A decoded domain event, enriched with the metadata the store assigned at
/// commit time.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub stream: EventStreamId,
    pub event_type: EventType,
    pub reference: EventReference,
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,

    /// The decoded domain payload.
    pub payload: T,
}

impl<T> PartialEq for Event<T>
where
    T: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference && self.payload == other.payload
    }
}

/// A domain event handed to a [stream facade][crate::stream::EventStream]
/// for appending, together with the tags it should be indexed under.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent<T> {
    pub payload: T,
    pub tags: Tags,
}

impl<T> NewEvent<T> {
    pub fn new(payload: T, tags: Tags) -> Self {
        Self { payload, tags }
    }

    /// Adds a [`Tag`], returning the updated event.
    #[must_use]
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags = self.tags.with(tag);
        self
    }
}

impl<T> From<T> for NewEvent<T> {
    fn from(payload: T) -> Self {
        Self {
            payload,
            tags: Tags::none(),
        }
    }
}
