//! Contains the payload codec: the split of a domain event into immutable
//! and erasable halves on write, their merge and decoding on read, and the
//! up-cast of legacy event types.
//!
//! Two codec variants expose the same [`EventCodec`] contract: the
//! [typed][json::TypedJsonCodec] codec maps payloads to statically-known
//! domain types, the [raw][json::RawJsonCodec] codec preserves them as
//! structured JSON values without type binding.

pub mod json;
mod schema;

pub use json::{RawEvent, RawJsonCodec, TypedJsonCodec};
pub use schema::{merge, ErasableSchema, FieldKind};

use crate::event::EventType;
use crate::query::EventTypesFilter;

/// A domain message with a name unique within its domain.
///
/// The name is what the message is stored under as its [`EventType`], and
/// what the codec keys its registry by.
pub trait Message {
    /// Returns the domain name of the message.
    fn name(&self) -> &str;
}

/// The serialized form of a domain event, ready for the storage engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedEvent {
    pub event_type: EventType,
    pub immutable_data: Vec<u8>,
    pub erasable_data: Option<Vec<u8>>,
}

/// All possible error types returned by an [`EventCodec`].
///
/// None of these are retryable: a payload that failed to encode or decode
/// will keep failing until the registry or the payload changes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The received event type has no mapping in the codec registry.
    #[error("unknown event type {event_type}, known types are: {known:?}")]
    UnknownEventType {
        event_type: EventType,
        known: Vec<EventType>,
    },

    /// Appending a legacy (deprecated) event type is rejected; new events
    /// must be written as their current type.
    #[error("event type {event_type} is legacy, append events of type {target} instead")]
    LegacyEventType {
        event_type: EventType,
        target: EventType,
    },

    /// The event's registered name does not match the payload shape it was
    /// registered with.
    #[error("event type {event_type} does not match its registered payload shape")]
    PayloadMismatch { event_type: EventType },

    #[error("failed to encode event payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode event payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encodes domain events into their stored split form and decodes them back,
/// up-casting legacy types on the way out.
pub trait EventCodec: Send + Sync {
    /// The domain event type this codec maps payloads to.
    type Event: Send + Sync;

    /// Serializes a domain event into its type name and split payload.
    fn encode(&self, event: &Self::Event) -> Result<EncodedEvent, CodecError>;

    /// Reconstructs a domain event from its split payload.
    ///
    /// When `erasable_data` is absent, erasable leaves of the reconstructed
    /// event are absent; non-erasable fields are unaffected.
    fn decode(
        &self,
        event_type: &EventType,
        immutable_data: &[u8],
        erasable_data: Option<&[u8]>,
    ) -> Result<Self::Event, CodecError>;

    /// Whether events of this type may be appended through this codec.
    fn accepts(&self, event_type: &EventType) -> bool;

    /// Widens a type filter with the legacy types mapped to each filtered
    /// type, so queries keep matching events stored before an up-cast was
    /// introduced. The wildcard filter stays a wildcard.
    fn expand_types(&self, filter: &EventTypesFilter) -> EventTypesFilter;
}
