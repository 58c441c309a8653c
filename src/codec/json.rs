//! Contains the JSON implementations of the [`EventCodec`] contract: the
//! [`TypedJsonCodec`] registry for statically-known domain types, and the
//! [`RawJsonCodec`] passthrough for untyped access to the same log.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::codec::{merge, CodecError, EncodedEvent, ErasableSchema, EventCodec, Message};
use crate::event::EventType;
use crate::query::EventTypesFilter;

type EncodeFn<T> = Box<dyn Fn(&T) -> Option<Result<Value, serde_json::Error>> + Send + Sync>;
type DecodeFn<T> = Box<dyn Fn(Value) -> Result<T, serde_json::Error> + Send + Sync>;

struct TypeEntry<T> {
    schema: ErasableSchema,
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

struct LegacyEntry<T> {
    target: EventType,
    decode: DecodeFn<T>,
}

/// A JSON codec mapping stored payloads to a statically-known domain event
/// type `T`.
///
/// The registry is keyed by [`Message::name`]: each current variant is
/// registered with its [`ErasableSchema`] and a wrap/unwrap pair tying the
/// variant payload to `T`; each legacy variant is registered with a pure
/// up-cast into `T`, applied on decode.
///
/// ```
/// use consistently::codec::{ErasableSchema, Message, TypedJsonCodec};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// struct CustomerRenamed { name: String }
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum CustomerEvent { Renamed(CustomerRenamed) }
///
/// impl Message for CustomerEvent {
///     fn name(&self) -> &str {
///         match self {
///             CustomerEvent::Renamed(_) => "CustomerRenamed",
///         }
///     }
/// }
///
/// let codec = TypedJsonCodec::new().with_type(
///     "CustomerRenamed",
///     ErasableSchema::new().erasable("name"),
///     CustomerEvent::Renamed,
///     |event| match event {
///         CustomerEvent::Renamed(payload) => Some(payload),
///     },
/// );
/// ```
pub struct TypedJsonCodec<T> {
    types: HashMap<EventType, TypeEntry<T>>,
    legacy: HashMap<EventType, LegacyEntry<T>>,
    by_target: HashMap<EventType, Vec<EventType>>,
}

impl<T> Default for TypedJsonCodec<T> {
    fn default() -> Self {
        Self {
            types: HashMap::new(),
            legacy: HashMap::new(),
            by_target: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for TypedJsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedJsonCodec")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .field("legacy", &self.legacy.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> TypedJsonCodec<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a current event type.
    ///
    /// `wrap` builds a `T` out of the decoded payload (typically the enum
    /// variant constructor); `unwrap` projects the payload back out of a
    /// `T`, returning [`None`] for other variants.
    #[must_use]
    pub fn with_type<P, W, U>(
        mut self,
        name: impl Into<EventType>,
        schema: ErasableSchema,
        wrap: W,
        unwrap: U,
    ) -> Self
    where
        P: Serialize + DeserializeOwned,
        W: Fn(P) -> T + Send + Sync + 'static,
        U: Fn(&T) -> Option<&P> + Send + Sync + 'static,
    {
        self.types.insert(
            name.into(),
            TypeEntry {
                schema,
                encode: Box::new(move |event| unwrap(event).map(serde_json::to_value)),
                decode: Box::new(move |value| serde_json::from_value(value).map(&wrap)),
            },
        );
        self
    }

    /// Registers a legacy (deprecated) event type with its up-caster.
    ///
    /// Stored events of this type decode as `L` and are passed through the
    /// pure `upcast` into the current representation. Appends of this type
    /// are rejected.
    #[must_use]
    pub fn with_legacy_type<L, U>(
        mut self,
        name: impl Into<EventType>,
        target: impl Into<EventType>,
        upcast: U,
    ) -> Self
    where
        L: DeserializeOwned,
        U: Fn(L) -> T + Send + Sync + 'static,
    {
        let name = name.into();
        let target = target.into();

        self.by_target
            .entry(target.clone())
            .or_default()
            .push(name.clone());

        self.legacy.insert(
            name,
            LegacyEntry {
                target,
                decode: Box::new(move |value| serde_json::from_value(value).map(&upcast)),
            },
        );
        self
    }

    fn known_types(&self) -> Vec<EventType> {
        let mut known: Vec<_> = self.types.keys().chain(self.legacy.keys()).cloned().collect();
        known.sort();
        known
    }
}

fn merged_payload(
    immutable_data: &[u8],
    erasable_data: Option<&[u8]>,
) -> Result<Value, CodecError> {
    let immutable = serde_json::from_slice(immutable_data).map_err(CodecError::Decode)?;

    match erasable_data {
        None => Ok(immutable),
        Some(erasable_data) => {
            let erasable = serde_json::from_slice(erasable_data).map_err(CodecError::Decode)?;
            Ok(merge(immutable, erasable))
        }
    }
}

fn encode_split(
    event_type: EventType,
    payload: Value,
    schema: &ErasableSchema,
) -> Result<EncodedEvent, CodecError> {
    let (immutable, erasable) = schema.split(payload);

    Ok(EncodedEvent {
        event_type,
        immutable_data: serde_json::to_vec(&immutable).map_err(CodecError::Encode)?,
        erasable_data: erasable
            .map(|erasable| serde_json::to_vec(&erasable).map_err(CodecError::Encode))
            .transpose()?,
    })
}

impl<T> EventCodec for TypedJsonCodec<T>
where
    T: Message + Send + Sync,
{
    type Event = T;

    fn encode(&self, event: &T) -> Result<EncodedEvent, CodecError> {
        let event_type = EventType::from(event.name());

        if let Some(legacy) = self.legacy.get(&event_type) {
            return Err(CodecError::LegacyEventType {
                event_type,
                target: legacy.target.clone(),
            });
        }

        let entry = self
            .types
            .get(&event_type)
            .ok_or_else(|| CodecError::UnknownEventType {
                event_type: event_type.clone(),
                known: self.known_types(),
            })?;

        let payload = (entry.encode)(event)
            .ok_or_else(|| CodecError::PayloadMismatch {
                event_type: event_type.clone(),
            })?
            .map_err(CodecError::Encode)?;

        encode_split(event_type, payload, &entry.schema)
    }

    fn decode(
        &self,
        event_type: &EventType,
        immutable_data: &[u8],
        erasable_data: Option<&[u8]>,
    ) -> Result<T, CodecError> {
        let payload = merged_payload(immutable_data, erasable_data)?;

        if let Some(legacy) = self.legacy.get(event_type) {
            return (legacy.decode)(payload).map_err(CodecError::Decode);
        }

        let entry = self
            .types
            .get(event_type)
            .ok_or_else(|| CodecError::UnknownEventType {
                event_type: event_type.clone(),
                known: self.known_types(),
            })?;

        (entry.decode)(payload).map_err(CodecError::Decode)
    }

    fn accepts(&self, event_type: &EventType) -> bool {
        self.types.contains_key(event_type)
    }

    fn expand_types(&self, filter: &EventTypesFilter) -> EventTypesFilter {
        if filter.is_any() {
            return filter.clone();
        }

        let legacy_types = filter
            .iter()
            .flat_map(|event_type| self.by_target.get(event_type))
            .flatten()
            .cloned()
            .collect::<Vec<_>>();

        filter.expand_with(legacy_types)
    }
}

/// An untyped event: its stored type name and its payload as a structured
/// JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub event_type: EventType,
    pub payload: Value,
}

impl RawEvent {
    pub fn new(event_type: impl Into<EventType>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

impl Message for RawEvent {
    fn name(&self) -> &str {
        self.event_type.as_str()
    }
}

/// A JSON codec preserving payloads as structured values without type
/// binding.
///
/// Any type name is accepted on both encode and decode; per-type
/// [`ErasableSchema`]s may still be registered so privacy-regulated fields
/// get split on write. There is no legacy registration surface, so type
/// expansion is the identity.
#[derive(Debug, Clone, Default)]
pub struct RawJsonCodec {
    schemas: HashMap<EventType, ErasableSchema>,
}

impl RawJsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the erasable-field schema for a type name.
    #[must_use]
    pub fn with_schema(mut self, name: impl Into<EventType>, schema: ErasableSchema) -> Self {
        self.schemas.insert(name.into(), schema);
        self
    }
}

impl EventCodec for RawJsonCodec {
    type Event = RawEvent;

    fn encode(&self, event: &RawEvent) -> Result<EncodedEvent, CodecError> {
        let fully_immutable = ErasableSchema::new();
        let schema = self.schemas.get(&event.event_type).unwrap_or(&fully_immutable);

        encode_split(event.event_type.clone(), event.payload.clone(), schema)
    }

    fn decode(
        &self,
        event_type: &EventType,
        immutable_data: &[u8],
        erasable_data: Option<&[u8]>,
    ) -> Result<RawEvent, CodecError> {
        Ok(RawEvent {
            event_type: event_type.clone(),
            payload: merged_payload(immutable_data, erasable_data)?,
        })
    }

    fn accepts(&self, _event_type: &EventType) -> bool {
        true
    }

    fn expand_types(&self, filter: &EventTypesFilter) -> EventTypesFilter {
        filter.clone()
    }
}
