//! `consistently` is an append-only event store with Dynamic Consistency
//! Boundaries: a strictly totally-ordered log of immutable domain events
//! with tag-indexed querying and a query-scoped optimistic concurrency
//! check.
//!
//! Instead of partitioning writes by a static aggregate, every append
//! carries an [`AppendCriteria`]: a [query][query::EventQuery] describing
//! the events that together guard the writer's invariant, plus the
//! reference of the last such event the writer observed. The engine admits
//! the append only while that is still the last matching event: the
//! transactional boundary is computed at write time, per write, and may
//! span as many entities as the query reaches.
//!
//! ## Building blocks
//!
//! - [`store`]: the storage engine contract and its
//!   [in-memory][store::memory::InMemoryEventStorage] implementation:
//!   atomic appends with the boundary check, tag-indexed reads in both
//!   directions, point lookups and reader bookmarks.
//! - [`query`]: the query model: type filters, tag containment, the
//!   distinct match-all/match-none states and the inclusive `until` bound.
//! - [`codec`]: payload codecs splitting privacy-regulated (erasable)
//!   fields from immutable ones, and up-casting legacy event types on read.
//! - [`stream`]: the typed per-stream facade composed over storage and
//!   codec.
//! - [`notify`]: consistent (in-append) and eventually-consistent
//!   (coalesced, background) notifications, plus bookmark notifications.
//! - [`projector`]: cursor-driven batch replay of a stream into a
//!   [`Projection`][projector::Projection], with bookmarked resumption and
//!   failure containment.

pub mod codec;
pub mod event;
pub mod notify;
pub mod projector;
pub mod query;
pub mod store;
pub mod stream;
pub mod stream_id;
pub mod tag;
pub mod tracing;

pub use crate::event::{
    Event, EventId, EventReference, EventType, NewEvent, Position, StoredEvent, UncommittedEvent,
};
pub use crate::query::{AppendCriteria, EventQuery, EventQueryItem, EventTypesFilter, Limit};
pub use crate::stream_id::EventStreamId;
pub use crate::tag::{Tag, Tags};
