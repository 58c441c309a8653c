//! Contains the storage engine contract: appending with the Dynamic
//! Consistency Boundary check, tag-indexed querying, point lookups and the
//! bookmark table, plus the [in-memory][memory::InMemoryEventStorage]
//! implementation of it.
//!
//! The contract is storage-agnostic: the same traits can be implemented
//! atop an embedded store, a relational database with an append trigger, or
//! a log-structured file.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::event::{EventId, EventReference, StoredEvent, UncommittedEvent};
use crate::notify::Notifier;
use crate::query::{AppendCriteria, EventQuery, Limit};
use crate::stream_id::EventStreamId;
use crate::tag::Tags;

/// The order a read traverses the log in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Ascending positions.
    #[default]
    Forward,
    /// Descending positions.
    Backward,
}

/// The positional window and cardinality of a read.
///
/// `from` is *strict* on the chosen axis: the event at exactly `from` is
/// excluded; absence means the corresponding extreme of the log. The
/// inclusive upper bound lives in the query itself
/// ([`EventQuery::until`][crate::query::EventQuery]).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReadOptions {
    pub from: Option<EventReference>,
    pub limit: Limit,
    pub direction: Direction,
}

impl ReadOptions {
    pub fn forward() -> Self {
        Self::default()
    }

    pub fn backward() -> Self {
        Self {
            direction: Direction::Backward,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn starting_after(mut self, reference: EventReference) -> Self {
        self.from = Some(reference);
        self
    }

    #[must_use]
    pub fn limited_to(mut self, limit: Limit) -> Self {
        self.limit = limit;
        self
    }
}

/// A lazy, ordered sequence of stored events.
pub type StoredEventStream<'a> = BoxStream<'a, Result<StoredEvent, StorageError>>;

/// Error returned when the append's Dynamic Consistency Boundary check
/// fails: the last stored event matching the criteria query is not the one
/// the writer expected.
///
/// An expected, business-level outcome, never retried by the engine. It
/// carries the offending query and both references so the caller can
/// re-derive its decision.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("optimistic locking failed, expected last matching event {expected:?}, found {actual:?}")]
pub struct OptimisticLockError {
    pub query: EventQuery,
    pub expected: Option<EventReference>,
    pub actual: Option<EventReference>,
}

/// All possible error types returned by [`EventAppender::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The Dynamic Consistency Boundary check failed.
    #[error("failed to append new events: {0}")]
    Conflict(#[from] OptimisticLockError),

    /// An append must carry at least one event.
    #[error("cannot append an empty list of events")]
    EmptyBatch,

    /// An event carried no stream and no append-level default stream was
    /// given.
    #[error("event has no stream and no default stream was provided")]
    MissingStream,

    /// Appends require a fully-specified stream id on every event.
    #[error("cannot append to stream {0}: a wildcard stream id is read-only")]
    WildcardStream(EventStreamId),

    /// An event was rejected by the codec before reaching storage: its type
    /// is unknown or legacy. Enforced by the facade, not the engine.
    #[error("event rejected by the codec: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// A consistent listener failed. The append itself has already
    /// committed; the events are durable and visible.
    #[error("a consistent listener failed after the append committed: {0}")]
    Listener(#[source] anyhow::Error),

    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Infrastructural failure of the storage engine. Retryable at the caller's
/// discretion.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An unbounded read matched more events than the engine's configured
    /// defensive cap.
    #[error("unbounded read matched more than the configured cap of {cap} events")]
    ResultCapExceeded { cap: usize },

    #[error("event storage failed: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Interface used to read stored events back out of the log.
#[async_trait]
pub trait EventReader: Send + Sync {
    /// Streams events matching the query, optionally gated by a stream id
    /// (an event qualifies iff `stream.can_read(event.stream)`), within the
    /// positional window and cardinality of `options`.
    ///
    /// The query is matched as given: legacy-type expansion is the
    /// caller's (facade's) concern.
    fn read(
        &self,
        query: &EventQuery,
        stream: Option<&EventStreamId>,
        options: ReadOptions,
    ) -> StoredEventStream<'_>;

    /// Point lookup by id. No stream gating at this level.
    async fn event_by_id(&self, id: &EventId) -> Result<Option<StoredEvent>, StorageError>;
}

/// Interface used to append new events to the log.
#[async_trait]
pub trait EventAppender: Send + Sync {
    /// Atomically validates `criteria` against the log and, if it holds,
    /// installs the batch with fresh ids and contiguous, strictly monotonic
    /// positions.
    ///
    /// Consistent notifications are delivered before this returns;
    /// eventually-consistent notifications are scheduled on each interested
    /// subscription's dispatcher.
    async fn append(
        &self,
        criteria: AppendCriteria,
        stream: Option<EventStreamId>,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, AppendError>;
}

/// A bookmark: how far a named reader has processed the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Bookmark {
    pub reader: String,
    pub reference: EventReference,
    pub tags: Tags,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Interface used to persist per-reader bookmarks. One row per reader,
/// upsert semantics.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn bookmark(&self, reader: &str) -> Result<Option<Bookmark>, StorageError>;

    /// Upserts the reader's bookmark and emits a
    /// [`BookmarkPlaced`][crate::notify::BookmarkPlaced] notification on the
    /// async channel.
    async fn place_bookmark(
        &self,
        reader: &str,
        reference: EventReference,
        tags: Tags,
    ) -> Result<(), StorageError>;
}

/// A full storage engine: reading, appending, bookmarks, and the
/// [`Notifier`] facades subscribe through.
pub trait EventStorage: EventReader + EventAppender + BookmarkStore + Send + Sync {
    fn notifier(&self) -> &Notifier;
}
