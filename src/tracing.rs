//! Contains an extension trait to instrument a storage engine with the
//! `tracing` crate.

use async_trait::async_trait;
use tracing::instrument;

use crate::event::{EventId, EventReference, StoredEvent, UncommittedEvent};
use crate::notify::Notifier;
use crate::query::{AppendCriteria, EventQuery};
use crate::store::{
    AppendError, Bookmark, BookmarkStore, EventAppender, EventReader, EventStorage, ReadOptions,
    StorageError, StoredEventStream,
};
use crate::stream_id::EventStreamId;
use crate::tag::Tags;

/// [`EventStorage`] wrapper that records a span around every storage
/// operation.
#[derive(Debug, Clone)]
pub struct InstrumentedEventStorage<T>
where
    T: EventStorage,
{
    inner: T,
}

#[async_trait]
impl<T> EventReader for InstrumentedEventStorage<T>
where
    T: EventStorage,
{
    #[instrument(name = "EventStorage.read", skip(self, query, stream))]
    fn read(
        &self,
        query: &EventQuery,
        stream: Option<&EventStreamId>,
        options: ReadOptions,
    ) -> StoredEventStream<'_> {
        self.inner.read(query, stream, options)
    }

    #[allow(clippy::blocks_in_conditions)] // NOTE: false positive on async-trait methods.
    #[instrument(name = "EventStorage.event_by_id", err, skip(self))]
    async fn event_by_id(&self, id: &EventId) -> Result<Option<StoredEvent>, StorageError> {
        self.inner.event_by_id(id).await
    }
}

#[async_trait]
impl<T> EventAppender for InstrumentedEventStorage<T>
where
    T: EventStorage,
{
    #[allow(clippy::blocks_in_conditions)] // NOTE: false positive on async-trait methods.
    #[instrument(
        name = "EventStorage.append",
        err,
        skip(self, criteria, stream, events),
        fields(events = events.len()),
    )]
    async fn append(
        &self,
        criteria: AppendCriteria,
        stream: Option<EventStreamId>,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, AppendError> {
        self.inner.append(criteria, stream, events).await
    }
}

#[async_trait]
impl<T> BookmarkStore for InstrumentedEventStorage<T>
where
    T: EventStorage,
{
    #[allow(clippy::blocks_in_conditions)] // NOTE: false positive on async-trait methods.
    #[instrument(name = "EventStorage.bookmark", err, skip(self))]
    async fn bookmark(&self, reader: &str) -> Result<Option<Bookmark>, StorageError> {
        self.inner.bookmark(reader).await
    }

    #[allow(clippy::blocks_in_conditions)] // NOTE: false positive on async-trait methods.
    #[instrument(
        name = "EventStorage.place_bookmark",
        err,
        skip(self, reference, tags),
        fields(position = reference.position),
    )]
    async fn place_bookmark(
        &self,
        reader: &str,
        reference: EventReference,
        tags: Tags,
    ) -> Result<(), StorageError> {
        self.inner.place_bookmark(reader, reference, tags).await
    }
}

impl<T> EventStorage for InstrumentedEventStorage<T>
where
    T: EventStorage,
{
    fn notifier(&self) -> &Notifier {
        self.inner.notifier()
    }
}

/// Extension trait for any [`EventStorage`] type to provide instrumentation
/// features through the `tracing` crate.
pub trait EventStorageExt: EventStorage + Sized {
    /// Returns an instrumented version of the [`EventStorage`] instance.
    fn with_tracing(self) -> InstrumentedEventStorage<Self> {
        InstrumentedEventStorage { inner: self }
    }
}

impl<T> EventStorageExt for T where T: EventStorage {}
