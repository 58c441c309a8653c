//! Contains [`EventStream`], the per-stream-id facade over a storage engine
//! and a codec.
//!
//! The facade is where typed domain events meet the untyped log: queries
//! are widened with legacy types and decoded on the way out, appends are
//! gated (writable stream id, codec-accepted types) and encoded on the way
//! in, and listeners subscribe through the facade's scope.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

use crate::codec::{CodecError, EventCodec};
use crate::event::{Event, EventId, EventReference, NewEvent, StoredEvent, UncommittedEvent};
use crate::notify::{
    BookmarkListener, ConsistentListener, EventuallyConsistentListener, StreamSubscription,
};
use crate::query::{AppendCriteria, EventQuery, EventQueryItem, Limit};
use crate::store::{
    AppendError, Bookmark, Direction, EventStorage, ReadOptions, StorageError,
};
use crate::stream_id::EventStreamId;
use crate::tag::Tags;

/// All possible error types returned when reading decoded events back.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to decode stored event: {0}")]
    Codec(#[from] CodecError),
}

/// A lazy, ordered sequence of decoded events.
pub type DecodedEventStream<'a, T> = BoxStream<'a, Result<Event<T>, ReadError>>;

/// A listener observing decoded event batches on a facade's consistent
/// channel.
#[async_trait]
pub trait EventListener<T>: Send + Sync {
    async fn on_events(&self, events: &[Event<T>]) -> anyhow::Result<()>;
}

/// A per-[`EventStreamId`] view onto a storage engine, decoding through an
/// [`EventCodec`].
///
/// Creating a facade is side-effect-free aside from registering its
/// notification subscription; cloning is cheap and clones share the
/// subscription.
pub struct EventStream<S, C>
where
    S: EventStorage,
    C: EventCodec,
{
    id: EventStreamId,
    storage: Arc<S>,
    codec: Arc<C>,
    subscription: Arc<StreamSubscription>,
}

impl<S, C> Clone for EventStream<S, C>
where
    S: EventStorage,
    C: EventCodec,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            storage: Arc::clone(&self.storage),
            codec: Arc::clone(&self.codec),
            subscription: Arc::clone(&self.subscription),
        }
    }
}

impl<S, C> EventStream<S, C>
where
    S: EventStorage,
    C: EventCodec + 'static,
{
    /// Opens a facade onto `storage` scoped to `id`, decoding through
    /// `codec`.
    pub fn new(id: EventStreamId, storage: Arc<S>, codec: Arc<C>) -> Self {
        let subscription = storage.notifier().register(id.clone());

        Self {
            id,
            storage,
            codec,
            subscription,
        }
    }

    pub fn id(&self) -> &EventStreamId {
        &self.id
    }

    /// Widens every type filter in the query with the legacy types mapped
    /// to it, so stored events predating an up-cast keep matching.
    fn expand_query(&self, query: EventQuery) -> EventQuery {
        EventQuery {
            items: query.items.map(|items| {
                items
                    .into_iter()
                    .map(|item| {
                        EventQueryItem::new(
                            self.codec.expand_types(&item.event_types),
                            item.tags,
                        )
                    })
                    .collect()
            }),
            until: query.until,
        }
    }

    fn read(&self, query: EventQuery, options: ReadOptions) -> DecodedEventStream<'_, C::Event> {
        let query = self.expand_query(query);
        let codec = Arc::clone(&self.codec);

        self.storage
            .read(&query, Some(&self.id), options)
            .map(move |result| match result {
                Ok(stored) => decode_event(codec.as_ref(), stored),
                Err(error) => Err(ReadError::Storage(error)),
            })
            .boxed()
    }

    /// Streams matching events in ascending position order.
    pub fn query(
        &self,
        query: EventQuery,
        from: Option<EventReference>,
        limit: Limit,
    ) -> DecodedEventStream<'_, C::Event> {
        self.read(
            query,
            ReadOptions {
                from,
                limit,
                direction: Direction::Forward,
            },
        )
    }

    /// Streams matching events in descending position order.
    pub fn query_backwards(
        &self,
        query: EventQuery,
        from: Option<EventReference>,
        limit: Limit,
    ) -> DecodedEventStream<'_, C::Event> {
        self.read(
            query,
            ReadOptions {
                from,
                limit,
                direction: Direction::Backward,
            },
        )
    }

    /// Appends new events to this stream under the specified criteria,
    /// returning the committed batch decoded and enriched.
    ///
    /// Fails before touching storage when this facade's id has a wildcard
    /// axis, or when the codec does not accept an event (unknown or legacy
    /// type).
    pub async fn append(
        &self,
        criteria: AppendCriteria,
        events: Vec<NewEvent<C::Event>>,
    ) -> Result<Vec<Event<C::Event>>, AppendError> {
        if !self.id.is_writable() {
            return Err(AppendError::WildcardStream(self.id.clone()));
        }

        let mut uncommitted = Vec::with_capacity(events.len());
        for event in &events {
            let encoded = self.codec.encode(&event.payload)?;
            uncommitted.push(UncommittedEvent {
                stream: Some(self.id.clone()),
                event_type: encoded.event_type,
                immutable_data: encoded.immutable_data,
                erasable_data: encoded.erasable_data,
                tags: event.tags.clone(),
            });
        }

        let criteria = AppendCriteria {
            query: self.expand_query(criteria.query),
            expected_last_reference: criteria.expected_last_reference,
        };

        let batch = self
            .storage
            .append(criteria, Some(self.id.clone()), uncommitted)
            .await?;

        batch
            .into_iter()
            .map(|stored| {
                decode_event(self.codec.as_ref(), stored).map_err(|error| match error {
                    ReadError::Codec(error) => AppendError::Codec(error),
                    ReadError::Storage(error) => AppendError::Storage(error),
                })
            })
            .collect()
    }

    /// Point lookup by id, filtered to events this facade can read.
    pub async fn event_by_id(&self, id: &EventId) -> Result<Option<Event<C::Event>>, ReadError> {
        match self.storage.event_by_id(id).await? {
            Some(stored) if self.id.can_read(&stored.stream) => {
                decode_event(self.codec.as_ref(), stored).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Registers a consistent listener: called in the appending task, after
    /// commit, with the decoded batch this facade can read.
    pub fn subscribe_consistent(&self, listener: Arc<dyn EventListener<C::Event>>) {
        self.subscription
            .subscribe_consistent(Arc::new(DecodingConsistentListener {
                codec: Arc::clone(&self.codec),
                inner: listener,
            }));
    }

    /// Registers an eventually-consistent listener on this facade's
    /// dispatcher. Requires a running tokio runtime.
    pub fn subscribe_eventually_consistent(
        &self,
        listener: Arc<dyn EventuallyConsistentListener>,
    ) {
        self.subscription.subscribe_eventually_consistent(listener);
    }

    /// Registers a bookmark listener on this facade's dispatcher. Requires
    /// a running tokio runtime.
    pub fn subscribe_bookmarks(&self, listener: Arc<dyn BookmarkListener>) {
        self.subscription.subscribe_bookmarks(listener);
    }

    pub async fn place_bookmark(
        &self,
        reader: &str,
        reference: EventReference,
        tags: Tags,
    ) -> Result<(), StorageError> {
        self.storage.place_bookmark(reader, reference, tags).await
    }

    pub async fn bookmark(&self, reader: &str) -> Result<Option<Bookmark>, StorageError> {
        self.storage.bookmark(reader).await
    }
}

fn decode_event<C>(codec: &C, stored: StoredEvent) -> Result<Event<C::Event>, ReadError>
where
    C: EventCodec,
{
    let payload = codec.decode(
        &stored.event_type,
        &stored.immutable_data,
        stored.erasable_data.as_deref(),
    )?;

    Ok(Event {
        stream: stored.stream,
        event_type: stored.event_type,
        reference: stored.reference,
        tags: stored.tags,
        timestamp: stored.timestamp,
        payload,
    })
}

/// Adapter decoding stored batches before handing them to a typed
/// [`EventListener`].
struct DecodingConsistentListener<C>
where
    C: EventCodec,
{
    codec: Arc<C>,
    inner: Arc<dyn EventListener<C::Event>>,
}

#[async_trait]
impl<C> ConsistentListener for DecodingConsistentListener<C>
where
    C: EventCodec + 'static,
{
    async fn on_committed(&self, events: &[StoredEvent]) -> anyhow::Result<()> {
        let mut decoded = Vec::with_capacity(events.len());
        for event in events {
            decoded.push(decode_event(self.codec.as_ref(), event.clone())?);
        }

        self.inner.on_events(&decoded).await
    }
}
