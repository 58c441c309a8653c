//! Contains the [`Projector`], a cursor-driven batch replay of a stream
//! facade into a [`Projection`].
//!
//! The projector reads events after its cursor in bounded batches, hands
//! them to the projection's handler, and advances the cursor only when a
//! whole batch commits. A failing handler cancels the in-memory batch state
//! and leaves the persistent cursor untouched; the caller decides whether
//! and when to re-enter.

use async_trait::async_trait;
use futures::TryStreamExt;

use crate::codec::EventCodec;
use crate::event::{Event, EventReference};
use crate::query::{EventQuery, Limit};
use crate::store::{EventStorage, StorageError};
use crate::stream::{EventStream, ReadError};

/// A projection: an [`EventQuery`] selecting the events it cares about, a
/// handler building the derived view, and optional batch lifecycle hooks.
#[async_trait]
pub trait Projection<T>: Send {
    /// The query selecting the events this projection consumes.
    fn query(&self) -> EventQuery;

    /// Applies one event to the projection.
    async fn handle(&mut self, event: Event<T>) -> anyhow::Result<()>;

    /// Called before each batch starts streaming.
    async fn before_batch(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a batch committed, with the batch's last handled
    /// reference.
    async fn after_batch(&mut self, _last: EventReference) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when a batch is abandoned after a handler failure, so the
    /// projection can roll back its in-memory batch state.
    async fn cancel_batch(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// When the projector reads its bookmark into the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkReadMode {
    /// Once, while the projector is being built.
    AtCreation,
    /// Once, before the first batch executes.
    BeforeFirstBatch,
    /// Before every batch.
    BeforeEachBatch,
    /// Only when [`Projector::read_bookmark`] is called explicitly.
    ManualOnly,
}

/// Binds a reader name to a [`BookmarkReadMode`].
#[derive(Debug, Clone)]
pub struct BookmarkPolicy {
    pub reader: String,
    pub mode: BookmarkReadMode,
}

impl BookmarkPolicy {
    pub fn new(reader: impl Into<String>, mode: BookmarkReadMode) -> Self {
        Self {
            reader: reader.into(),
            mode,
        }
    }
}

/// All possible error types returned by the [`Projector`].
///
/// A projector failure is contained: the underlying append has long
/// committed, and the projector does not retry by itself.
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    /// The projection handler failed; carries the failing event's
    /// reference. The batch was cancelled and the cursor not advanced.
    #[error("projection handler failed at event {event_reference}: {source}")]
    Handler {
        event_reference: EventReference,
        #[source]
        source: anyhow::Error,
    },

    /// A batch lifecycle hook failed.
    #[error("projection batch hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    /// Reading events for a batch failed.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// Reading the bookmark failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Counters of a projector run (or a single batch), also kept accumulated
/// across the projector's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProjectorMetrics {
    pub queries_done: u64,
    pub events_streamed: u64,
    pub events_handled: u64,
    pub last_event_reference: Option<EventReference>,
}

impl ProjectorMetrics {
    fn absorb(&mut self, batch: &ProjectorMetrics) {
        self.queries_done += batch.queries_done;
        self.events_streamed += batch.events_streamed;
        self.events_handled += batch.events_handled;
        self.last_event_reference =
            EventReference::max_by_position(self.last_event_reference, batch.last_event_reference);
    }
}

/// Builder for [`Projector`] instances.
pub struct ProjectorBuilder<S, C, P>
where
    S: EventStorage,
    C: EventCodec,
{
    stream: EventStream<S, C>,
    projection: P,
    batch_size: Option<u64>,
    bookmark_policy: Option<BookmarkPolicy>,
    starting_after: Option<EventReference>,
    until: Option<EventReference>,
}

impl<S, C, P> ProjectorBuilder<S, C, P>
where
    S: EventStorage,
    C: EventCodec + 'static,
    P: Projection<C::Event>,
{
    /// Caps each batch at `events` handled events. Unset means unbounded
    /// batches.
    ///
    /// # Panics
    ///
    /// Panics when `events` is zero: a projector with empty batches can
    /// never advance.
    #[must_use]
    pub fn batch_size(mut self, events: u64) -> Self {
        assert!(events > 0, "batch size must be strictly positive");
        self.batch_size = Some(events);
        self
    }

    /// Starts the cursor after the specified reference instead of at the
    /// beginning of the log.
    #[must_use]
    pub fn starting_after(mut self, reference: EventReference) -> Self {
        self.starting_after = Some(reference);
        self
    }

    #[must_use]
    pub fn bookmark_policy(mut self, policy: BookmarkPolicy) -> Self {
        self.bookmark_policy = Some(policy);
        self
    }

    /// Stops replaying once the cursor reaches the specified reference.
    #[must_use]
    pub fn until(mut self, reference: EventReference) -> Self {
        self.until = Some(reference);
        self
    }

    /// Builds the projector. With an
    /// [`AtCreation`](BookmarkReadMode::AtCreation) policy the bookmark is
    /// read here.
    pub async fn build(self) -> Result<Projector<S, C, P>, ProjectorError> {
        let mut projector = Projector {
            stream: self.stream,
            projection: self.projection,
            batch_size: self.batch_size,
            bookmark_policy: self.bookmark_policy,
            until: self.until,
            cursor: self.starting_after,
            bookmark_read: false,
            accumulated: ProjectorMetrics::default(),
        };

        if matches!(
            &projector.bookmark_policy,
            Some(policy) if policy.mode == BookmarkReadMode::AtCreation
        ) {
            projector.read_bookmark().await?;
        }

        Ok(projector)
    }
}

/// Drives a [`Projection`] over a stream facade in bounded, resumable
/// batches.
pub struct Projector<S, C, P>
where
    S: EventStorage,
    C: EventCodec,
{
    stream: EventStream<S, C>,
    projection: P,
    batch_size: Option<u64>,
    bookmark_policy: Option<BookmarkPolicy>,
    until: Option<EventReference>,

    cursor: Option<EventReference>,
    bookmark_read: bool,
    accumulated: ProjectorMetrics,
}

impl<S, C, P> Projector<S, C, P>
where
    S: EventStorage,
    C: EventCodec + 'static,
    P: Projection<C::Event>,
{
    pub fn builder(stream: EventStream<S, C>, projection: P) -> ProjectorBuilder<S, C, P> {
        ProjectorBuilder {
            stream,
            projection,
            batch_size: None,
            bookmark_policy: None,
            starting_after: None,
            until: None,
        }
    }

    /// The persistent cursor: the last reference of the last committed
    /// batch.
    pub fn cursor(&self) -> Option<EventReference> {
        self.cursor
    }

    /// Metrics accumulated over all committed batches.
    pub fn metrics(&self) -> &ProjectorMetrics {
        &self.accumulated
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Tears the projector down, handing the projection back.
    pub fn into_projection(self) -> P {
        self.projection
    }

    /// Reads the policy's bookmark and replaces the cursor with it, if one
    /// exists.
    pub async fn read_bookmark(&mut self) -> Result<(), ProjectorError> {
        let Some(policy) = &self.bookmark_policy else {
            return Ok(());
        };

        if let Some(bookmark) = self.stream.bookmark(&policy.reader).await? {
            tracing::debug!(
                reader = %policy.reader,
                reference = %bookmark.reference,
                "projector cursor restored from bookmark",
            );
            self.cursor = Some(bookmark.reference);
        }

        Ok(())
    }

    /// Executes a single batch and returns its metrics.
    ///
    /// A batch that streams zero events is a no-op: no cursor advance, no
    /// `after_batch`.
    pub async fn run_batch(&mut self) -> Result<ProjectorMetrics, ProjectorError> {
        let read_bookmark_now = match &self.bookmark_policy {
            None => false,
            Some(policy) => match policy.mode {
                BookmarkReadMode::BeforeEachBatch => true,
                BookmarkReadMode::BeforeFirstBatch => !self.bookmark_read,
                BookmarkReadMode::AtCreation | BookmarkReadMode::ManualOnly => false,
            },
        };
        if read_bookmark_now {
            self.read_bookmark().await?;
        }
        self.bookmark_read = true;

        self.projection
            .before_batch()
            .await
            .map_err(ProjectorError::Hook)?;

        let mut query = self.projection.query();
        if let Some(until) = self.until {
            query = query.until_if_earlier(until);
        }

        // One extra event is probed past the batch size to learn whether
        // more work remains.
        let limit = match self.batch_size {
            None => Limit::unlimited(),
            Some(batch_size) => Limit::at_most(batch_size.saturating_add(1))
                .expect("a batch probe limit is strictly positive"),
        };

        let events: Vec<Event<C::Event>> = self
            .stream
            .query(query, self.cursor, limit)
            .try_collect()
            .await?;

        let mut batch = ProjectorMetrics {
            queries_done: 1,
            events_streamed: events.len() as u64,
            ..ProjectorMetrics::default()
        };

        let handle_up_to = self
            .batch_size
            .map_or(events.len(), |batch_size| batch_size as usize);

        // The batch-local last reference; discarded if the batch fails.
        let mut last: Option<EventReference> = None;

        for event in events.into_iter().take(handle_up_to) {
            let reference = event.reference;

            if let Err(source) = self.projection.handle(event).await {
                if let Err(cancel_error) = self.projection.cancel_batch().await {
                    tracing::error!(error = %cancel_error, "projection cancel_batch failed");
                }

                return Err(ProjectorError::Handler {
                    event_reference: reference,
                    source,
                });
            }

            last = Some(reference);
            batch.events_handled += 1;
        }

        if let Some(last) = last {
            self.projection
                .after_batch(last)
                .await
                .map_err(ProjectorError::Hook)?;

            self.cursor = Some(last);
            batch.last_event_reference = Some(last);
        }

        self.accumulated.absorb(&batch);

        tracing::debug!(
            streamed = batch.events_streamed,
            handled = batch.events_handled,
            cursor = self.cursor.map(|reference| reference.position),
            "projector batch committed",
        );

        Ok(batch)
    }

    /// Runs batches until one streams zero events, the probe shows no more
    /// work, or the configured `until` reference is reached. Returns this
    /// run's metrics.
    pub async fn run(&mut self) -> Result<ProjectorMetrics, ProjectorError> {
        let mut run = ProjectorMetrics::default();

        loop {
            let batch = self.run_batch().await?;
            run.absorb(&batch);

            if batch.events_streamed == 0 {
                break;
            }

            if let (Some(cursor), Some(until)) = (self.cursor, self.until) {
                if cursor.position >= until.position {
                    break;
                }
            }

            let Some(batch_size) = self.batch_size else {
                // Unbounded batches drain the stream in one pass.
                break;
            };

            if batch.events_streamed <= batch_size {
                break;
            }
        }

        Ok(run)
    }
}
