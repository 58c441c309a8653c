//! Contains the in-memory implementation of the storage engine contract,
//! backed by a lock-guarded log with inverted tag/type indexes.
//!
//! The write guard on the log is the engine's *commit token*: the Dynamic
//! Consistency Boundary check, position assignment and row installation all
//! happen under it, so appends serialize and criteria are evaluated against
//! exactly the state the new events are inserted after. Reads take snapshot
//! copies under the read guard and stream them lazily.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{iter, StreamExt};
use parking_lot::RwLock;

use crate::event::{EventId, EventReference, EventType, Position, StoredEvent, UncommittedEvent};
use crate::notify::{BookmarkPlaced, Notifier};
use crate::query::{AppendCriteria, EventQuery, EventQueryItem};
use crate::store::{
    AppendError, Bookmark, BookmarkStore, Direction, EventAppender, EventReader, EventStorage,
    OptimisticLockError, ReadOptions, StorageError, StoredEventStream,
};
use crate::stream_id::EventStreamId;
use crate::tag::Tags;

/// Engine configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryConfig {
    /// Defensive hard cap on *unbounded* result sets: a read without a
    /// [`Limit`][crate::query::Limit] that matches more events than this
    /// fails with [`StorageError::ResultCapExceeded`]. Default: unlimited.
    pub result_cap: Option<usize>,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<StoredEvent>,
    by_id: HashMap<EventId, usize>,
    by_tag: HashMap<String, Vec<usize>>,
    by_type: HashMap<EventType, Vec<usize>>,
    bookmarks: HashMap<String, Bookmark>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl LogState {
    /// The reference of the last (highest-position) stored event matching
    /// the query, the value the DCB check compares against.
    fn last_matching(&self, query: &EventQuery) -> Option<EventReference> {
        self.events
            .iter()
            .rev()
            .find(|event| query.matches(&event.event_type, &event.tags, &event.reference))
            .map(|event| event.reference)
    }

    /// Installs a batch: fresh ids, contiguous positions from the
    /// store-wide counter, one shared timestamp clamped to never run
    /// backwards.
    fn install(&mut self, events: Vec<(EventStreamId, UncommittedEvent)>) -> Vec<StoredEvent> {
        let timestamp = match self.last_timestamp {
            Some(last) => Utc::now().max(last),
            None => Utc::now(),
        };
        self.last_timestamp = Some(timestamp);

        let mut batch = Vec::with_capacity(events.len());

        for (stream, event) in events {
            let index = self.events.len();
            let position = (index + 1) as Position;
            let id = EventId::new();

            let stored = StoredEvent {
                stream,
                event_type: event.event_type,
                reference: EventReference::new(id, position),
                immutable_data: event.immutable_data,
                erasable_data: event.erasable_data,
                tags: event.tags,
                timestamp,
            };

            self.by_id.insert(id, index);
            for tag in &stored.tags {
                self.by_tag.entry(tag.to_string()).or_default().push(index);
            }
            self.by_type
                .entry(stored.event_type.clone())
                .or_default()
                .push(index);

            self.events.push(stored.clone());
            batch.push(stored);
        }

        batch
    }

    /// Index-driven candidate selection: a superset of the query's match
    /// set, as ascending log offsets. Candidates are re-checked precisely by
    /// the caller.
    fn candidates(&self, query: &EventQuery) -> Vec<usize> {
        let Some(items) = &query.items else {
            // Match-all scans the log.
            return (0..self.events.len()).collect();
        };

        if items.is_empty() {
            return Vec::new();
        }

        let mut candidates = BTreeSet::new();

        for item in items {
            match self.item_candidates(item) {
                // A wildcard item widens the candidate set to the whole log.
                None => return (0..self.events.len()).collect(),
                Some(offsets) => candidates.extend(offsets),
            }
        }

        candidates.into_iter().collect()
    }

    fn item_candidates(&self, item: &EventQueryItem) -> Option<Vec<usize>> {
        if !item.tags.is_empty() {
            // Tag containment: intersect the posting lists of every
            // required tag, starting from the rarest.
            let mut postings: Vec<&[usize]> = Vec::with_capacity(item.tags.len());
            for tag in &item.tags {
                match self.by_tag.get(&tag.to_string()) {
                    None => return Some(Vec::new()),
                    Some(posting) => postings.push(posting),
                }
            }
            postings.sort_by_key(|posting| posting.len());

            let (first, rest) = postings.split_first().expect("at least one required tag");
            return Some(
                first
                    .iter()
                    .copied()
                    .filter(|offset| {
                        rest.iter()
                            .all(|posting| posting.binary_search(offset).is_ok())
                    })
                    .collect(),
            );
        }

        if !item.event_types.is_any() {
            let mut offsets: Vec<usize> = item
                .event_types
                .iter()
                .filter_map(|event_type| self.by_type.get(event_type))
                .flatten()
                .copied()
                .collect();
            offsets.sort_unstable();
            return Some(offsets);
        }

        None
    }
}

/// In-memory implementation of the [`EventStorage`] contract, backed by a
/// thread-safe, index-maintaining log.
///
/// Cloning is cheap and clones share the same log.
#[derive(Clone)]
pub struct InMemoryEventStorage {
    state: Arc<RwLock<LogState>>,
    notifier: Arc<Notifier>,
    config: InMemoryConfig,
}

impl Default for InMemoryEventStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStorage {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            state: Arc::default(),
            notifier: Arc::new(Notifier::new()),
            config,
        }
    }

    /// Administrative erasure: replaces the event's erasable payload with
    /// absence. Returns whether the event existed.
    ///
    /// This is the only mutation a stored row ever sees, and it is not part
    /// of the portable storage contract.
    pub fn erase_event_payload(&self, id: &EventId) -> bool {
        let mut state = self.state.write();

        match state.by_id.get(id).copied() {
            None => false,
            Some(index) => {
                state.events[index].erasable_data = None;
                true
            }
        }
    }

    fn collect(
        &self,
        query: &EventQuery,
        stream: Option<&EventStreamId>,
        options: ReadOptions,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let state = self.state.read();

        let mut matched: Vec<&StoredEvent> = Vec::new();

        for offset in state.candidates(query) {
            let event = &state.events[offset];

            if !query.matches(&event.event_type, &event.tags, &event.reference) {
                continue;
            }

            if let Some(scope) = stream {
                if !scope.can_read(&event.stream) {
                    continue;
                }
            }

            // `from` is strict: the event at exactly `from` is excluded.
            if let Some(from) = options.from {
                let excluded = match options.direction {
                    Direction::Forward => event.reference.position <= from.position,
                    Direction::Backward => event.reference.position >= from.position,
                };
                if excluded {
                    continue;
                }
            }

            matched.push(event);
        }

        if options.direction == Direction::Backward {
            matched.reverse();
        }

        match options.limit.get() {
            Some(limit) => matched.truncate(limit as usize),
            None => {
                if let Some(cap) = self.config.result_cap {
                    if matched.len() > cap {
                        return Err(StorageError::ResultCapExceeded { cap });
                    }
                }
            }
        }

        tracing::trace!(matched = matched.len(), "event read");

        Ok(matched.into_iter().cloned().collect())
    }
}

#[async_trait]
impl EventReader for InMemoryEventStorage {
    fn read(
        &self,
        query: &EventQuery,
        stream: Option<&EventStreamId>,
        options: ReadOptions,
    ) -> StoredEventStream<'_> {
        match self.collect(query, stream, options) {
            Ok(events) => iter(events.into_iter().map(Ok)).boxed(),
            Err(error) => iter([Err(error)]).boxed(),
        }
    }

    async fn event_by_id(&self, id: &EventId) -> Result<Option<StoredEvent>, StorageError> {
        let state = self.state.read();

        Ok(state
            .by_id
            .get(id)
            .map(|offset| state.events[*offset].clone()))
    }
}

#[async_trait]
impl EventAppender for InMemoryEventStorage {
    async fn append(
        &self,
        criteria: AppendCriteria,
        stream: Option<EventStreamId>,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, AppendError> {
        if events.is_empty() {
            return Err(AppendError::EmptyBatch);
        }

        if let Some(stream) = &stream {
            if !stream.is_writable() {
                return Err(AppendError::WildcardStream(stream.clone()));
            }
        }

        // Resolve every target stream before taking the commit token, so a
        // rejected batch never touches the log.
        let mut resolved = Vec::with_capacity(events.len());
        for event in events {
            let target = match event.stream.clone().or_else(|| stream.clone()) {
                None => return Err(AppendError::MissingStream),
                Some(target) if !target.is_writable() => {
                    return Err(AppendError::WildcardStream(target))
                }
                Some(target) => target,
            };
            resolved.push((target, event));
        }

        let batch = {
            // The write guard is the commit token: held from the DCB check
            // through position assignment and row installation.
            let mut state = self.state.write();

            let actual = state.last_matching(&criteria.query);
            if actual != criteria.expected_last_reference {
                return Err(AppendError::Conflict(OptimisticLockError {
                    query: criteria.query,
                    expected: criteria.expected_last_reference,
                    actual,
                }));
            }

            state.install(resolved)
        };

        tracing::debug!(
            events = batch.len(),
            first_position = batch.first().map(|event| event.reference.position),
            "events appended",
        );

        // The batch is committed; consistent listeners run in this task and
        // their failures surface to the appender.
        self.notifier
            .publish_committed(&batch)
            .await
            .map_err(AppendError::Listener)?;

        self.notifier.schedule_eventual(&batch);

        Ok(batch)
    }
}

#[async_trait]
impl BookmarkStore for InMemoryEventStorage {
    async fn bookmark(&self, reader: &str) -> Result<Option<Bookmark>, StorageError> {
        Ok(self.state.read().bookmarks.get(reader).cloned())
    }

    async fn place_bookmark(
        &self,
        reader: &str,
        reference: EventReference,
        tags: Tags,
    ) -> Result<(), StorageError> {
        {
            let mut state = self.state.write();
            state.bookmarks.insert(
                reader.to_owned(),
                Bookmark {
                    reader: reader.to_owned(),
                    reference,
                    tags: tags.clone(),
                    updated_at: Utc::now(),
                },
            );
        }

        self.notifier.publish_bookmark(BookmarkPlaced {
            reader: reader.to_owned(),
            reference,
            tags,
        });

        Ok(())
    }
}

impl EventStorage for InMemoryEventStorage {
    fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}
