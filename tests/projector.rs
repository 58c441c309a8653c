use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use consistently::codec::{RawEvent, RawJsonCodec};
use consistently::projector::{
    BookmarkPolicy, BookmarkReadMode, Projection, Projector, ProjectorError,
};
use consistently::store::memory::InMemoryEventStorage;
use consistently::store::BookmarkStore;
use consistently::stream::EventStream;
use consistently::{
    AppendCriteria, Event, EventQuery, EventReference, EventStreamId, EventTypesFilter, NewEvent,
    Tag, Tags,
};

type RawStream = EventStream<InMemoryEventStorage, RawJsonCodec>;

fn raw_stream(storage: &Arc<InMemoryEventStorage>) -> RawStream {
    EventStream::new(
        EventStreamId::with_default_purpose("numbers"),
        Arc::clone(storage),
        Arc::new(RawJsonCodec::new()),
    )
}

/// Seeds the log with six events tagged `nr:one` … `nr:six`, alternating
/// types F, S, T, F, S, T.
async fn seed_numbers(stream: &RawStream) -> Vec<Event<RawEvent>> {
    let numbers = ["one", "two", "three", "four", "five", "six"];
    let types = ["F", "S", "T", "F", "S", "T"];

    let events = numbers
        .iter()
        .zip(types)
        .map(|(number, event_type)| {
            NewEvent::from(RawEvent::new(event_type, json!({ "nr": number })))
                .with_tag(Tag::new("nr", *number))
        })
        .collect();

    stream
        .append(AppendCriteria::none(), events)
        .await
        .expect("seeding should succeed")
}

#[derive(Default)]
struct Recording {
    handled: Vec<u64>,
    lifecycle: Vec<String>,
    fail_at_position: Option<u64>,
}

#[async_trait]
impl Projection<RawEvent> for Recording {
    fn query(&self) -> EventQuery {
        EventQuery::for_events(EventTypesFilter::of(["F", "T"]), Tags::none())
    }

    async fn handle(&mut self, event: Event<RawEvent>) -> anyhow::Result<()> {
        if Some(event.reference.position) == self.fail_at_position {
            anyhow::bail!("cannot project {}", event.payload.payload["nr"]);
        }

        self.handled.push(event.reference.position);
        Ok(())
    }

    async fn before_batch(&mut self) -> anyhow::Result<()> {
        self.lifecycle.push("before".to_owned());
        Ok(())
    }

    async fn after_batch(&mut self, last: EventReference) -> anyhow::Result<()> {
        self.lifecycle.push(format!("after@{}", last.position));
        Ok(())
    }

    async fn cancel_batch(&mut self) -> anyhow::Result<()> {
        self.lifecycle.push("cancel".to_owned());
        Ok(())
    }
}

#[tokio::test]
async fn the_projector_resumes_from_its_bookmark() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    let seeded = seed_numbers(&stream).await;

    // A bookmark on "two": the projector has processed up to position 2.
    storage
        .place_bookmark("numbers-projection", seeded[1].reference, Tags::none())
        .await
        .unwrap();

    let mut projector = Projector::builder(stream, Recording::default())
        .batch_size(1)
        .bookmark_policy(BookmarkPolicy::new(
            "numbers-projection",
            BookmarkReadMode::BeforeFirstBatch,
        ))
        .build()
        .await
        .unwrap();

    let first = projector.run_batch().await.unwrap();
    assert_eq!(1, first.events_handled);
    assert_eq!(Some(3), first.last_event_reference.map(|r| r.position));

    let second = projector.run_batch().await.unwrap();
    assert_eq!(Some(4), second.last_event_reference.map(|r| r.position));

    assert_eq!(Some(4), projector.cursor().map(|r| r.position));
    assert_eq!(
        Some(4),
        projector.metrics().last_event_reference.map(|r| r.position),
    );
    assert_eq!(vec![3, 4], projector.projection().handled);
}

#[tokio::test]
async fn a_failing_handler_cancels_the_batch_and_keeps_the_cursor() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    seed_numbers(&stream).await;

    let mut projector = Projector::builder(
        stream,
        Recording {
            fail_at_position: Some(4),
            ..Recording::default()
        },
    )
    .batch_size(2)
    .build()
    .await
    .unwrap();

    let error = projector
        .run()
        .await
        .expect_err("the second batch should fail");

    match error {
        ProjectorError::Handler {
            event_reference, ..
        } => assert_eq!(4, event_reference.position),
        other => panic!("unexpected error: {other}"),
    }

    // The first batch committed (positions 1 and 3 under the type filter);
    // the failed batch left the cursor alone.
    assert_eq!(Some(3), projector.cursor().map(|r| r.position));

    let metrics = projector.metrics();
    assert_eq!(1, metrics.queries_done);
    assert_eq!(3, metrics.events_streamed);
    assert_eq!(2, metrics.events_handled);
    assert_eq!(Some(3), metrics.last_event_reference.map(|r| r.position));

    let projection = projector.into_projection();
    assert_eq!(vec![1, 3], projection.handled);
    assert_eq!(
        vec!["before", "after@3", "before", "cancel"],
        projection.lifecycle,
    );
}

#[tokio::test]
async fn an_unbounded_projector_drains_the_log_in_one_batch() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    seed_numbers(&stream).await;

    let mut projector = Projector::builder(stream, Recording::default())
        .build()
        .await
        .unwrap();

    let run = projector.run().await.unwrap();

    assert_eq!(1, run.queries_done);
    assert_eq!(4, run.events_handled);
    assert_eq!(vec![1, 3, 4, 6], projector.projection().handled);
}

#[tokio::test]
async fn bounded_runs_probe_until_no_work_remains() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    seed_numbers(&stream).await;

    let mut projector = Projector::builder(stream, Recording::default())
        .batch_size(3)
        .build()
        .await
        .unwrap();

    let run = projector.run().await.unwrap();

    // 4 matching events in batches of 3: one full batch, one remainder.
    assert_eq!(2, run.queries_done);
    assert_eq!(4, run.events_handled);
    assert_eq!(vec![1, 3, 4, 6], projector.projection().handled);

    // A further run finds nothing and stops immediately.
    let idle = projector.run().await.unwrap();
    assert_eq!(1, idle.queries_done);
    assert_eq!(0, idle.events_streamed);
}

#[tokio::test]
async fn the_until_reference_stops_the_run_early() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    let seeded = seed_numbers(&stream).await;

    let mut projector = Projector::builder(stream, Recording::default())
        .batch_size(1)
        .until(seeded[3].reference)
        .build()
        .await
        .unwrap();

    projector.run().await.unwrap();

    assert_eq!(vec![1, 3, 4], projector.projection().handled);
    assert_eq!(Some(4), projector.cursor().map(|r| r.position));
}

#[tokio::test]
async fn before_each_batch_policy_rereads_the_bookmark() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    let seeded = seed_numbers(&stream).await;

    storage
        .place_bookmark("numbers-projection", seeded[0].reference, Tags::none())
        .await
        .unwrap();

    let mut projector = Projector::builder(stream, Recording::default())
        .batch_size(1)
        .bookmark_policy(BookmarkPolicy::new(
            "numbers-projection",
            BookmarkReadMode::BeforeEachBatch,
        ))
        .build()
        .await
        .unwrap();

    projector.run_batch().await.unwrap();
    assert_eq!(vec![3], projector.projection().handled);

    // An external writer moves the bookmark; the next batch starts there.
    storage
        .place_bookmark("numbers-projection", seeded[4].reference, Tags::none())
        .await
        .unwrap();

    projector.run_batch().await.unwrap();
    assert_eq!(vec![3, 6], projector.projection().handled);
}

#[tokio::test]
async fn at_creation_policy_reads_the_bookmark_while_building() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    let seeded = seed_numbers(&stream).await;

    storage
        .place_bookmark("numbers-projection", seeded[3].reference, Tags::none())
        .await
        .unwrap();

    let projector = Projector::builder(stream, Recording::default())
        .bookmark_policy(BookmarkPolicy::new(
            "numbers-projection",
            BookmarkReadMode::AtCreation,
        ))
        .build()
        .await
        .unwrap();

    assert_eq!(Some(4), projector.cursor().map(|r| r.position));
}

#[tokio::test]
async fn manual_only_policy_never_reads_by_itself() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    let seeded = seed_numbers(&stream).await;

    storage
        .place_bookmark("numbers-projection", seeded[3].reference, Tags::none())
        .await
        .unwrap();

    let mut projector = Projector::builder(stream, Recording::default())
        .batch_size(1)
        .bookmark_policy(BookmarkPolicy::new(
            "numbers-projection",
            BookmarkReadMode::ManualOnly,
        ))
        .build()
        .await
        .unwrap();

    // Without a manual trigger the cursor starts at the log's beginning.
    projector.run_batch().await.unwrap();
    assert_eq!(vec![1], projector.projection().handled);

    projector.read_bookmark().await.unwrap();
    projector.run_batch().await.unwrap();
    assert_eq!(vec![1, 6], projector.projection().handled);
}

#[tokio::test]
async fn starting_after_skips_already_processed_events() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = raw_stream(&storage);

    let seeded = seed_numbers(&stream).await;

    let mut projector = Projector::builder(stream, Recording::default())
        .starting_after(seeded[2].reference)
        .build()
        .await
        .unwrap();

    projector.run().await.unwrap();

    assert_eq!(vec![4, 6], projector.projection().handled);
}
