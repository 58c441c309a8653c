use std::sync::Arc;

use futures::TryStreamExt;

use consistently::store::memory::InMemoryEventStorage;
use consistently::store::EventAppender;
use consistently::{
    AppendCriteria, EventQuery, EventStreamId, EventType, EventTypesFilter, Limit, NewEvent, Tag,
    Tags, UncommittedEvent,
};

mod setup;

use setup::{confirmed, customer_stream, renamed, CustomerEvent, CustomerRenamed};

#[tokio::test]
async fn match_all_and_match_none_behave_at_the_extremes() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = customer_stream(EventStreamId::with_default_purpose("customers"), &storage);

    stream
        .append(
            AppendCriteria::none(),
            vec![
                NewEvent::from(confirmed()).with_tag(Tag::new("customer", "123")),
                NewEvent::from(renamed("Jane")),
            ],
        )
        .await
        .unwrap();

    let all: Vec<_> = stream
        .query(EventQuery::match_all(), None, Limit::unlimited())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(2, all.len());

    let none: Vec<_> = stream
        .query(EventQuery::match_none(), None, Limit::unlimited())
        .try_collect()
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn type_and_tag_filters_conjoin_within_an_item() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = customer_stream(EventStreamId::with_default_purpose("customers"), &storage);

    stream
        .append(
            AppendCriteria::none(),
            vec![
                NewEvent::from(confirmed()).with_tag(Tag::new("customer", "123")),
                NewEvent::from(renamed("Jane")).with_tag(Tag::new("customer", "123")),
                NewEvent::from(confirmed()).with_tag(Tag::new("customer", "456")),
            ],
        )
        .await
        .unwrap();

    let matched: Vec<_> = stream
        .query(
            EventQuery::for_events(
                EventTypesFilter::of(["CustomerConfirmed"]),
                Tags::parse(["customer:123"]),
            ),
            None,
            Limit::unlimited(),
        )
        .try_collect()
        .await
        .unwrap();

    assert_eq!(1, matched.len());
    assert_eq!(1, matched[0].reference.position);
}

#[tokio::test]
async fn the_until_bound_is_inclusive_at_the_engine() {
    let storage = Arc::new(InMemoryEventStorage::new());
    let stream = customer_stream(EventStreamId::with_default_purpose("customers"), &storage);

    let appended = stream
        .append(
            AppendCriteria::none(),
            vec![
                NewEvent::from(confirmed()),
                NewEvent::from(confirmed()),
                NewEvent::from(confirmed()),
            ],
        )
        .await
        .unwrap();

    let bound = appended[1].reference;

    let matched: Vec<_> = stream
        .query(
            EventQuery::match_all().until(bound),
            None,
            Limit::unlimited(),
        )
        .try_collect()
        .await
        .unwrap();

    // The event at exactly the bound is included.
    assert_eq!(
        vec![1, 2],
        matched
            .iter()
            .map(|event| event.reference.position)
            .collect::<Vec<_>>(),
    );
}

#[tokio::test]
async fn querying_the_current_type_returns_upcast_legacy_events() {
    let storage = Arc::new(InMemoryEventStorage::new());

    // History written before the rename event was redesigned: raw bytes
    // under the deprecated type name.
    storage
        .append(
            AppendCriteria::none(),
            Some(EventStreamId::with_default_purpose("customers")),
            vec![UncommittedEvent {
                stream: None,
                event_type: EventType::from("CustomerNameChanged"),
                immutable_data: br#"{"new_name":"Jane"}"#.to_vec(),
                erasable_data: None,
                tags: Tags::none(),
            }],
        )
        .await
        .unwrap();

    let stream = customer_stream(EventStreamId::with_default_purpose("customers"), &storage);

    // A new-style event alongside the legacy one.
    stream
        .append(AppendCriteria::none(), vec![NewEvent::from(renamed("Joan"))])
        .await
        .unwrap();

    let matched: Vec<_> = stream
        .query(
            EventQuery::for_events(EventTypesFilter::of(["CustomerRenamed"]), Tags::none()),
            None,
            Limit::unlimited(),
        )
        .try_collect()
        .await
        .unwrap();

    assert_eq!(2, matched.len());
    assert_eq!(
        CustomerEvent::Renamed(CustomerRenamed {
            name: "Jane".to_owned(),
        }),
        matched[0].payload,
    );
    assert_eq!(EventType::from("CustomerNameChanged"), matched[0].event_type);
    assert_eq!(
        CustomerEvent::Renamed(CustomerRenamed {
            name: "Joan".to_owned(),
        }),
        matched[1].payload,
    );
}

#[tokio::test]
async fn the_dcb_check_sees_legacy_events_through_the_expanded_query() {
    let storage = Arc::new(InMemoryEventStorage::new());

    storage
        .append(
            AppendCriteria::none(),
            Some(EventStreamId::with_default_purpose("customers")),
            vec![UncommittedEvent {
                stream: None,
                event_type: EventType::from("CustomerNameChanged"),
                immutable_data: br#"{"new_name":"Jane"}"#.to_vec(),
                erasable_data: None,
                tags: Tags::parse(["customer:123"]),
            }],
        )
        .await
        .unwrap();

    let stream = customer_stream(EventStreamId::with_default_purpose("customers"), &storage);

    // The boundary names only the current type, but the stored legacy event
    // must still be the "last matching event" the criteria compare against:
    // expecting absence has to conflict.
    let error = stream
        .append(
            AppendCriteria::no_events_matching(EventQuery::for_events(
                EventTypesFilter::of(["CustomerRenamed"]),
                Tags::parse(["customer:123"]),
            )),
            vec![NewEvent::from(renamed("Joan")).with_tag(Tag::new("customer", "123"))],
        )
        .await
        .expect_err("the legacy event occupies the boundary");

    assert!(matches!(
        error,
        consistently::store::AppendError::Conflict(_),
    ));
}

#[test]
fn the_wire_form_of_a_query_roundtrips() {
    let query = EventQuery::for_events(
        EventTypesFilter::of(["CustomerRenamed"]),
        Tags::parse(["customer:123"]),
    );

    let encoded = serde_json::to_string(&query).unwrap();
    assert_eq!(
        r#"{"items":[{"eventTypes":["CustomerRenamed"],"tags":["customer:123"]}]}"#,
        encoded,
    );

    let decoded: EventQuery = serde_json::from_str(&encoded).unwrap();
    assert_eq!(query, decoded);

    // The two empty states survive a round-trip distinctly.
    let all: EventQuery =
        serde_json::from_str(&serde_json::to_string(&EventQuery::match_all()).unwrap()).unwrap();
    assert_eq!(EventQuery::match_all(), all);

    let none: EventQuery =
        serde_json::from_str(&serde_json::to_string(&EventQuery::match_none()).unwrap()).unwrap();
    assert_eq!(EventQuery::match_none(), none);
}
