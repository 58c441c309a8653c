//! Contains the notification fabric: the consistent (in-append,
//! synchronous) and eventually-consistent (background, coalesced) fan-out of
//! commit notifications, and the delivery of bookmark upserts.
//!
//! Every [stream facade][crate::stream::EventStream] owns one
//! [`StreamSubscription`] registered with the engine's [`Notifier`]. The
//! subscription runs a single dispatcher task: deliveries to one listener
//! never overlap, and bursts of appends coalesce into one delivery carrying
//! the largest reference seen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::event::{EventReference, StoredEvent};
use crate::stream_id::EventStreamId;
use crate::tag::Tags;

/// Notification emitted after every bookmark upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkPlaced {
    pub reader: String,
    pub reference: EventReference,
    pub tags: Tags,
}

/// A listener invoked synchronously in the appending task, after the commit
/// completes but before the append returns.
///
/// Listeners observe the just-committed batch once, as a list, in append
/// order, already filtered to the events their subscription's scope can
/// read. An error propagates to the appender; the append itself has already
/// committed at that point.
#[async_trait]
pub trait ConsistentListener: Send + Sync {
    async fn on_committed(&self, events: &[StoredEvent]) -> anyhow::Result<()>;
}

/// A listener invoked asynchronously with a coalesced target reference.
///
/// The listener returns the reference it has actually processed up to; the
/// dispatcher records it and only delivers again once the target has
/// advanced past it. Errors are logged and dropped; the next notification
/// retries with the latest target.
#[async_trait]
pub trait EventuallyConsistentListener: Send + Sync {
    async fn on_new_events(&self, target: EventReference) -> anyhow::Result<EventReference>;
}

/// A listener invoked asynchronously for every bookmark upsert, without
/// coalescing.
#[async_trait]
pub trait BookmarkListener: Send + Sync {
    async fn on_bookmark_placed(&self, notification: BookmarkPlaced) -> anyhow::Result<()>;
}

enum Wake {
    Events,
    Bookmark(BookmarkPlaced),
}

struct EventualSlot {
    listener: Arc<dyn EventuallyConsistentListener>,
    // Touched only by the dispatcher task; the lock satisfies interior
    // mutability across awaits.
    last_delivered: Mutex<Option<EventReference>>,
}

/// The per-facade endpoint of the notification fabric.
///
/// Holds the three listener lists for one [`EventStreamId`] scope and the
/// coalescing state of its dispatcher.
pub struct StreamSubscription {
    scope: EventStreamId,
    consistent: RwLock<Vec<Arc<dyn ConsistentListener>>>,
    eventual: RwLock<Vec<Arc<EventualSlot>>>,
    bookmark: RwLock<Vec<Arc<dyn BookmarkListener>>>,

    /// The pending coalesced target: the largest committed reference this
    /// scope has been notified about.
    target: Mutex<Option<EventReference>>,

    wake: mpsc::UnboundedSender<Wake>,
    wake_receiver: Mutex<Option<mpsc::UnboundedReceiver<Wake>>>,
    dispatcher_started: AtomicBool,
}

impl StreamSubscription {
    fn new(scope: EventStreamId) -> Self {
        let (wake, wake_receiver) = mpsc::unbounded_channel();

        Self {
            scope,
            consistent: RwLock::new(Vec::new()),
            eventual: RwLock::new(Vec::new()),
            bookmark: RwLock::new(Vec::new()),
            target: Mutex::new(None),
            wake,
            wake_receiver: Mutex::new(Some(wake_receiver)),
            dispatcher_started: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &EventStreamId {
        &self.scope
    }

    pub fn subscribe_consistent(&self, listener: Arc<dyn ConsistentListener>) {
        self.consistent.write().push(listener);
    }

    /// Registers an eventually-consistent listener, starting the dispatcher
    /// task on first use.
    ///
    /// Requires a running tokio runtime.
    pub fn subscribe_eventually_consistent(
        self: &Arc<Self>,
        listener: Arc<dyn EventuallyConsistentListener>,
    ) {
        self.eventual.write().push(Arc::new(EventualSlot {
            listener,
            last_delivered: Mutex::new(None),
        }));
        self.ensure_dispatcher();
    }

    /// Registers a bookmark listener, starting the dispatcher task on first
    /// use.
    ///
    /// Requires a running tokio runtime.
    pub fn subscribe_bookmarks(self: &Arc<Self>, listener: Arc<dyn BookmarkListener>) {
        self.bookmark.write().push(listener);
        self.ensure_dispatcher();
    }

    fn ensure_dispatcher(self: &Arc<Self>) {
        if self.dispatcher_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let receiver = self
            .wake_receiver
            .lock()
            .take()
            .expect("dispatcher receiver taken exactly once");

        tokio::spawn(dispatch(Arc::downgrade(self), receiver));
    }

    async fn deliver_consistent(&self, events: &[StoredEvent]) -> anyhow::Result<()> {
        let visible: Vec<StoredEvent> = events
            .iter()
            .filter(|event| self.scope.can_read(&event.stream))
            .cloned()
            .collect();

        if visible.is_empty() {
            return Ok(());
        }

        let listeners: Vec<_> = self.consistent.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_committed(&visible).await?;
        }

        Ok(())
    }

    async fn deliver_events(&self) {
        loop {
            let Some(target) = *self.target.lock() else {
                return;
            };

            let slots: Vec<_> = self.eventual.read().iter().cloned().collect();

            for slot in &slots {
                let last = *slot.last_delivered.lock();

                // Targets at or before the last delivered reference are
                // dropped.
                if matches!(last, Some(last) if !target.happened_after(&last)) {
                    continue;
                }

                match slot.listener.on_new_events(target).await {
                    Ok(processed) => {
                        *slot.last_delivered.lock() =
                            EventReference::max_by_position(last, Some(processed));
                    }
                    Err(error) => {
                        tracing::error!(
                            reference = %target,
                            error = %error,
                            "eventually-consistent listener failed; retrying on next notification",
                        );
                    }
                }
            }

            // One more delivery only if appends advanced the target while
            // this one was in flight.
            let advanced = self
                .target
                .lock()
                .map_or(false, |current| current.happened_after(&target));

            if !advanced {
                return;
            }
        }
    }

    async fn deliver_bookmark(&self, notification: BookmarkPlaced) {
        let listeners: Vec<_> = self.bookmark.read().iter().cloned().collect();

        for listener in listeners {
            if let Err(error) = listener.on_bookmark_placed(notification.clone()).await {
                tracing::error!(
                    bookmark.reader = %notification.reader,
                    error = %error,
                    "bookmark listener failed",
                );
            }
        }
    }
}

async fn dispatch(subscription: Weak<StreamSubscription>, mut wake: mpsc::UnboundedReceiver<Wake>) {
    // The receiver closes when the owning facade drops its subscription,
    // ending the task.
    while let Some(message) = wake.recv().await {
        let Some(subscription) = subscription.upgrade() else {
            return;
        };

        match message {
            Wake::Events => subscription.deliver_events().await,
            Wake::Bookmark(notification) => subscription.deliver_bookmark(notification).await,
        }
    }
}

/// The engine-side registry of [`StreamSubscription`]s.
///
/// Subscriptions are held weakly: a dropped facade takes its subscription
/// (and dispatcher) with it, and the registry prunes the dead entry on the
/// next publish.
#[derive(Default)]
pub struct Notifier {
    subscriptions: RwLock<Vec<Weak<StreamSubscription>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscription scoped to the specified stream id.
    pub fn register(&self, scope: EventStreamId) -> Arc<StreamSubscription> {
        let subscription = Arc::new(StreamSubscription::new(scope));
        self.subscriptions
            .write()
            .push(Arc::downgrade(&subscription));
        subscription
    }

    /// Consistent fan-out: delivers the committed batch, filtered per
    /// subscription scope, in the calling task. Invoked by the engine after
    /// commit, before the append returns.
    pub async fn publish_committed(&self, events: &[StoredEvent]) -> anyhow::Result<()> {
        for subscription in self.alive() {
            subscription.deliver_consistent(events).await?;
        }

        Ok(())
    }

    /// Eventually-consistent scheduling: advances each interested
    /// subscription's coalescing target to the largest visible reference in
    /// the batch and wakes its dispatcher.
    pub fn schedule_eventual(&self, events: &[StoredEvent]) {
        for subscription in self.alive() {
            let last_visible = events
                .iter()
                .rev()
                .find(|event| subscription.scope.can_read(&event.stream))
                .map(|event| event.reference);

            let Some(reference) = last_visible else {
                continue;
            };

            {
                let mut target = subscription.target.lock();
                *target = EventReference::max_by_position(*target, Some(reference));
            }

            if subscription.dispatcher_started.load(Ordering::SeqCst) {
                let _ = subscription.wake.send(Wake::Events);
            }
        }
    }

    /// Bookmark fan-out: queues one notification per upsert on every
    /// subscription's dispatcher. No coalescing.
    pub fn publish_bookmark(&self, notification: BookmarkPlaced) {
        for subscription in self.alive() {
            if subscription.dispatcher_started.load(Ordering::SeqCst) {
                let _ = subscription.wake.send(Wake::Bookmark(notification.clone()));
            }
        }
    }

    fn alive(&self) -> Vec<Arc<StreamSubscription>> {
        let subscriptions = self.subscriptions.read();
        let alive: Vec<_> = subscriptions
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        if alive.len() != subscriptions.len() {
            drop(subscriptions);
            self.subscriptions
                .write()
                .retain(|subscription| subscription.strong_count() > 0);
        }

        alive
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::event::{EventId, EventType};

    fn stored_event(position: u64, stream: EventStreamId) -> StoredEvent {
        StoredEvent {
            stream,
            event_type: EventType::from("SomethingHappened"),
            reference: EventReference::new(EventId::new(), position),
            immutable_data: b"{}".to_vec(),
            erasable_data: None,
            tags: Tags::none(),
            timestamp: Utc::now(),
        }
    }

    struct RecordingConsistentListener {
        batches: Mutex<Vec<Vec<EventReference>>>,
    }

    #[async_trait]
    impl ConsistentListener for RecordingConsistentListener {
        async fn on_committed(&self, events: &[StoredEvent]) -> anyhow::Result<()> {
            self.batches
                .lock()
                .push(events.iter().map(|event| event.reference).collect());
            Ok(())
        }
    }

    struct RecordingEventualListener {
        deliveries: Mutex<Vec<EventReference>>,
        delivered: tokio::sync::Notify,
    }

    #[async_trait]
    impl EventuallyConsistentListener for RecordingEventualListener {
        async fn on_new_events(&self, target: EventReference) -> anyhow::Result<EventReference> {
            self.deliveries.lock().push(target);
            self.delivered.notify_waiters();
            Ok(target)
        }
    }

    #[tokio::test]
    async fn consistent_listeners_observe_the_batch_filtered_by_scope() {
        let notifier = Notifier::new();

        let customers = notifier.register(EventStreamId::for_context("customers"));
        let orders = notifier.register(EventStreamId::new("orders", "default"));

        let customers_listener = Arc::new(RecordingConsistentListener {
            batches: Mutex::new(Vec::new()),
        });
        let orders_listener = Arc::new(RecordingConsistentListener {
            batches: Mutex::new(Vec::new()),
        });

        customers.subscribe_consistent(customers_listener.clone());
        orders.subscribe_consistent(orders_listener.clone());

        let batch = vec![
            stored_event(1, EventStreamId::new("customers", "default")),
            stored_event(2, EventStreamId::new("customers", "billing")),
        ];

        notifier
            .publish_committed(&batch)
            .await
            .expect("fan-out should succeed");

        let batches = customers_listener.batches.lock();
        assert_eq!(1, batches.len());
        assert_eq!(2, batches[0].len());

        assert!(orders_listener.batches.lock().is_empty());
    }

    #[tokio::test]
    async fn eventual_deliveries_coalesce_to_the_latest_target() {
        let notifier = Notifier::new();
        let subscription = notifier.register(EventStreamId::any());

        let listener = Arc::new(RecordingEventualListener {
            deliveries: Mutex::new(Vec::new()),
            delivered: tokio::sync::Notify::new(),
        });
        subscription.subscribe_eventually_consistent(listener.clone());

        let stream = EventStreamId::new("customers", "default");
        for position in 1..=5 {
            notifier.schedule_eventual(&[stored_event(position, stream.clone())]);
        }

        // Wait for the dispatcher to drain.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                {
                    let deliveries = listener.deliveries.lock();
                    if deliveries.last().map(|reference| reference.position) == Some(5) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("the dispatcher should deliver the final target");

        let deliveries = listener.deliveries.lock();
        assert!(deliveries.len() <= 5);
        assert!(deliveries
            .windows(2)
            .all(|pair| pair[0].position <= pair[1].position));
    }

    #[tokio::test]
    async fn stale_targets_are_dropped() {
        let notifier = Notifier::new();
        let subscription = notifier.register(EventStreamId::any());

        let listener = Arc::new(RecordingEventualListener {
            deliveries: Mutex::new(Vec::new()),
            delivered: tokio::sync::Notify::new(),
        });
        subscription.subscribe_eventually_consistent(listener.clone());

        let stream = EventStreamId::new("customers", "default");
        let event = stored_event(3, stream.clone());

        notifier.schedule_eventual(&[event.clone()]);

        tokio::time::timeout(Duration::from_secs(1), async {
            while listener.deliveries.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("the first delivery should arrive");

        // Re-notifying the same reference is a no-op.
        notifier.schedule_eventual(&[event]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(1, listener.deliveries.lock().len());
    }
}
