//! Hot event feed shared by every downstream consumer.
//!
//! The feed is a broadcast channel: every subscriber sees every item
//! published after it subscribed, and nothing published before. Items are
//! either telemetry events or partition faults, so an error on one partition
//! travels the same path as the events of the others without stopping them.
//!
//! [`ConnectableFeed`] adds the connect step: producers push into an unbounded fan-in
//! channel from the moment partitions are bound, and nothing reaches the
//! broadcast side until [`ConnectableFeed::connect`] is called.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::event::TelemetryEvent;

/// Default channel capacity for the feed.
pub const DEFAULT_FEED_CAPACITY: usize = 1000;

/// An error surfaced by one partition receiver.
#[derive(Debug, Clone)]
pub struct PartitionFault {
    /// Partition that failed
    pub partition_id: String,
    /// What went wrong
    pub error: Error,
    /// When the fault was raised
    pub timestamp: DateTime<Utc>,
}

impl PartitionFault {
    /// Create a fault stamped with the current time.
    pub fn new(partition_id: impl Into<String>, error: Error) -> Self {
        Self {
            partition_id: partition_id.into(),
            error,
            timestamp: Utc::now(),
        }
    }
}

/// One item on the feed.
#[derive(Debug, Clone)]
pub enum FeedItem {
    /// A decoded telemetry event
    Event(Arc<TelemetryEvent>),
    /// A partition receiver gave up
    Fault(PartitionFault),
}

impl FeedItem {
    /// The event carried by this item, if any.
    pub fn event(&self) -> Option<&Arc<TelemetryEvent>> {
        match self {
            FeedItem::Event(event) => Some(event),
            FeedItem::Fault(_) => None,
        }
    }

    /// Whether this item is a partition fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, FeedItem::Fault(_))
    }

    /// Partition the item originated from.
    pub fn partition_id(&self) -> &str {
        match self {
            FeedItem::Event(event) => &event.partition_id,
            FeedItem::Fault(fault) => &fault.partition_id,
        }
    }

    /// Whether this item is an event sent by `device_id`.
    pub fn is_from_device(&self, device_id: &str) -> bool {
        self.event().is_some_and(|e| e.is_from(device_id))
    }
}

impl From<TelemetryEvent> for FeedItem {
    fn from(event: TelemetryEvent) -> Self {
        FeedItem::Event(Arc::new(event))
    }
}

/// Broadcast feed of [`FeedItem`]s.
#[derive(Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<FeedItem>,
    name: String,
}

impl EventFeed {
    /// Create a new feed with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// Create a new feed with the specified capacity.
    ///
    /// The capacity determines how many items are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            name: "events".to_string(),
        }
    }

    /// Set the feed name used in logs.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Get the name of this feed.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an item to all current subscribers.
    ///
    /// Returns `true` if there was at least one subscriber. With no
    /// subscribers the item is discarded.
    pub fn publish(&self, item: impl Into<FeedItem>) -> bool {
        self.tx.send(item.into()).is_ok()
    }

    /// Subscribe to all items.
    pub fn subscribe(&self) -> FeedReceiver {
        FeedReceiver {
            rx: self.tx.subscribe(),
            feed: self.name.clone(),
        }
    }

    /// Subscribe to items matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&FeedItem) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    /// Subscribe to the events of a single device.
    ///
    /// Faults and events from other devices are skipped.
    pub fn device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&FeedItem) -> bool + Send + 'static> {
        let device_id = device_id.into();
        self.subscribe_filtered(move |item| item.is_from_device(&device_id))
    }

    /// Subscribe to partition faults only.
    pub fn faults(&self) -> FilteredReceiver<fn(&FeedItem) -> bool> {
        FilteredReceiver::new(self.subscribe(), FeedItem::is_fault)
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all items on a feed.
pub struct FeedReceiver {
    rx: broadcast::Receiver<FeedItem>,
    feed: String,
}

impl FeedReceiver {
    /// Receive the next item.
    ///
    /// Returns `None` once the feed is closed. A subscriber that falls behind
    /// skips the items it missed and keeps going.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        category = "stream",
                        feed = %self.feed,
                        skipped,
                        "Feed subscriber lagged, items dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an item without blocking.
    pub fn try_recv(&mut self) -> Option<FeedItem> {
        self.rx.try_recv().ok()
    }

    /// Turn the receiver into a `Stream`.
    pub fn into_stream(mut self) -> impl Stream<Item = FeedItem> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

/// Receiver for filtered items from a feed.
pub struct FilteredReceiver<F>
where
    F: Fn(&FeedItem) -> bool + Send,
{
    inner: FeedReceiver,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&FeedItem) -> bool + Send,
{
    fn new(inner: FeedReceiver, filter: F) -> Self {
        Self { inner, filter }
    }

    /// Receive the next matching item.
    ///
    /// Returns `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        while let Some(item) = self.inner.recv().await {
            if (self.filter)(&item) {
                return Some(item);
            }
        }
        None
    }

    /// Try to receive a matching item without blocking.
    pub fn try_recv(&mut self) -> Option<FeedItem> {
        while let Some(item) = self.inner.try_recv() {
            if (self.filter)(&item) {
                return Some(item);
            }
        }
        None
    }
}

/// A feed whose delivery starts on an explicit connect.
///
/// Producers write into the fan-in channel handed to [`ConnectableFeed::new`]
/// as soon as they exist. Until [`connect`](Self::connect) is called those
/// items wait in the channel; afterwards a single forwarding task moves them
/// onto the broadcast feed in arrival order. Subscribers attached before the
/// connect therefore see everything produced since binding, while later
/// subscribers only see items from their attach point on.
pub struct ConnectableFeed {
    feed: EventFeed,
    pending: Mutex<Option<mpsc::UnboundedReceiver<FeedItem>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectableFeed {
    /// Wrap a fan-in channel and the feed it should deliver to.
    pub fn new(feed: EventFeed, source: mpsc::UnboundedReceiver<FeedItem>) -> Self {
        Self {
            feed,
            pending: Mutex::new(Some(source)),
            forwarder: Mutex::new(None),
        }
    }

    /// The broadcast side.
    pub fn feed(&self) -> &EventFeed {
        &self.feed
    }

    /// Subscribe to all items.
    pub fn subscribe(&self) -> FeedReceiver {
        self.feed.subscribe()
    }

    /// Subscribe to the events of a single device.
    pub fn device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&FeedItem) -> bool + Send + 'static> {
        self.feed.device(device_id)
    }

    /// Whether `connect` has been called.
    pub fn is_connected(&self) -> bool {
        self.pending.lock().is_none()
    }

    /// Start delivering items to subscribers.
    ///
    /// Returns `false` if the feed was already connected. Must be called from
    /// within a Tokio runtime.
    pub fn connect(&self) -> bool {
        let Some(mut source) = self.pending.lock().take() else {
            return false;
        };

        let feed = self.feed.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = source.recv().await {
                // No subscribers is not an error for a hot feed.
                feed.publish(item);
            }
            tracing::debug!(category = "stream", feed = %feed.name(), "Feed source closed");
        });
        *self.forwarder.lock() = Some(handle);

        tracing::info!(category = "stream", feed = %self.feed.name(), "Feed connected");
        true
    }

    /// Stop forwarding. Items still in flight are dropped.
    pub fn disconnect(&self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ConnectableFeed {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Shared feed handle.
pub type SharedFeed = Arc<ConnectableFeed>;
