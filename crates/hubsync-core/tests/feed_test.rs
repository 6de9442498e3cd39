//! Event Feed Tests
//!
//! Hot feed behavior seen by subscribers:
//! - Fan-out to every live subscriber
//! - Lagging subscribers skip instead of closing
//! - Stream adapter
//! - Closing when the last sender goes away

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hubsync_core::{
    ConnectableFeed, Error, EventFeed, FeedItem, PartitionFault, TelemetryEvent,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(1);

fn event(device: &str, seq: i64) -> TelemetryEvent {
    let mut props = Map::new();
    props.insert("iothub-connection-device-id".into(), json!(device));
    TelemetryEvent::from_raw("0", json!({ "seq": seq }).to_string().as_bytes(), props)
}

fn seq(item: &FeedItem) -> i64 {
    item.event()
        .and_then(|e| e.body.attribute("seq"))
        .and_then(Value::as_i64)
        .unwrap()
}

#[tokio::test]
async fn test_every_subscriber_sees_every_item() {
    let feed = EventFeed::new();
    let mut a = feed.subscribe();
    let mut b = feed.subscribe();
    assert_eq!(feed.subscriber_count(), 2);

    for i in 0..5 {
        assert!(feed.publish(event("rpi2", i)));
    }

    for rx in [&mut a, &mut b] {
        for i in 0..5 {
            let item = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(seq(&item), i);
        }
    }
}

#[tokio::test]
async fn test_lagging_subscriber_skips_and_continues() {
    let feed = EventFeed::with_capacity(4);
    let mut slow = feed.subscribe();

    for i in 0..10 {
        feed.publish(event("edison", i));
    }

    // The oldest items were overwritten; the receiver resumes at the oldest
    // one still buffered.
    let first = timeout(WAIT, slow.recv()).await.unwrap().unwrap();
    assert_eq!(seq(&first), 6);
    let next = timeout(WAIT, slow.recv()).await.unwrap().unwrap();
    assert_eq!(seq(&next), 7);
}

#[tokio::test]
async fn test_receiver_closes_with_feed() {
    let feed = EventFeed::new();
    let mut rx = feed.subscribe();
    feed.publish(event("huzzah", 1));
    drop(feed);

    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_some());
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_into_stream() {
    let feed = EventFeed::new();
    let stream = feed.subscribe().into_stream();

    feed.publish(event("rpi2", 1));
    feed.publish(FeedItem::Fault(PartitionFault::new("2", Error::Other("lost".into()))));
    feed.publish(event("rpi2", 2));
    drop(feed);

    let items: Vec<FeedItem> = timeout(WAIT, stream.collect()).await.unwrap();
    assert_eq!(items.len(), 3);
    assert!(items[1].is_fault());
    assert_eq!(seq(&items[2]), 2);
}

#[tokio::test]
async fn test_connectable_preserves_fan_in_order() {
    let (tx, rx) = mpsc::unbounded_channel();
    let connectable = Arc::new(ConnectableFeed::new(EventFeed::new().named("test"), rx));
    let mut subscriber = connectable.subscribe();

    for i in 0..50 {
        tx.send(event("huzzah", i).into()).unwrap();
    }
    connectable.connect();

    for i in 0..50 {
        let item = timeout(WAIT, subscriber.recv()).await.unwrap().unwrap();
        assert_eq!(seq(&item), i);
    }
    assert_eq!(connectable.feed().name(), "test");
}

#[tokio::test]
async fn test_disconnect_stops_forwarding() {
    let (tx, rx) = mpsc::unbounded_channel();
    let connectable = ConnectableFeed::new(EventFeed::new(), rx);
    let mut subscriber = connectable.subscribe();
    connectable.connect();

    tx.send(event("rpi2", 1).into()).unwrap();
    timeout(WAIT, subscriber.recv()).await.unwrap().unwrap();

    connectable.disconnect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let _ = tx.send(event("rpi2", 2).into());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(subscriber.try_recv().is_none());
}
