//! Stream Multiplexer Tests
//!
//! Merged-feed behavior:
//! - Partition discovery and binding
//! - Hot feed semantics around connect
//! - Per-partition ordering
//! - Fault isolation and partition restart

use std::sync::Arc;
use std::time::Duration;

use hubsync_core::{Error, FeedItem, FeedReceiver};
use hubsync_stream::{
    LinkError, MemoryHub, MultiplexerConfig, ReceiverConfig, RetryPolicy, StreamMultiplexer,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn config(restart: bool) -> MultiplexerConfig {
    MultiplexerConfig {
        restart_failed_partitions: restart,
        restart_delay_secs: 0,
        receiver: ReceiverConfig {
            retry: RetryPolicy::immediate(2),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn bind(hub: &MemoryHub, config: MultiplexerConfig) -> StreamMultiplexer {
    let mux = StreamMultiplexer::bind(Arc::new(hub.clone()), config)
        .await
        .unwrap();
    // Let every receiver attach before anything is published.
    tokio::time::sleep(Duration::from_millis(20)).await;
    mux
}

async fn next(rx: &mut FeedReceiver) -> FeedItem {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for feed item")
        .expect("feed closed")
}

fn seq(item: &FeedItem) -> i64 {
    item.event()
        .and_then(|e| e.body.attribute("seq"))
        .and_then(|v| v.as_i64())
        .unwrap()
}

// ============================================================================
// Binding
// ============================================================================

#[tokio::test]
async fn test_bind_discovers_partitions() {
    let hub = MemoryHub::new(4);
    let mux = bind(&hub, config(false)).await;

    assert_eq!(mux.partitions(), ["0", "1", "2", "3"]);
    for partition in mux.partitions() {
        assert_eq!(hub.attach_count(partition), 1);
    }
}

#[tokio::test]
async fn test_discovery_failure_is_connection_error() {
    let hub = MemoryHub::new(2);
    hub.fail_discovery(LinkError::Unauthorized("invalid signature".into()));

    let result = StreamMultiplexer::bind(Arc::new(hub), config(false)).await;
    match result {
        Err(Error::Connection(message)) => assert!(message.contains("invalid signature")),
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("bind should fail"),
    }
}

// ============================================================================
// Hot feed
// ============================================================================

#[tokio::test]
async fn test_items_wait_for_connect() {
    let hub = MemoryHub::new(2);
    let mux = bind(&hub, config(false)).await;
    let mut early = mux.subscribe();

    hub.publish("0", Some("rpi2"), r#"{"seq":1}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(early.try_recv().is_none());

    assert!(mux.connect());
    assert!(!mux.connect());
    assert_eq!(seq(&next(&mut early).await), 1);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let hub = MemoryHub::new(2);
    let mux = bind(&hub, config(false)).await;
    let mut early = mux.subscribe();
    mux.connect();

    hub.publish("1", Some("edison"), r#"{"seq":1}"#).unwrap();
    assert_eq!(seq(&next(&mut early).await), 1);

    let mut late = mux.subscribe();
    hub.publish("1", Some("edison"), r#"{"seq":2}"#).unwrap();

    assert_eq!(seq(&next(&mut late).await), 2);
    assert_eq!(seq(&next(&mut early).await), 2);
}

#[tokio::test]
async fn test_history_before_bind_is_not_delivered() {
    let hub = MemoryHub::new(1);
    hub.publish("0", Some("huzzah"), r#"{"seq":0}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;

    let mux = bind(&hub, config(false)).await;
    let mut rx = mux.subscribe();
    mux.connect();
    hub.publish("0", Some("huzzah"), r#"{"seq":1}"#).unwrap();

    assert_eq!(seq(&next(&mut rx).await), 1);
}

#[tokio::test]
async fn test_partition_order_is_preserved() {
    let hub = MemoryHub::new(3);
    let mux = bind(&hub, config(false)).await;
    let mut rx = mux.subscribe();
    mux.connect();

    for i in 0..10 {
        for partition in ["0", "1", "2"] {
            let device = format!("device-{}", partition);
            hub.publish(partition, Some(&device), format!(r#"{{"seq":{}}}"#, i))
                .unwrap();
        }
    }

    let mut last = [-1i64; 3];
    for _ in 0..30 {
        let item = next(&mut rx).await;
        let index: usize = item.partition_id().parse().unwrap();
        let current = seq(&item);
        assert!(current > last[index], "partition {} went backwards", index);
        last[index] = current;
    }
    assert_eq!(last, [9, 9, 9]);
}

#[tokio::test]
async fn test_device_subscription() {
    let hub = MemoryHub::new(2);
    let mux = bind(&hub, config(false)).await;
    let mut rpi2 = mux.device("rpi2");
    mux.connect();

    hub.publish("0", Some("huzzah"), r#"{"seq":1}"#).unwrap();
    hub.publish("1", Some("rpi2"), r#"{"seq":2}"#).unwrap();

    let item = timeout(WAIT, rpi2.recv()).await.unwrap().unwrap();
    assert!(item.is_from_device("rpi2"));
    assert_eq!(seq(&item), 2);
}

// ============================================================================
// Faults
// ============================================================================

#[tokio::test]
async fn test_failed_partition_does_not_stop_others() {
    let hub = MemoryHub::new(2);
    hub.fail_attach("1", LinkError::Unauthorized("revoked".into()));

    let mux = bind(&hub, config(false)).await;
    let mut rx = mux.subscribe();
    mux.connect();

    let fault = next(&mut rx).await;
    assert!(fault.is_fault());
    assert_eq!(fault.partition_id(), "1");

    hub.publish("0", Some("huzzah"), r#"{"seq":7}"#).unwrap();
    let item = next(&mut rx).await;
    assert_eq!(item.partition_id(), "0");
    assert_eq!(seq(&item), 7);
}

#[tokio::test]
async fn test_failed_partition_is_restarted() {
    let hub = MemoryHub::new(1);
    hub.fail_attach("0", LinkError::Unauthorized("token expired".into()));

    let mux = bind(&hub, config(true)).await;
    let mut rx = mux.subscribe();
    mux.connect();

    assert!(next(&mut rx).await.is_fault());

    hub.publish("0", Some("rpi2"), r#"{"seq":3}"#).unwrap();
    let item = next(&mut rx).await;
    assert_eq!(seq(&item), 3);
    assert_eq!(hub.attach_count("0"), 2);
}

#[tokio::test]
async fn test_restart_does_not_replay() {
    let hub = MemoryHub::new(1);
    let mux = bind(&hub, config(true)).await;
    let mut rx = mux.subscribe();
    mux.connect();

    hub.publish("0", Some("edison"), r#"{"seq":1}"#).unwrap();
    assert_eq!(seq(&next(&mut rx).await), 1);

    // Break the link more times than the retry budget allows.
    for _ in 0..3 {
        hub.fail_attach("0", LinkError::Transient("flapping".into()));
    }
    hub.break_links("0", LinkError::Closed);

    assert!(next(&mut rx).await.is_fault());
    hub.publish("0", Some("edison"), r#"{"seq":2}"#).unwrap();
    assert_eq!(seq(&next(&mut rx).await), 2);
}

#[tokio::test]
async fn test_shutdown_stops_delivery() {
    let hub = MemoryHub::new(1);
    let mux = bind(&hub, config(false)).await;
    let mut rx = mux.subscribe();
    mux.connect();

    mux.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    hub.publish("0", Some("rpi2"), r#"{"seq":1}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_none());
}
