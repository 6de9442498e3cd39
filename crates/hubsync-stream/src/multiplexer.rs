//! Stream multiplexer.
//!
//! Binds one [`PartitionReceiver`] per partition, all starting "from now",
//! and merges their output into a single hot [`ConnectableFeed`]. Each
//! partition is driven by its own supervisor task, so a failing partition
//! turns into a [`PartitionFault`] on the feed while the others keep
//! delivering. Optionally a failed partition is restarted after a delay,
//! resuming right after its last delivered event.

use std::sync::Arc;
use std::time::Duration;

use hubsync_core::config::defaults;
use hubsync_core::{
    ConnectableFeed, Error, EventFeed, FeedItem, FeedReceiver, FilteredReceiver, PartitionFault,
    Result, SharedFeed, DEFAULT_FEED_CAPACITY,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::DynEventHubClient;
use crate::cursor::Cursor;
use crate::receiver::{PartitionReceiver, ReceiverChannels, ReceiverConfig};

/// Multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Consumer group all receivers join
    pub consumer_group: String,
    /// Broadcast capacity of the merged feed
    pub feed_capacity: usize,
    /// Restart a partition after its receiver gives up
    pub restart_failed_partitions: bool,
    /// Delay before such a restart
    pub restart_delay_secs: u64,
    /// Per-partition receiver settings
    pub receiver: ReceiverConfig,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            consumer_group: defaults::CONSUMER_GROUP.to_string(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            restart_failed_partitions: true,
            restart_delay_secs: 5,
            receiver: ReceiverConfig::default(),
        }
    }
}

impl MultiplexerConfig {
    fn restart_delay(&self) -> Option<Duration> {
        self.restart_failed_partitions
            .then(|| Duration::from_secs(self.restart_delay_secs))
    }
}

/// Merged, hot feed over every partition of the event path.
pub struct StreamMultiplexer {
    partitions: Vec<String>,
    feed: SharedFeed,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamMultiplexer {
    /// Discover partitions and start a receiver on each, from now on.
    ///
    /// Items are buffered until [`connect`](Self::connect). Fails with
    /// [`Error::Connection`] when partition discovery fails.
    pub async fn bind(client: DynEventHubClient, config: MultiplexerConfig) -> Result<Self> {
        let partitions = client.partition_ids().await.map_err(|e| {
            Error::Connection(format!(
                "partition discovery on {} failed: {}",
                client.event_path(),
                e
            ))
        })?;
        if partitions.is_empty() {
            return Err(Error::Connection(format!(
                "no partitions found on {}",
                client.event_path()
            )));
        }

        let (fan_in, source) = mpsc::unbounded_channel();
        let feed = EventFeed::with_capacity(config.feed_capacity).named(client.event_path());
        let feed = Arc::new(ConnectableFeed::new(feed, source));

        let start = Cursor::now();
        let restart_delay = config.restart_delay();
        let supervisors = partitions
            .iter()
            .map(|partition_id| {
                let receiver = PartitionReceiver::new(
                    client.clone(),
                    &config.consumer_group,
                    partition_id.clone(),
                    config.receiver.clone(),
                );
                tokio::spawn(supervise(receiver, start.clone(), fan_in.clone(), restart_delay))
            })
            .collect();

        info!(
            category = "stream",
            event_path = %client.event_path(),
            consumer_group = %config.consumer_group,
            partitions = partitions.len(),
            "Bound to partitions"
        );

        Ok(Self {
            partitions,
            feed,
            supervisors: Mutex::new(supervisors),
        })
    }

    /// Partition ids found at bind time.
    pub fn partitions(&self) -> &[String] {
        &self.partitions
    }

    /// Shared handle to the merged feed.
    pub fn feed(&self) -> SharedFeed {
        self.feed.clone()
    }

    /// Start delivery to subscribers. Returns `false` if already connected.
    pub fn connect(&self) -> bool {
        self.feed.connect()
    }

    /// Subscribe to the merged feed.
    pub fn subscribe(&self) -> FeedReceiver {
        self.feed.subscribe()
    }

    /// Subscribe to one device's events.
    pub fn device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&FeedItem) -> bool + Send + 'static> {
        self.feed.device(device_id)
    }

    /// Stop every partition and the feed.
    pub fn shutdown(&self) {
        let supervisors: Vec<_> = self.supervisors.lock().drain(..).collect();
        if supervisors.is_empty() {
            return;
        }
        for handle in supervisors {
            handle.abort();
        }
        self.feed.disconnect();
        info!(category = "stream", "Stream multiplexer stopped");
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drive one partition: forward its events, turn its terminal error into a
/// fault, and restart it if configured to.
async fn supervise(
    receiver: PartitionReceiver,
    mut cursor: Cursor,
    fan_in: mpsc::UnboundedSender<FeedItem>,
    restart_delay: Option<Duration>,
) {
    let partition_id = receiver.partition_id().to_string();

    loop {
        let ReceiverChannels {
            mut events,
            mut errors,
        } = match receiver.start_receiving(cursor.clone()) {
            Ok(channels) => channels,
            Err(err) => {
                let _ = fan_in.send(FeedItem::Fault(PartitionFault::new(&partition_id, err)));
                return;
            }
        };

        // Events are drained before the error so nothing sent ahead of the
        // failure is lost.
        let failure = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    cursor = Cursor::resume_after(&event);
                    if fan_in.send(FeedItem::from(event)).is_err() {
                        return;
                    }
                }
                Some(err) = errors.recv() => break Some(err),
                else => break None,
            }
        };

        let Some(err) = failure else {
            debug!(category = "stream", partition = %partition_id, "Receiver closed");
            return;
        };
        // The loop may still be finishing; clear it so a restart is accepted.
        receiver.stop();

        if fan_in
            .send(FeedItem::Fault(PartitionFault::new(&partition_id, err)))
            .is_err()
        {
            return;
        }

        let Some(delay) = restart_delay else {
            return;
        };
        warn!(
            category = "stream",
            partition = %partition_id,
            delay_secs = delay.as_secs(),
            "Restarting failed partition"
        );
        tokio::time::sleep(delay).await;
        if fan_in.is_closed() {
            return;
        }
    }
}
