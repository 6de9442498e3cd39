//! In-process hub.
//!
//! `MemoryHub` implements both sides of the service in memory: the
//! partitioned event topic ([`EventHubClient`]) and the device-management
//! send channel ([`ServiceClient`]). Each partition retains a bounded window
//! of recent messages, so cursors behave like they do against the real
//! service within that window. Discovery, attach, link and send failures can
//! be injected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hubsync_core::event::properties;
use hubsync_core::{Error, OutboundMessage, Result, SendReceipt, ServiceClient};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};

use crate::client::{
    partition_from_endpoint, AttachOptions, EventHubClient, LinkError, LinkSession, RawMessage,
};
use crate::cursor::Cursor;

/// Messages kept per partition before the oldest are dropped.
pub const DEFAULT_RETENTION: usize = 4096;

struct StoredMessage {
    body: Vec<u8>,
    annotations: Map<String, Value>,
    enqueued_time: DateTime<Utc>,
    offset: String,
}

type KillSwitch = Arc<Mutex<Option<LinkError>>>;

/// Retained window of a partition. `base` is the sequence number of the
/// front message.
struct Retained {
    base: u64,
    messages: VecDeque<StoredMessage>,
}

impl Retained {
    fn next_sequence(&self) -> u64 {
        self.base + self.messages.len() as u64
    }

    /// First sequence number the cursor can admit.
    fn start_for(&self, cursor: &Cursor) -> u64 {
        match cursor {
            Cursor::Offset { offset, inclusive } => match offset.parse::<u64>() {
                Ok(offset) if *inclusive => offset.max(self.base),
                Ok(offset) => offset.saturating_add(1).max(self.base),
                Err(_) => self.base,
            },
            Cursor::EnqueuedAfter(instant) => {
                let skipped = self
                    .messages
                    .partition_point(|message| message.enqueued_time <= *instant);
                self.base + skipped as u64
            }
        }
    }
}

struct PartitionLog {
    retained: Mutex<Retained>,
    retention: usize,
    version: watch::Sender<u64>,
    sessions: Mutex<Vec<Weak<Mutex<Option<LinkError>>>>>,
}

impl PartitionLog {
    fn new(retention: usize) -> Self {
        Self {
            retained: Mutex::new(Retained {
                base: 0,
                messages: VecDeque::new(),
            }),
            retention: retention.max(1),
            version: watch::channel(0).0,
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn append(&self, partition_id: &str, body: Vec<u8>, mut annotations: Map<String, Value>) -> String {
        let enqueued_time = Utc::now();
        let offset = {
            let mut retained = self.retained.lock();
            let sequence = retained.next_sequence();
            let offset = sequence.to_string();
            annotations.insert(
                properties::ENQUEUED_TIME.to_string(),
                json!(enqueued_time.timestamp_millis()),
            );
            annotations.insert(properties::OFFSET.to_string(), json!(offset));
            annotations.insert(properties::SEQUENCE_NUMBER.to_string(), json!(sequence));
            annotations.insert("x-opt-partition-id".to_string(), json!(partition_id));
            retained.messages.push_back(StoredMessage {
                body,
                annotations,
                enqueued_time,
                offset: offset.clone(),
            });
            while retained.messages.len() > self.retention {
                retained.messages.pop_front();
                retained.base += 1;
            }
            offset
        };
        self.version.send_modify(|v| *v += 1);
        offset
    }

    /// Next message at or after sequence `position` that the cursor admits.
    /// An unset position starts at the cursor's first admissible message.
    fn scan(&self, position: &mut Option<u64>, cursor: &Cursor) -> Option<RawMessage> {
        let retained = self.retained.lock();
        let mut next = match *position {
            Some(next) => next.max(retained.base),
            None => retained.start_for(cursor),
        };
        let mut found = None;
        while let Some(message) = retained.messages.get((next - retained.base) as usize) {
            next += 1;
            if cursor.admits(&message.enqueued_time, &message.offset) {
                found = Some(RawMessage {
                    body: message.body.clone(),
                    annotations: message.annotations.clone(),
                });
                break;
            }
        }
        *position = Some(next);
        found
    }

    fn len(&self) -> usize {
        self.retained.lock().messages.len()
    }

    fn register(&self) -> KillSwitch {
        let switch: KillSwitch = Arc::new(Mutex::new(None));
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&switch));
        switch
    }

    fn break_sessions(&self, error: &LinkError) -> usize {
        let mut broken = 0;
        for session in self.sessions.lock().iter().filter_map(Weak::upgrade) {
            *session.lock() = Some(error.clone());
            broken += 1;
        }
        self.version.send_modify(|_| {});
        broken
    }
}

struct MemorySession {
    log: Arc<PartitionLog>,
    cursor: Cursor,
    position: Option<u64>,
    version: watch::Receiver<u64>,
    kill: KillSwitch,
}

#[async_trait]
impl LinkSession for MemorySession {
    async fn next_message(&mut self) -> Option<std::result::Result<RawMessage, LinkError>> {
        loop {
            let killed = self.kill.lock().take();
            if let Some(err) = killed {
                return Some(Err(err));
            }
            self.version.borrow_and_update();
            if let Some(message) = self.log.scan(&mut self.position, &self.cursor) {
                return Some(Ok(message));
            }
            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }
}

struct HubInner {
    event_path: String,
    partition_ids: Vec<String>,
    partitions: DashMap<String, Arc<PartitionLog>>,
    discovery_fault: Mutex<Option<LinkError>>,
    attach_faults: DashMap<String, VecDeque<LinkError>>,
    attach_counts: DashMap<String, u64>,
    open_fault: Mutex<Option<Error>>,
    opened: AtomicBool,
    send_failures: AtomicU32,
    sends: AtomicU64,
    devices: DashMap<String, mpsc::UnboundedSender<OutboundMessage>>,
    record_sent: AtomicBool,
    sent: Mutex<Vec<(String, OutboundMessage)>>,
}

/// In-memory partitioned topic and device-management channel.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create a hub with `partition_count` partitions named `"0"`, `"1"`, ...
    pub fn new(partition_count: usize) -> Self {
        Self::with_event_path(partition_count, hubsync_core::config::defaults::EVENT_PATH)
    }

    /// Create a hub with a custom event path.
    pub fn with_event_path(partition_count: usize, event_path: impl Into<String>) -> Self {
        Self::with_retention(partition_count, event_path, DEFAULT_RETENTION)
    }

    /// Create a hub that keeps at most `retention` messages per partition.
    pub fn with_retention(
        partition_count: usize,
        event_path: impl Into<String>,
        retention: usize,
    ) -> Self {
        let partition_ids: Vec<String> = (0..partition_count.max(1)).map(|i| i.to_string()).collect();
        let partitions = DashMap::new();
        for id in &partition_ids {
            partitions.insert(id.clone(), Arc::new(PartitionLog::new(retention)));
        }
        Self {
            inner: Arc::new(HubInner {
                event_path: event_path.into(),
                partition_ids,
                partitions,
                discovery_fault: Mutex::new(None),
                attach_faults: DashMap::new(),
                attach_counts: DashMap::new(),
                open_fault: Mutex::new(None),
                opened: AtomicBool::new(false),
                send_failures: AtomicU32::new(0),
                sends: AtomicU64::new(0),
                devices: DashMap::new(),
                record_sent: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    fn log(&self, partition_id: &str) -> Option<Arc<PartitionLog>> {
        self.inner.partitions.get(partition_id).map(|entry| entry.value().clone())
    }

    /// Partition a device's telemetry is routed to.
    pub fn partition_for(&self, device_id: &str) -> &str {
        let hash = device_id
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        let index = hash as usize % self.inner.partition_ids.len();
        &self.inner.partition_ids[index]
    }

    /// Append a message to a partition. Returns its offset.
    pub fn publish(
        &self,
        partition_id: &str,
        device_id: Option<&str>,
        body: impl Into<Vec<u8>>,
    ) -> Result<String> {
        let log = self
            .log(partition_id)
            .ok_or_else(|| Error::partition(partition_id, "no such partition"))?;
        let mut annotations = Map::new();
        if let Some(device_id) = device_id {
            annotations.insert(properties::CONNECTION_DEVICE_ID.to_string(), json!(device_id));
        }
        Ok(log.append(partition_id, body.into(), annotations))
    }

    /// Publish device telemetry on the device's partition.
    pub fn publish_from_device(&self, device_id: &str, body: impl Into<Vec<u8>>) -> Result<String> {
        let partition_id = self.partition_for(device_id).to_string();
        self.publish(&partition_id, Some(device_id), body)
    }

    /// Make the next partition discovery fail.
    pub fn fail_discovery(&self, error: LinkError) {
        *self.inner.discovery_fault.lock() = Some(error);
    }

    /// Queue a failure for the next attach to `partition_id`.
    pub fn fail_attach(&self, partition_id: &str, error: LinkError) {
        self.inner
            .attach_faults
            .entry(partition_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Break every live link on a partition. Returns how many were broken.
    pub fn break_links(&self, partition_id: &str, error: LinkError) -> usize {
        self.log(partition_id)
            .map(|log| log.break_sessions(&error))
            .unwrap_or(0)
    }

    /// Number of attach attempts seen for a partition.
    pub fn attach_count(&self, partition_id: &str) -> u64 {
        self.inner
            .attach_counts
            .get(partition_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Make `open` fail with `error`.
    pub fn fail_open(&self, error: Error) {
        *self.inner.open_fault.lock() = Some(error);
    }

    /// Make the next `count` sends fail.
    pub fn fail_sends(&self, count: u32) {
        self.inner.send_failures.store(count, Ordering::SeqCst);
    }

    /// Number of messages currently retained on a partition.
    pub fn retained(&self, partition_id: &str) -> usize {
        self.log(partition_id).map(|log| log.len()).unwrap_or(0)
    }

    /// Start keeping a copy of every accepted send for [`sent_messages`](Self::sent_messages).
    pub fn record_sends(&self) {
        self.inner.record_sent.store(true, Ordering::SeqCst);
    }

    /// Messages accepted by `send` since [`record_sends`](Self::record_sends), in order.
    pub fn sent_messages(&self) -> Vec<(String, OutboundMessage)> {
        self.inner.sent.lock().clone()
    }

    /// Number of send attempts, including failed ones.
    pub fn send_attempts(&self) -> u64 {
        self.inner.sends.load(Ordering::SeqCst)
    }

    /// Connect a device so it receives the messages sent to it.
    pub fn connect_device(&self, device_id: impl Into<String>) -> DeviceLink {
        let device_id = device_id.into();
        let (tx, commands) = mpsc::unbounded_channel();
        self.inner.devices.insert(device_id.clone(), tx);
        DeviceLink {
            device_id,
            hub: self.clone(),
            commands,
        }
    }
}

#[async_trait]
impl EventHubClient for MemoryHub {
    fn event_path(&self) -> &str {
        &self.inner.event_path
    }

    async fn partition_ids(&self) -> std::result::Result<Vec<String>, LinkError> {
        let fault = self.inner.discovery_fault.lock().take();
        match fault {
            Some(err) => Err(err),
            None => Ok(self.inner.partition_ids.clone()),
        }
    }

    async fn attach(
        &self,
        options: &AttachOptions,
    ) -> std::result::Result<Box<dyn LinkSession>, LinkError> {
        let partition_id = partition_from_endpoint(&options.endpoint)
            .ok_or_else(|| LinkError::NotFound(options.endpoint.clone()))?
            .to_string();
        *self
            .inner
            .attach_counts
            .entry(partition_id.clone())
            .or_insert(0) += 1;

        let fault = self
            .inner
            .attach_faults
            .get_mut(&partition_id)
            .and_then(|mut queue| queue.pop_front());
        if let Some(err) = fault {
            return Err(err);
        }

        let log = self
            .log(&partition_id)
            .ok_or_else(|| LinkError::NotFound(options.endpoint.clone()))?;
        let kill = log.register();
        let version = log.version.subscribe();
        Ok(Box::new(MemorySession {
            log,
            cursor: options.cursor.clone(),
            position: None,
            version,
            kill,
        }))
    }
}

#[async_trait]
impl ServiceClient for MemoryHub {
    async fn open(&self) -> Result<()> {
        if let Some(err) = self.inner.open_fault.lock().clone() {
            return Err(err);
        }
        self.inner.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, device_id: &str, message: OutboundMessage) -> Result<SendReceipt> {
        self.inner.sends.fetch_add(1, Ordering::SeqCst);
        if !self.inner.opened.load(Ordering::SeqCst) {
            return Err(Error::Connection("service client is not open".to_string()));
        }
        let injected = self
            .inner
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Send(format!("delivery to {} rejected", device_id)));
        }

        let receipt = SendReceipt {
            message_id: message.message_id.clone(),
            status: "MessageEnqueued".to_string(),
        };
        if self.inner.record_sent.load(Ordering::SeqCst) {
            self.inner.sent.lock().push((device_id.to_string(), message.clone()));
        }

        let disconnected = match self.inner.devices.get(device_id) {
            Some(device) => device.send(message).is_err(),
            None => false,
        };
        if disconnected {
            self.inner.devices.remove(device_id);
        }
        Ok(receipt)
    }
}

/// Device-side handle: publishes telemetry and receives messages.
pub struct DeviceLink {
    device_id: String,
    hub: MemoryHub,
    commands: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl DeviceLink {
    /// Device id of this link.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Publish a telemetry body. Returns its offset.
    pub fn send_event(&self, body: impl Into<Vec<u8>>) -> Result<String> {
        self.hub.publish_from_device(&self.device_id, body)
    }

    /// Wait for the next message sent to this device.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.commands.recv().await
    }

    /// Take a pending message without waiting.
    pub fn try_recv(&mut self) -> Option<OutboundMessage> {
        self.commands.try_recv().ok()
    }
}
