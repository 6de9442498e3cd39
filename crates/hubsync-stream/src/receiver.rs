//! Partition receiver.
//!
//! A [`PartitionReceiver`] owns the link to exactly one partition. Once
//! started it runs a receive loop that:
//!
//! - attaches with the current cursor, bounded by the connect timeout;
//! - follows redirects to a new endpoint, up to `max_redirects` in a row;
//! - retries retryable failures with exponential backoff;
//! - re-attaches after a mid-stream link failure, resuming right after the
//!   last delivered event so nothing is replayed;
//! - surfaces an error only once retries are exhausted or the failure is not
//!   retryable.
//!
//! Events and errors come out of two separate channels.

use std::sync::Arc;
use std::time::Duration;

use hubsync_core::{Error, Result, TelemetryEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{AttachOptions, DynEventHubClient, LinkError, LinkSession};
use crate::cursor::Cursor;
use crate::retry::RetryPolicy;

/// Receiver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Timeout for a single attach attempt
    pub connect_timeout_secs: u64,
    /// Re-attach when no message arrives for this long (disabled when unset)
    pub read_timeout_secs: Option<u64>,
    /// Maximum consecutive redirects before giving up
    pub max_redirects: u32,
    /// Backoff for retryable failures
    pub retry: RetryPolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: None,
            max_redirects: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl ReceiverConfig {
    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }
}

/// Output channels of a started receiver.
pub struct ReceiverChannels {
    /// Decoded events, in partition order
    pub events: mpsc::UnboundedReceiver<TelemetryEvent>,
    /// Terminal errors (at most one per start)
    pub errors: mpsc::UnboundedReceiver<Error>,
}

/// Receiver bound to one partition.
pub struct PartitionReceiver {
    client: DynEventHubClient,
    partition_id: String,
    endpoint: String,
    config: ReceiverConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionReceiver {
    /// Create a receiver for `partition_id` in `consumer_group`.
    pub fn new(
        client: DynEventHubClient,
        consumer_group: &str,
        partition_id: impl Into<String>,
        config: ReceiverConfig,
    ) -> Self {
        let partition_id = partition_id.into();
        let endpoint = client.partition_endpoint(consumer_group, &partition_id);
        Self {
            client,
            partition_id,
            endpoint,
            config,
            task: Mutex::new(None),
        }
    }

    /// Partition this receiver reads.
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Initial link address.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the receive loop is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start receiving from `cursor`.
    ///
    /// Returns the event and error channels. Attach failures do not make this
    /// call fail; they arrive on the error channel after retries run out.
    /// Starting a receiver that is already running is an error.
    pub fn start_receiving(&self, cursor: Cursor) -> Result<ReceiverChannels> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(Error::partition(&self.partition_id, "already receiving"));
        }

        info!(
            category = "stream",
            partition = %self.partition_id,
            endpoint = %self.endpoint,
            "Listening on endpoint {} {}",
            self.endpoint,
            cursor
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();

        let receive_loop = ReceiveLoop {
            client: self.client.clone(),
            partition_id: self.partition_id.clone(),
            endpoint: self.endpoint.clone(),
            config: self.config.clone(),
            events_tx,
        };
        let partition_id = self.partition_id.clone();
        *task = Some(tokio::spawn(async move {
            if let Err(err) = receive_loop.run(cursor).await {
                warn!(category = "stream", partition = %partition_id, error = %err, "Receiver stopped");
                let _ = errors_tx.send(err);
            }
        }));

        Ok(ReceiverChannels { events, errors })
    }

    /// Start receiving from a stored offset.
    pub fn start_receiving_from_offset(&self, offset: impl Into<String>) -> Result<ReceiverChannels> {
        self.start_receiving(Cursor::from_offset(offset))
    }

    /// Stop the receive loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PartitionReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared receiver handle.
pub type SharedReceiver = Arc<PartitionReceiver>;

/// How a pumped session ended.
enum PumpExit {
    /// Nobody listens to the events any more
    ConsumerGone,
    /// The link failed or closed
    Link(LinkError),
}

struct ReceiveLoop {
    client: DynEventHubClient,
    partition_id: String,
    endpoint: String,
    config: ReceiverConfig,
    events_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl ReceiveLoop {
    /// Run until the consumer goes away (`Ok`) or the receiver gives up (`Err`).
    async fn run(self, mut cursor: Cursor) -> Result<()> {
        let mut endpoint = self.endpoint.clone();
        let mut failures: u32 = 0;
        let mut redirects: u32 = 0;

        loop {
            let options = AttachOptions {
                endpoint: endpoint.clone(),
                cursor: cursor.clone(),
            };

            let error = match self.attach(&options).await {
                Ok(mut session) => {
                    debug!(
                        category = "stream",
                        partition = %self.partition_id,
                        endpoint = %endpoint,
                        "Receiver started"
                    );
                    let (delivered, exit) = self.pump(session.as_mut(), &mut cursor).await;
                    // A link that drops before delivering keeps counting.
                    if delivered > 0 {
                        failures = 0;
                        redirects = 0;
                    }
                    match exit {
                        PumpExit::ConsumerGone => return Ok(()),
                        PumpExit::Link(err) => err,
                    }
                }
                Err(err) => err,
            };

            if let Some(target) = error.redirect_target() {
                redirects += 1;
                if redirects > self.config.max_redirects {
                    return Err(Error::partition(
                        &self.partition_id,
                        format!("too many redirects (last to {})", target),
                    ));
                }
                info!(
                    category = "stream",
                    partition = %self.partition_id,
                    endpoint = %target,
                    "Following redirect"
                );
                endpoint = target.to_string();
                continue;
            }

            if !error.is_retryable() {
                return Err(Error::partition(&self.partition_id, error.to_string()));
            }

            failures += 1;
            if !self.config.retry.allows(failures) {
                return Err(Error::partition(
                    &self.partition_id,
                    format!("retries exhausted after {} attempts: {}", failures, error),
                ));
            }

            let delay = self.config.retry.delay_for_attempt(failures);
            warn!(
                category = "stream",
                partition = %self.partition_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Link failed, retrying"
            );
            tokio::time::sleep(delay).await;

            if self.events_tx.is_closed() {
                return Ok(());
            }
        }
    }

    async fn attach(&self, options: &AttachOptions) -> std::result::Result<Box<dyn LinkSession>, LinkError> {
        match tokio::time::timeout(self.config.connect_timeout(), self.client.attach(options)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(format!(
                "attach to {} took longer than {}s",
                options.endpoint, self.config.connect_timeout_secs
            ))),
        }
    }

    /// Forward messages until the link fails. Advances `cursor` past every
    /// delivered event and returns how many were delivered.
    async fn pump(&self, session: &mut dyn LinkSession, cursor: &mut Cursor) -> (u64, PumpExit) {
        let mut delivered = 0;
        loop {
            let next = match self.config.read_timeout() {
                Some(limit) => match tokio::time::timeout(limit, session.next_message()).await {
                    Ok(next) => next,
                    Err(_) => Some(Err(LinkError::Timeout(format!(
                        "no message within {}s",
                        limit.as_secs()
                    )))),
                },
                None => session.next_message().await,
            };

            match next {
                Some(Ok(message)) => {
                    let event =
                        TelemetryEvent::from_raw(&self.partition_id, &message.body, message.annotations);
                    *cursor = Cursor::resume_after(&event);
                    if self.events_tx.send(event).is_err() {
                        return (delivered, PumpExit::ConsumerGone);
                    }
                    delivered += 1;
                }
                Some(Err(err)) => return (delivered, PumpExit::Link(err)),
                None => return (delivered, PumpExit::Link(LinkError::Closed)),
            }
        }
    }
}
