//! Command dispatcher.
//!
//! Serializes corrective commands and hands them to the device-management
//! send channel. Dispatch is fire-and-forget: each command gets exactly one
//! send attempt on its own task, the outcome is logged and counted, and a
//! failure never blocks or retries anything.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hubsync_core::{DynServiceClient, Error, Result, SendReceipt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::command::Command;

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Send attempts
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    /// Last send error message
    pub last_error: Option<String>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// Sends commands through a [`ServiceClient`](hubsync_core::ServiceClient).
#[derive(Clone)]
pub struct CommandDispatcher {
    client: DynServiceClient,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl CommandDispatcher {
    pub fn new(client: DynServiceClient) -> Self {
        Self {
            client,
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    /// Open the send channel. Any failure is reported as a connection error.
    pub async fn open(&self) -> Result<()> {
        match self.client.open().await {
            Ok(()) => {
                info!(category = "dispatch", "Service client connected");
                Ok(())
            }
            Err(Error::Connection(message)) => Err(Error::Connection(message)),
            Err(other) => Err(Error::Connection(other.to_string())),
        }
    }

    /// Send one command and wait for the outcome.
    pub async fn send(&self, command: &Command) -> Result<SendReceipt> {
        let result = match command.encode() {
            Ok(message) => self.client.send(&command.device_id, message).await,
            Err(err) => Err(err),
        };
        self.record(command, &result);
        result
    }

    /// Send one command in the background.
    pub fn dispatch(&self, command: Command) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            // The outcome is already logged and counted.
            let _ = dispatcher.send(&command).await;
        })
    }

    /// Current counters.
    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().clone()
    }

    fn record(&self, command: &Command, result: &Result<SendReceipt>) {
        let mut stats = self.stats.lock();
        stats.commands_sent += 1;
        stats.last_sent_at = Some(Utc::now());
        match result {
            Ok(receipt) => {
                stats.commands_succeeded += 1;
                info!(
                    category = "dispatch",
                    device_id = %command.device_id,
                    message_id = %receipt.message_id,
                    "send status: {}",
                    receipt.status
                );
            }
            Err(err) => {
                stats.commands_failed += 1;
                stats.last_error = Some(err.to_string());
                match err {
                    Error::Serialization(_) => error!(
                        category = "dispatch",
                        device_id = %command.device_id,
                        error = %err,
                        "Failed to encode command"
                    ),
                    _ => warn!(
                        category = "dispatch",
                        device_id = %command.device_id,
                        command = %command.payload,
                        "send error: {}",
                        err
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hubsync_core::{OutboundMessage, ServiceClient};

    #[derive(Default)]
    struct RecordingClient {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ServiceClient for RecordingClient {
        async fn open(&self) -> Result<()> {
            if self.fail {
                Err(Error::Other("refused".into()))
            } else {
                Ok(())
            }
        }

        async fn send(&self, device_id: &str, message: OutboundMessage) -> Result<SendReceipt> {
            if self.fail {
                return Err(Error::Send("device offline".into()));
            }
            self.sent
                .lock()
                .push((device_id.to_string(), message.data_str().into_owned()));
            Ok(SendReceipt {
                message_id: message.message_id,
                status: "MessageEnqueued".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_send_records_success() {
        let client = Arc::new(RecordingClient::default());
        let dispatcher = CommandDispatcher::new(client.clone());

        dispatcher.send(&Command::switch("rpi2", "led", true)).await.unwrap();
        assert_eq!(client.sent.lock().as_slice(), [("rpi2".to_string(), "led:on".to_string())]);

        let stats = dispatcher.stats();
        assert_eq!(stats.commands_sent, 1);
        assert_eq!(stats.commands_succeeded, 1);
        assert!(stats.last_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_retried() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..Default::default()
        });
        let dispatcher = CommandDispatcher::new(client);

        dispatcher.dispatch(Command::text("edison", "x")).await.unwrap();
        dispatcher.dispatch(Command::text("edison", "y")).await.unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.commands_sent, 2);
        assert_eq!(stats.commands_failed, 2);
        assert!(stats.last_error.unwrap().contains("device offline"));
    }

    #[tokio::test]
    async fn test_open_failure_is_connection_error() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..Default::default()
        });
        let err = CommandDispatcher::new(client).open().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
