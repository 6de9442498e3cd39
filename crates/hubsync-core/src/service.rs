//! Device-management service seam.
//!
//! The service client is the outbound half of the system: it opens the
//! management channel once at startup and sends cloud-to-device messages.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A cloud-to-device message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Unique message id
    pub message_id: String,
    /// Payload bytes, already serialized by the caller
    pub data: Vec<u8>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Create a message with a fresh id.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            data: data.into(),
            created_at: Utc::now(),
        }
    }

    /// The payload as text, for logs.
    pub fn data_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Id of the message that was accepted
    pub message_id: String,
    /// Status reported by the service
    pub status: String,
}

/// Client for the device-management send channel.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Open the management channel.
    ///
    /// A failure here is fatal to startup.
    async fn open(&self) -> Result<()>;

    /// Send one message to a device.
    async fn send(&self, device_id: &str, message: OutboundMessage) -> Result<SendReceipt>;
}

/// Shared service client handle.
pub type DynServiceClient = Arc<dyn ServiceClient>;
