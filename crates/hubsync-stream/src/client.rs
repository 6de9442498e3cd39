//! Transport seam for the partitioned event stream.
//!
//! An [`EventHubClient`] knows how to list the partitions of a topic and how
//! to attach a link to one of them. Everything above this module is
//! transport-agnostic.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cursor::Cursor;

/// A message as it comes off the wire.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Undecoded body
    pub body: Vec<u8>,
    /// Message annotations (system properties)
    pub annotations: Map<String, Value>,
}

/// Link-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Transient link failure: {0}")]
    Transient(String),

    #[error("Link timed out: {0}")]
    Timeout(String),

    #[error("Link closed by the service")]
    Closed,

    /// The service asked the client to attach somewhere else.
    #[error("Redirected to {endpoint}")]
    Redirect { endpoint: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl LinkError {
    /// Whether attaching again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Transient(_) | LinkError::Timeout(_) | LinkError::Closed
        )
    }

    /// Target endpoint of a redirect.
    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            LinkError::Redirect { endpoint } => Some(endpoint),
            _ => None,
        }
    }
}

/// Options for one attach attempt.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Link source address
    pub endpoint: String,
    /// Starting point of the link
    pub cursor: Cursor,
}

impl AttachOptions {
    /// Server-side selector for this attach, if the cursor has one.
    pub fn selector_filter(&self) -> Option<String> {
        self.cursor.selector_filter()
    }
}

/// An attached receive link.
#[async_trait]
pub trait LinkSession: Send {
    /// Wait for the next message.
    ///
    /// Returns `None` when the link ended without an error.
    async fn next_message(&mut self) -> Option<Result<RawMessage, LinkError>>;
}

/// Client for a partitioned topic.
#[async_trait]
pub trait EventHubClient: Send + Sync {
    /// Event path of the topic, e.g. `messages/events/`.
    fn event_path(&self) -> &str;

    /// Query the current partition id set.
    async fn partition_ids(&self) -> Result<Vec<String>, LinkError>;

    /// Attach a receive link.
    async fn attach(&self, options: &AttachOptions) -> Result<Box<dyn LinkSession>, LinkError>;

    /// Link address of a partition for a consumer group.
    fn partition_endpoint(&self, consumer_group: &str, partition_id: &str) -> String {
        let path = self.event_path().trim_end_matches('/');
        format!("{}/ConsumerGroups/{}/Partitions/{}", path, consumer_group, partition_id)
    }
}

/// Shared client handle.
pub type DynEventHubClient = Arc<dyn EventHubClient>;

/// Extract the partition id from a partition endpoint address.
pub fn partition_from_endpoint(endpoint: &str) -> Option<&str> {
    endpoint
        .rsplit_once("/Partitions/")
        .map(|(_, id)| id.trim_end_matches('/'))
        .filter(|id| !id.is_empty())
}
