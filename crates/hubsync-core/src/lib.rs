//! Core types for hubsync.
//!
//! This crate defines the pieces shared by the stream and reconciliation
//! crates: the error type, the telemetry event model, the hot event feed and
//! the device-management service seam.

pub mod config;
pub mod error;
pub mod event;
pub mod feed;
pub mod service;

pub use config::ConnectionString;
pub use error::{Error, Result};
pub use event::{EventBody, TelemetryEvent};
pub use feed::{
    ConnectableFeed, EventFeed, FeedItem, FeedReceiver, FilteredReceiver, PartitionFault,
    SharedFeed, DEFAULT_FEED_CAPACITY,
};
pub use service::{DynServiceClient, OutboundMessage, SendReceipt, ServiceClient};
