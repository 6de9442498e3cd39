//! Partitioned telemetry ingestion for hubsync.
//!
//! - [`client`]: the link seam to the partitioned event topic
//! - [`cursor`]: receiver starting points
//! - [`receiver`]: one retrying receiver per partition
//! - [`multiplexer`]: merged hot feed over all partitions
//! - [`memory`]: in-process hub used by tests and the simulator

pub mod client;
pub mod cursor;
pub mod memory;
pub mod multiplexer;
pub mod receiver;
pub mod retry;

pub use client::{
    AttachOptions, DynEventHubClient, EventHubClient, LinkError, LinkSession, RawMessage,
};
pub use cursor::Cursor;
pub use memory::{DeviceLink, MemoryHub};
pub use multiplexer::{MultiplexerConfig, StreamMultiplexer};
pub use receiver::{PartitionReceiver, ReceiverChannels, ReceiverConfig, SharedReceiver};
pub use retry::RetryPolicy;
