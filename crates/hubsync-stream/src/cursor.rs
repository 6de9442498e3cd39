//! Partition cursors.
//!
//! A cursor is the starting point of a receive link: either "everything
//! enqueued after this instant" or "everything from this offset".

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use hubsync_core::TelemetryEvent;

/// Starting point for a partition receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Messages enqueued strictly after this instant.
    ///
    /// Carries a server-side selector, so re-attaching with the same cursor
    /// never replays older messages.
    EnqueuedAfter(DateTime<Utc>),
    /// Messages from a stored offset on. No selector is sent.
    Offset {
        offset: String,
        /// Whether the message at `offset` itself is included
        inclusive: bool,
    },
}

impl Cursor {
    /// Cursor for "from this instant forward".
    pub fn now() -> Self {
        Cursor::EnqueuedAfter(Utc::now())
    }

    /// Cursor starting at a stored offset, inclusive.
    pub fn from_offset(offset: impl Into<String>) -> Self {
        Cursor::Offset {
            offset: offset.into(),
            inclusive: true,
        }
    }

    /// Cursor that resumes right after `event` without replaying it.
    ///
    /// Prefers the event's offset, which is exact. Without one it falls back
    /// to a strict enqueued-time cursor, which is only millisecond precise:
    /// other messages enqueued in the same millisecond are skipped, and so
    /// is anything pending when the event had no enqueued-time annotation
    /// (decoding then stamps it with the local clock).
    pub fn resume_after(event: &TelemetryEvent) -> Self {
        match event.offset() {
            Some(offset) => Cursor::Offset {
                offset,
                inclusive: false,
            },
            None => Cursor::EnqueuedAfter(event.enqueued_time),
        }
    }

    /// Selector filter string sent with the attach, if any.
    pub fn selector_filter(&self) -> Option<String> {
        match self {
            Cursor::EnqueuedAfter(instant) => Some(format!(
                "amqp.annotation.x-opt-enqueuedtimeutc > {}",
                instant.timestamp_millis()
            )),
            Cursor::Offset { .. } => None,
        }
    }

    /// Whether a message at `enqueued_time`/`offset` passes this cursor.
    pub fn admits(&self, enqueued_time: &DateTime<Utc>, offset: &str) -> bool {
        match self {
            Cursor::EnqueuedAfter(instant) => enqueued_time > instant,
            Cursor::Offset {
                offset: start,
                inclusive,
            } => match compare_offsets(offset, start) {
                Ordering::Greater => true,
                Ordering::Equal => *inclusive,
                Ordering::Less => false,
            },
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::EnqueuedAfter(instant) => write!(f, "start time: {}", instant.timestamp_millis()),
            Cursor::Offset { offset, inclusive } => {
                let bound = if *inclusive { ">=" } else { ">" };
                write!(f, "start offset: {} {}", bound, offset)
            }
        }
    }
}

// Offsets are numeric strings; compare numerically when both parse.
fn compare_offsets(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
