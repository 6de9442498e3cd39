//! Unified error handling for hubsync.
//!
//! This module provides the error type shared by every crate in the
//! workspace, so that failures from the stream, the desired-state store and
//! the dispatcher can be logged and matched the same way.

/// Unified error type for hubsync.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors (missing or malformed settings).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The management/send channel could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A partition receiver failed to attach or lost its link.
    #[error("Partition {partition} error: {message}")]
    Partition { partition: String, message: String },

    /// Reading or parsing the desired-state document failed.
    #[error("Desired state error: {0}")]
    DesiredState(String),

    /// Command delivery failed.
    #[error("Send error: {0}")]
    Send(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem errors.
    #[error("IO error: {0}")]
    Io(String),

    /// An operation did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Other errors.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Build a partition error.
    pub fn partition(partition: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Partition {
            partition: partition.into(),
            message: message.into(),
        }
    }

    /// Short category name, used as the `category` field in logs.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Connection(_) => "connection",
            Error::Partition { .. } => "stream",
            Error::DesiredState(_) => "desired_state",
            Error::Send(_) => "dispatch",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Timeout(_) => "timeout",
            Error::Other(_) => "other",
        }
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_error_display() {
        let err = Error::partition("3", "link detached");
        assert_eq!(err.to_string(), "Partition 3 error: link detached");
        assert_eq!(err.category(), "stream");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "expectedStates.json");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("expectedStates.json"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse.into();
        assert_eq!(err.category(), "serialization");
    }
}
