//! Shared configuration defaults.
//!
//! Constants and environment variable names used across the workspace, plus
//! the service connection string.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    /// Placeholder used when no connection string is configured.
    pub const CONNECTION_STRING_PLACEHOLDER: &str = "<IOT_HUB_CONNECTION_STRING_GOES_HERE>";
    /// Event path of the built-in events endpoint.
    pub const EVENT_PATH: &str = "messages/events/";
    /// Consumer group used by the receivers.
    pub const CONSUMER_GROUP: &str = "$Default";
    /// Desired-state document polled by the refresh loop.
    pub const DESIRED_STATE_PATH: &str = "expectedStates.json";
    /// Seconds between desired-state refreshes.
    pub const REFRESH_INTERVAL_SECS: u64 = 5;
    /// Configuration file looked up in the working directory.
    pub const CONFIG_FILE: &str = "hubsync.toml";
}

/// Environment variable names.
pub mod env_vars {
    pub const CONNECTION_STRING: &str = "IOTHUB_CONNECTION_STRING";
    pub const DESIRED_STATE_PATH: &str = "HUBSYNC_DESIRED_STATE_PATH";
    pub const REFRESH_INTERVAL_SECS: &str = "HUBSYNC_REFRESH_INTERVAL_SECS";
    pub const CONSUMER_GROUP: &str = "HUBSYNC_CONSUMER_GROUP";
    pub const LOG_JSON: &str = "HUBSYNC_LOG_JSON";
}

/// Parsed service connection string.
///
/// Format: `HostName=<host>;SharedAccessKeyName=<name>;SharedAccessKey=<key>`
/// with optional `DeviceId` and `EntityPath` segments.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub shared_access_key_name: String,
    pub shared_access_key: String,
    pub device_id: Option<String>,
    pub entity_path: Option<String>,
}

impl ConnectionString {
    /// Hub name: the first label of the host name.
    pub fn hub_name(&self) -> &str {
        self.host_name
            .split('.')
            .next()
            .unwrap_or(&self.host_name)
    }
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == defaults::CONNECTION_STRING_PLACEHOLDER {
            return Err(Error::Config(format!(
                "connection string not set (export {})",
                env_vars::CONNECTION_STRING
            )));
        }

        let mut parts: HashMap<&str, &str> = HashMap::new();
        for segment in s.split(';').filter(|seg| !seg.trim().is_empty()) {
            // Keys may end in '=' padding, so split on the first '=' only.
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                Error::Config(format!("malformed connection string segment: {}", segment))
            })?;
            parts.insert(key.trim(), value.trim());
        }

        let required = |key: &str| -> Result<String> {
            parts
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .ok_or_else(|| Error::Config(format!("connection string is missing {}", key)))
        };

        Ok(Self {
            host_name: required("HostName")?,
            shared_access_key_name: required("SharedAccessKeyName")?,
            shared_access_key: required("SharedAccessKey")?,
            device_id: parts.get("DeviceId").map(|v| v.to_string()),
            entity_path: parts.get("EntityPath").map(|v| v.to_string()),
        })
    }
}

// Keep the key out of logs.
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("shared_access_key", &"***")
            .field("device_id", &self.device_id)
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

/// Read the connection string from the environment, falling back to the
/// placeholder.
pub fn connection_string_from_env() -> String {
    std::env::var(env_vars::CONNECTION_STRING)
        .unwrap_or_else(|_| defaults::CONNECTION_STRING_PLACEHOLDER.to_string())
}
