//! Process configuration.
//!
//! Sources, lowest priority first:
//! 1. compiled-in defaults
//! 2. `hubsync.toml` in the working directory, or the file given by `--config`
//! 3. environment variables

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hubsync_core::config::{defaults, env_vars};
use hubsync_core::ConnectionString;
use hubsync_reconcile::{DesiredStateConfig, RuleSetConfig};
use hubsync_stream::{memory, MultiplexerConfig, ReceiverConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Merged-feed settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerSection {
    pub feed_capacity: usize,
    pub restart_failed_partitions: bool,
    pub restart_delay_secs: u64,
}

impl Default for MultiplexerSection {
    fn default() -> Self {
        let defaults = MultiplexerConfig::default();
        Self {
            feed_capacity: defaults.feed_capacity,
            restart_failed_partitions: defaults.restart_failed_partitions,
            restart_delay_secs: defaults.restart_delay_secs,
        }
    }
}

/// In-process hub and simulated devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Partitions of the in-process hub
    pub partitions: usize,
    /// Seconds between simulated telemetry messages
    pub publish_interval_secs: u64,
    /// Messages the in-process hub keeps per partition
    pub retention: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            publish_interval_secs: 5,
            retention: memory::DEFAULT_RETENTION,
        }
    }
}

impl SimulatorConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSyncConfig {
    pub connection_string: String,
    pub event_path: String,
    pub consumer_group: String,
    pub desired_state_path: PathBuf,
    pub refresh_interval_secs: u64,
    pub receiver: ReceiverConfig,
    pub multiplexer: MultiplexerSection,
    pub simulator: SimulatorConfig,
    /// Extra rule sets keyed by device id
    pub devices: BTreeMap<String, RuleSetConfig>,
}

impl Default for HubSyncConfig {
    fn default() -> Self {
        Self {
            connection_string: defaults::CONNECTION_STRING_PLACEHOLDER.to_string(),
            event_path: defaults::EVENT_PATH.to_string(),
            consumer_group: defaults::CONSUMER_GROUP.to_string(),
            desired_state_path: PathBuf::from(defaults::DESIRED_STATE_PATH),
            refresh_interval_secs: defaults::REFRESH_INTERVAL_SECS,
            receiver: ReceiverConfig::default(),
            multiplexer: MultiplexerSection::default(),
            simulator: SimulatorConfig::default(),
            devices: BTreeMap::new(),
        }
    }
}

impl HubSyncConfig {
    /// Load from file and environment.
    ///
    /// An explicit `path` must exist; the default `hubsync.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(defaults::CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    info!(category = "config", "No {} found, using defaults", defaults::CONFIG_FILE);
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        info!(category = "config", "Loading config from: {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(env_vars::CONNECTION_STRING) {
            self.connection_string = value;
        }
        if let Some(value) = lookup(env_vars::DESIRED_STATE_PATH) {
            self.desired_state_path = PathBuf::from(value);
        }
        if let Some(value) = lookup(env_vars::CONSUMER_GROUP) {
            self.consumer_group = value;
        }
        if let Some(value) = lookup(env_vars::REFRESH_INTERVAL_SECS) {
            match value.parse() {
                Ok(secs) => self.refresh_interval_secs = secs,
                Err(_) => warn!(
                    category = "config",
                    value = %value,
                    "Ignoring invalid {}",
                    env_vars::REFRESH_INTERVAL_SECS
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be at least 1");
        }
        if self.multiplexer.feed_capacity == 0 {
            bail!("multiplexer.feed_capacity must be at least 1");
        }
        if self.simulator.partitions == 0 {
            bail!("simulator.partitions must be at least 1");
        }
        Ok(())
    }

    /// Parsed connection string. The placeholder is rejected.
    pub fn connection(&self) -> hubsync_core::Result<ConnectionString> {
        self.connection_string.parse()
    }

    pub fn desired_state(&self) -> DesiredStateConfig {
        DesiredStateConfig {
            path: self.desired_state_path.clone(),
            refresh_interval_secs: self.refresh_interval_secs,
        }
    }

    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            consumer_group: self.consumer_group.clone(),
            feed_capacity: self.multiplexer.feed_capacity,
            restart_failed_partitions: self.multiplexer.restart_failed_partitions,
            restart_delay_secs: self.multiplexer.restart_delay_secs,
            receiver: self.receiver.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HubSyncConfig::default();
        assert_eq!(config.event_path, "messages/events/");
        assert_eq!(config.consumer_group, "$Default");
        assert_eq!(config.desired_state_path, PathBuf::from("expectedStates.json"));
        assert_eq!(config.refresh_interval_secs, 5);
        assert_eq!(config.receiver.max_redirects, 3);
        assert_eq!(config.receiver.retry.max_attempts, 5);
        assert!(config.multiplexer.restart_failed_partitions);
        assert_eq!(config.simulator.retention, 4096);
        assert!(config.connection().is_err());
    }

    #[test]
    fn test_toml_sections() {
        let config = HubSyncConfig::from_toml(
            r#"
            connection_string = "HostName=h.example.net;SharedAccessKeyName=service;SharedAccessKey=k"
            refresh_interval_secs = 2

            [receiver]
            connect_timeout_secs = 3
            read_timeout_secs = 30

            [receiver.retry]
            max_attempts = 7

            [multiplexer]
            restart_failed_partitions = false

            [simulator]
            retention = 64

            [devices.lamp]
            rules = [
                { reported = "On", desired = "on", correction = { kind = "switch", key = "lamp" } },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.connection().unwrap().hub_name(), "h");
        assert_eq!(config.refresh_interval_secs, 2);
        assert_eq!(config.receiver.connect_timeout_secs, 3);
        assert_eq!(config.receiver.read_timeout_secs, Some(30));
        assert_eq!(config.receiver.retry.max_attempts, 7);
        assert_eq!(config.receiver.retry.initial_delay_ms, 200);
        assert!(!config.multiplexer_config().restart_failed_partitions);
        assert_eq!(config.simulator.retention, 64);
        assert_eq!(config.simulator.partitions, 4);
        assert_eq!(config.devices["lamp"].rules.len(), 1);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = HubSyncConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            (env_vars::CONNECTION_STRING, "HostName=a;SharedAccessKeyName=b;SharedAccessKey=c"),
            (env_vars::DESIRED_STATE_PATH, "/etc/hubsync/states.json"),
            (env_vars::REFRESH_INTERVAL_SECS, "not-a-number"),
        ]);
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert!(config.connection().is_ok());
        assert_eq!(config.desired_state().path, PathBuf::from("/etc/hubsync/states.json"));
        assert_eq!(config.refresh_interval_secs, 5);
    }

    #[test]
    fn test_from_file_and_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "refresh_interval_secs = 0").unwrap();

        let config = HubSyncConfig::from_file(file.path()).unwrap();
        assert!(config.validate().is_err());
        assert!(HubSyncConfig::from_file(Path::new("/nonexistent/hubsync.toml")).is_err());
    }
}
