//! Desired-state store.
//!
//! The store holds one immutable [`DesiredSnapshot`] behind an [`ArcSwap`].
//! A single refresh task re-reads the desired-state document on a fixed
//! interval and swaps in a freshly parsed snapshot; readers load whichever
//! snapshot is current and never see a partial document. When a read or
//! parse fails the current snapshot stays in place.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hubsync_core::config::defaults;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Desired-state failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Failed to read {source_name}: {message}")]
    Read { source_name: String, message: String },

    #[error("Invalid desired-state JSON: {0}")]
    Parse(String),

    /// The document parsed but is not a map of device id to attribute map.
    #[error("Invalid desired-state document: {0}")]
    Shape(String),
}

impl From<StateError> for hubsync_core::Error {
    fn from(err: StateError) -> Self {
        hubsync_core::Error::DesiredState(err.to_string())
    }
}

/// Attribute name to desired value.
pub type Attributes = BTreeMap<String, Value>;

/// Desired attributes of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub device_id: String,
    pub attributes: Attributes,
}

impl DesiredState {
    pub fn new(device_id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            device_id: device_id.into(),
            attributes,
        }
    }

    /// Desired value of an attribute.
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }
}

/// A complete desired-state mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredSnapshot {
    devices: HashMap<String, DesiredState>,
    loaded_at: DateTime<Utc>,
}

impl DesiredSnapshot {
    /// Build a snapshot from device states.
    pub fn new(states: impl IntoIterator<Item = DesiredState>) -> Self {
        Self {
            devices: states
                .into_iter()
                .map(|state| (state.device_id.clone(), state))
                .collect(),
            loaded_at: Utc::now(),
        }
    }

    /// Parse a desired-state document.
    ///
    /// The document is a JSON object mapping device id to an object of
    /// attribute values, e.g. `{"rpi2":{"Led":false,"LcdText":"RPi2"}}`.
    pub fn parse(text: &str) -> Result<Self, StateError> {
        let document: Value =
            serde_json::from_str(text).map_err(|e| StateError::Parse(e.to_string()))?;
        let Value::Object(devices) = document else {
            return Err(StateError::Shape("top level must be an object".to_string()));
        };

        let mut states = Vec::with_capacity(devices.len());
        for (device_id, attributes) in devices {
            let Value::Object(attributes) = attributes else {
                return Err(StateError::Shape(format!(
                    "entry for '{}' must be an object",
                    device_id
                )));
            };
            states.push(DesiredState::new(device_id, attributes.into_iter().collect()));
        }
        Ok(Self::new(states))
    }

    /// The compiled-in defaults for the reference devices.
    pub fn builtin() -> Self {
        fn attrs<const N: usize>(pairs: [(&str, Value); N]) -> Attributes {
            pairs
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect()
        }

        Self::new([
            DesiredState::new(
                "huzzah",
                attrs([("led1", Value::Bool(true)), ("led2", Value::Bool(false))]),
            ),
            DesiredState::new(
                "rpi2",
                attrs([("Led", Value::Bool(false)), ("LcdText", Value::from("RPi2"))]),
            ),
            DesiredState::new(
                "edison",
                attrs([
                    ("greenLed", Value::Bool(false)),
                    ("redLed", Value::Bool(true)),
                    ("lcdText", Value::from("Edison")),
                ]),
            ),
        ])
    }

    /// State of one device.
    pub fn get(&self, device_id: &str) -> Option<&DesiredState> {
        self.devices.get(device_id)
    }

    /// Device ids, sorted.
    pub fn device_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.devices.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// When this snapshot was built.
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Render the snapshot back into document form.
    pub fn to_json(&self) -> Value {
        let devices: serde_json::Map<String, Value> = self
            .device_ids()
            .into_iter()
            .filter_map(|id| self.devices.get(id))
            .map(|state| {
                let attributes = state
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (state.device_id.clone(), Value::Object(attributes))
            })
            .collect();
        Value::Object(devices)
    }
}

/// Where the desired-state document comes from.
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> String;

    /// Read the raw document.
    async fn load(&self) -> Result<String, StateError>;
}

/// Desired-state document on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateSource for FileSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<String, StateError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StateError::Read {
                source_name: self.name(),
                message: e.to_string(),
            })
    }
}

/// Desired-state settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredStateConfig {
    /// Document polled by the refresh loop
    pub path: PathBuf,
    /// Seconds between refreshes
    pub refresh_interval_secs: u64,
}

impl Default for DesiredStateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::DESIRED_STATE_PATH),
            refresh_interval_secs: defaults::REFRESH_INTERVAL_SECS,
        }
    }
}

impl DesiredStateConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

/// Atomically swappable desired-state snapshot.
pub struct DesiredStateStore {
    snapshot: ArcSwap<DesiredSnapshot>,
    generation: AtomicU64,
    failed_refreshes: AtomicU64,
}

impl DesiredStateStore {
    /// Create a store holding `initial`.
    pub fn new(initial: DesiredSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(initial),
            generation: AtomicU64::new(1),
            failed_refreshes: AtomicU64::new(0),
        }
    }

    /// Create a store holding the compiled-in defaults.
    pub fn with_defaults() -> Self {
        Self::new(DesiredSnapshot::builtin())
    }

    /// Desired state of one device in the current snapshot.
    pub fn get(&self, device_id: &str) -> Option<DesiredState> {
        self.snapshot.load().get(device_id).cloned()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<DesiredSnapshot> {
        self.snapshot.load_full()
    }

    /// Replace the whole mapping.
    pub fn replace(&self, next: DesiredSnapshot) {
        self.snapshot.store(Arc::new(next));
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Incremented on every successful replacement.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of refresh attempts that failed.
    pub fn failed_refreshes(&self) -> u64 {
        self.failed_refreshes.load(Ordering::Relaxed)
    }

    /// Read and parse the document once. On failure the current snapshot is
    /// kept and the error is logged and returned.
    pub async fn refresh_from(&self, source: &dyn StateSource) -> Result<(), StateError> {
        let parsed = match source.load().await {
            Ok(text) => DesiredSnapshot::parse(&text),
            Err(err) => Err(err),
        };

        match parsed {
            Ok(next) => {
                debug!(
                    category = "desired_state",
                    source = %source.name(),
                    devices = next.len(),
                    "Desired state refreshed"
                );
                self.replace(next);
                Ok(())
            }
            Err(err) => {
                self.failed_refreshes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    category = "desired_state",
                    source = %source.name(),
                    error = %err,
                    "Desired state refresh failed, keeping previous snapshot"
                );
                Err(err)
            }
        }
    }

    /// Refresh from `source` every `interval`, starting immediately.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        source: Arc<dyn StateSource>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let store = self.clone();
        info!(
            category = "desired_state",
            source = %source.name(),
            interval_secs = interval.as_secs(),
            "Desired state refresh started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are logged inside; the loop keeps its schedule.
                let _ = store.refresh_from(source.as_ref()).await;
            }
        })
    }
}

impl Default for DesiredStateStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticSource(Result<String, StateError>);

    #[async_trait]
    impl StateSource for StaticSource {
        fn name(&self) -> String {
            "static".to_string()
        }

        async fn load(&self) -> Result<String, StateError> {
            self.0.clone()
        }
    }

    #[test]
    fn test_builtin_defaults() {
        let snapshot = DesiredSnapshot::builtin();
        assert_eq!(snapshot.device_ids(), ["edison", "huzzah", "rpi2"]);
        assert_eq!(snapshot.get("huzzah").unwrap().get("led1"), Some(&json!(true)));
        assert_eq!(snapshot.get("rpi2").unwrap().get("LcdText"), Some(&json!("RPi2")));
        assert_eq!(snapshot.get("edison").unwrap().get("redLed"), Some(&json!(true)));
    }

    #[test]
    fn test_parse_document() {
        let snapshot =
            DesiredSnapshot::parse(r#"{"rpi2":{"Led":true,"LcdText":"Hello"}}"#).unwrap();
        assert_eq!(snapshot.len(), 1);
        let rpi2 = snapshot.get("rpi2").unwrap();
        assert_eq!(rpi2.device_id, "rpi2");
        assert_eq!(rpi2.get("Led"), Some(&json!(true)));
        assert!(snapshot.get("huzzah").is_none());
    }

    #[test]
    fn test_parse_rejects_bad_documents() {
        assert!(matches!(
            DesiredSnapshot::parse("{\"rpi2\": {"),
            Err(StateError::Parse(_))
        ));
        assert!(matches!(DesiredSnapshot::parse("[1,2]"), Err(StateError::Shape(_))));
        assert!(matches!(
            DesiredSnapshot::parse(r#"{"rpi2": true}"#),
            Err(StateError::Shape(_))
        ));
    }

    #[test]
    fn test_to_json_round_trips_document() {
        let snapshot = DesiredSnapshot::builtin();
        let again = DesiredSnapshot::parse(&snapshot.to_json().to_string()).unwrap();
        assert_eq!(again.device_ids(), snapshot.device_ids());
        assert_eq!(again.get("edison"), snapshot.get("edison"));
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let store = DesiredStateStore::with_defaults();
        let source = StaticSource(Ok(r#"{"rpi2":{"Led":true}}"#.to_string()));

        store.refresh_from(&source).await.unwrap();
        assert_eq!(store.generation(), 2);
        assert!(store.get("huzzah").is_none());
        assert_eq!(store.get("rpi2").unwrap().get("Led"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let store = DesiredStateStore::with_defaults();
        let before = store.snapshot();

        let bad = StaticSource(Ok("{ not json".to_string()));
        assert!(store.refresh_from(&bad).await.is_err());
        let missing = StaticSource(Err(StateError::Read {
            source_name: "expectedStates.json".to_string(),
            message: "not found".to_string(),
        }));
        assert!(store.refresh_from(&missing).await.is_err());

        assert_eq!(*store.snapshot(), *before);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.failed_refreshes(), 2);
    }
}
