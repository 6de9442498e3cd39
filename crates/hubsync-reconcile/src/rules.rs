//! Reconciliation rules.
//!
//! A rule compares one device's reported attributes with its desired state
//! and produces a [`Mismatch`] for every attribute that differs. Rules are
//! looked up by device id in a [`RuleRegistry`], so a new device kind is
//! added by registering a rule set rather than by editing the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use hubsync_core::EventBody;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Command;
use crate::desired::DesiredState;

/// How a mismatch on one attribute is corrected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Correction {
    /// `TurnLedOn`/`TurnLedOff` method call for LED `led_id`
    LedMethod { led_id: u8 },
    /// `"<key>:on"`/`"<key>:off"` string
    Switch { key: String },
    /// `"text:<value>"` string
    Text,
}

impl Correction {
    /// Build the command that drives the device to `desired`.
    ///
    /// Returns `None` when the desired value has the wrong type for this
    /// correction (a switch needs a boolean).
    pub fn command(&self, device_id: &str, desired: &Value) -> Option<Command> {
        match self {
            Correction::LedMethod { led_id } => desired
                .as_bool()
                .map(|on| Command::led(device_id, *led_id, on)),
            Correction::Switch { key } => desired
                .as_bool()
                .map(|on| Command::switch(device_id, key, on)),
            Correction::Text => Some(match desired {
                Value::String(text) => Command::text(device_id, text),
                other => Command::text(device_id, &other.to_string()),
            }),
        }
    }
}

/// Maps one reported attribute to its desired counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRule {
    /// Attribute name in the telemetry body
    pub reported: String,
    /// Attribute name in the desired-state document
    pub desired: String,
    pub correction: Correction,
}

impl AttributeRule {
    pub fn new(reported: impl Into<String>, desired: impl Into<String>, correction: Correction) -> Self {
        Self {
            reported: reported.into(),
            desired: desired.into(),
            correction,
        }
    }
}

/// A detected difference between reported and desired state.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub device_id: String,
    /// Desired attribute name
    pub attribute: String,
    pub reported: Value,
    pub desired: Value,
    /// Correction to send, if one can be built
    pub command: Option<Command>,
}

/// Reconciliation logic for one device kind.
pub trait ReconciliationRule: Send + Sync {
    /// Kind name, for logs.
    fn kind(&self) -> &str;

    /// Compare a telemetry body with the desired state.
    ///
    /// Attributes missing from the body are not compared.
    fn diff(&self, device_id: &str, reported: &EventBody, desired: &DesiredState) -> Vec<Mismatch>;
}

/// Shared rule handle.
pub type DynRule = Arc<dyn ReconciliationRule>;

/// Table-driven rule: a list of attribute rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    kind: String,
    rules: Vec<AttributeRule>,
}

impl RuleSet {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            rules: Vec::new(),
        }
    }

    /// Add an attribute rule.
    pub fn with(mut self, rule: AttributeRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[AttributeRule] {
        &self.rules
    }

    /// Two LEDs driven by method calls.
    pub fn huzzah() -> Self {
        Self::new("huzzah")
            .with(AttributeRule::new("Led1", "led1", Correction::LedMethod { led_id: 1 }))
            .with(AttributeRule::new("Led2", "led2", Correction::LedMethod { led_id: 2 }))
    }

    /// One LED and an LCD.
    pub fn rpi2() -> Self {
        Self::new("rpi2")
            .with(AttributeRule::new("Led", "Led", Correction::Switch { key: "led".into() }))
            .with(AttributeRule::new("LcdText", "LcdText", Correction::Text))
    }

    /// Two named LEDs and an LCD.
    pub fn edison() -> Self {
        Self::new("edison")
            .with(AttributeRule::new(
                "greenLed",
                "greenLed",
                Correction::Switch { key: "greenLed".into() },
            ))
            .with(AttributeRule::new(
                "redLed",
                "redLed",
                Correction::Switch { key: "redLed".into() },
            ))
            .with(AttributeRule::new("lcdText", "lcdText", Correction::Text))
    }
}

impl ReconciliationRule for RuleSet {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn diff(&self, device_id: &str, reported: &EventBody, desired: &DesiredState) -> Vec<Mismatch> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let reported = reported.attribute(&rule.reported)?;
                let desired = desired.get(&rule.desired)?;
                (reported != desired).then(|| Mismatch {
                    device_id: device_id.to_string(),
                    attribute: rule.desired.clone(),
                    reported: reported.clone(),
                    desired: desired.clone(),
                    command: rule.correction.command(device_id, desired),
                })
            })
            .collect()
    }
}

/// Rule set as written in configuration.
///
/// ```toml
/// [devices.lamp]
/// rules = [
///     { reported = "On", desired = "on", correction = { kind = "switch", key = "lamp" } },
/// ]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetConfig {
    #[serde(default)]
    pub rules: Vec<AttributeRule>,
}

impl RuleSetConfig {
    pub fn into_rule_set(self, kind: impl Into<String>) -> RuleSet {
        self.rules
            .into_iter()
            .fold(RuleSet::new(kind), |set, rule| set.with(rule))
    }
}

/// Device id to reconciliation rule.
pub struct RuleRegistry {
    rules: DashMap<String, DynRule>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
        }
    }

    /// Registry with the reference device kinds.
    pub fn builtin() -> Self {
        let registry = Self::new();
        for set in [RuleSet::huzzah(), RuleSet::rpi2(), RuleSet::edison()] {
            let device_id = set.kind().to_string();
            registry.register(device_id, Arc::new(set));
        }
        registry
    }

    /// Register a rule for a device. Returns the rule it replaced.
    ///
    /// This does not start an observer for a new device; once observers
    /// are running use
    /// [`ReconciliationEngine::register_device`](crate::engine::ReconciliationEngine::register_device).
    pub fn register(&self, device_id: impl Into<String>, rule: DynRule) -> Option<DynRule> {
        self.rules.insert(device_id.into(), rule)
    }

    /// Register rule sets from configuration.
    pub fn register_configured(&self, devices: BTreeMap<String, RuleSetConfig>) {
        for (device_id, config) in devices {
            let set = config.into_rule_set(device_id.clone());
            tracing::info!(
                category = "reconcile",
                device_id = %device_id,
                rules = set.rules().len(),
                "Registered configured rule set"
            );
            self.register(device_id, Arc::new(set));
        }
    }

    pub fn unregister(&self, device_id: &str) -> bool {
        self.rules.remove(device_id).is_some()
    }

    pub fn get(&self, device_id: &str) -> Option<DynRule> {
        self.rules.get(device_id).map(|entry| entry.value().clone())
    }

    pub fn has(&self, device_id: &str) -> bool {
        self.rules.contains_key(device_id)
    }

    /// Registered device ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rules.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredSnapshot;
    use serde_json::json;

    fn body(value: Value) -> EventBody {
        EventBody::Json(value)
    }

    fn desired(device_id: &str) -> DesiredState {
        DesiredSnapshot::builtin().get(device_id).cloned().unwrap()
    }

    #[test]
    fn test_huzzah_single_led_mismatch() {
        let mismatches = RuleSet::huzzah().diff(
            "huzzah",
            &body(json!({"Led1": false, "Led2": false})),
            &desired("huzzah"),
        );
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].attribute, "led1");
        assert_eq!(mismatches[0].command, Some(Command::led("huzzah", 1, true)));
    }

    #[test]
    fn test_rpi2_text_mismatch() {
        let mismatches = RuleSet::rpi2().diff(
            "rpi2",
            &body(json!({"Led": false, "LcdText": "ERROR"})),
            &desired("rpi2"),
        );
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].reported, json!("ERROR"));
        assert_eq!(mismatches[0].command, Some(Command::text("rpi2", "RPi2")));
    }

    #[test]
    fn test_edison_all_attributes() {
        let mismatches = RuleSet::edison().diff(
            "edison",
            &body(json!({"greenLed": true, "redLed": false, "lcdText": "hi", "lightLevel": 40})),
            &desired("edison"),
        );
        let commands: Vec<String> = mismatches
            .iter()
            .filter_map(|m| m.command.as_ref())
            .map(|c| c.payload.to_string())
            .collect();
        assert_eq!(commands, ["greenLed:off", "redLed:on", "text:Edison"]);
    }

    #[test]
    fn test_matching_and_absent_attributes_are_quiet() {
        let rule = RuleSet::edison();
        let matching = body(json!({"greenLed": false, "redLed": true, "lcdText": "Edison"}));
        assert!(rule.diff("edison", &matching, &desired("edison")).is_empty());

        let partial = body(json!({"redLed": true}));
        assert!(rule.diff("edison", &partial, &desired("edison")).is_empty());

        let raw = EventBody::Bytes(b"not json".to_vec());
        assert!(rule.diff("edison", &raw, &desired("edison")).is_empty());
    }

    #[test]
    fn test_switch_needs_boolean() {
        let correction = Correction::Switch { key: "led".into() };
        assert!(correction.command("rpi2", &json!("on")).is_none());
        assert_eq!(
            correction.command("rpi2", &json!(true)),
            Some(Command::switch("rpi2", "led", true))
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RuleRegistry::builtin();
        assert_eq!(registry.list(), ["edison", "huzzah", "rpi2"]);
        assert_eq!(registry.get("rpi2").unwrap().kind(), "rpi2");
        assert!(registry.get("unknown-device").is_none());

        assert!(registry.unregister("rpi2"));
        assert!(!registry.has("rpi2"));
    }

    #[test]
    fn test_configured_rule_set() {
        let config: RuleSetConfig = serde_json::from_value(json!({
            "rules": [
                {"reported": "On", "desired": "on", "correction": {"kind": "switch", "key": "lamp"}},
                {"reported": "Label", "desired": "label", "correction": {"kind": "text"}},
                {"reported": "L3", "desired": "l3", "correction": {"kind": "led_method", "led_id": 3}}
            ]
        }))
        .unwrap();

        let registry = RuleRegistry::new();
        registry.register_configured(BTreeMap::from([("lamp".to_string(), config)]));

        let rule = registry.get("lamp").unwrap();
        let state = DesiredState::new(
            "lamp",
            [("on".to_string(), json!(true)), ("l3".to_string(), json!(false))]
                .into_iter()
                .collect(),
        );
        let mismatches = rule.diff("lamp", &body(json!({"On": false, "L3": true})), &state);
        assert_eq!(mismatches.len(), 2);
        assert_eq!(mismatches[0].command, Some(Command::switch("lamp", "lamp", true)));
        assert_eq!(mismatches[1].command, Some(Command::led("lamp", 3, false)));
    }
}
