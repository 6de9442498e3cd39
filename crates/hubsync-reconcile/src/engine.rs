//! Reconciliation engine.
//!
//! Runs once per received event: looks up the device's rule and desired
//! state, logs every mismatch, and dispatches the corrections. Events from
//! devices without a registered rule or desired state are ignored.

use std::collections::HashSet;
use std::sync::Arc;

use hubsync_core::{ConnectableFeed, TelemetryEvent};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::desired::DesiredStateStore;
use crate::dispatcher::CommandDispatcher;
use crate::rules::{DynRule, Mismatch, RuleRegistry};

/// Diffs telemetry against desired state and sends corrections.
pub struct ReconciliationEngine {
    store: Arc<DesiredStateStore>,
    registry: Arc<RuleRegistry>,
    dispatcher: CommandDispatcher,
    /// Devices with a running observer
    observed: Mutex<HashSet<String>>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<DesiredStateStore>,
        registry: Arc<RuleRegistry>,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            observed: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<DesiredStateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Compare one event with the current desired state. Every mismatch is
    /// logged; nothing is sent.
    pub fn evaluate(&self, event: &TelemetryEvent) -> Vec<Mismatch> {
        let Some(device_id) = event.device_id.as_deref() else {
            return Vec::new();
        };
        let Some(rule) = self.registry.get(device_id) else {
            debug!(category = "reconcile", device_id = %device_id, "No rule registered, ignoring event");
            return Vec::new();
        };
        let Some(desired) = self.store.get(device_id) else {
            debug!(category = "reconcile", device_id = %device_id, "No desired state, ignoring event");
            return Vec::new();
        };

        let mismatches = rule.diff(device_id, &event.body, &desired);
        for mismatch in &mismatches {
            warn!(
                category = "reconcile",
                device_id = %device_id,
                attribute = %mismatch.attribute,
                reported = %mismatch.reported,
                desired = %mismatch.desired,
                "{} is {} but should be {}",
                mismatch.attribute,
                mismatch.reported,
                mismatch.desired
            );
            if mismatch.command.is_none() {
                warn!(
                    category = "reconcile",
                    device_id = %device_id,
                    attribute = %mismatch.attribute,
                    kind = %rule.kind(),
                    "Desired value has no correction for this attribute"
                );
            }
        }
        mismatches
    }

    /// Evaluate one event and dispatch its corrections. Returns the commands
    /// that were handed to the dispatcher.
    pub fn reconcile(&self, event: &TelemetryEvent) -> Vec<Command> {
        let commands: Vec<Command> = self
            .evaluate(event)
            .into_iter()
            .filter_map(|mismatch| mismatch.command)
            .collect();
        for command in &commands {
            info!(
                category = "reconcile",
                device_id = %command.device_id,
                command = %command.payload,
                "Sending correction"
            );
            self.dispatcher.dispatch(command.clone());
        }
        commands
    }

    /// Observe one device on the feed: log each event, then reconcile it.
    ///
    /// Returns `None` if the device is already observed. The task ends when
    /// the feed closes.
    pub fn observe_device(
        self: &Arc<Self>,
        feed: &ConnectableFeed,
        device_id: &str,
    ) -> Option<JoinHandle<()>> {
        if !self.observed.lock().insert(device_id.to_string()) {
            return None;
        }
        let device_id = device_id.to_string();
        let mut events = feed.device(device_id.clone());
        let engine = self.clone();
        Some(tokio::spawn(async move {
            while let Some(item) = events.recv().await {
                let Some(event) = item.event() else {
                    continue;
                };
                info!(
                    category = "reconcile",
                    device_id = %device_id,
                    partition = %event.partition_id,
                    enqueued_time = %event.enqueued_time,
                    "Message received"
                );
                debug!(category = "reconcile", device_id = %device_id, "{}", event.body.render_pretty());
                engine.reconcile(event);
            }
            debug!(category = "reconcile", device_id = %device_id, "Device observer stopped");
            engine.observed.lock().remove(&device_id);
        }))
    }

    /// Start an observer for every registered device not yet observed.
    pub fn spawn_observers(self: &Arc<Self>, feed: &ConnectableFeed) -> Vec<JoinHandle<()>> {
        self.registry
            .list()
            .iter()
            .filter_map(|device_id| self.observe_device(feed, device_id))
            .collect()
    }

    /// Register a rule while the engine is running and make sure the device
    /// is observed. Returns the new observer, if one was started.
    pub fn register_device(
        self: &Arc<Self>,
        feed: &ConnectableFeed,
        device_id: &str,
        rule: DynRule,
    ) -> Option<JoinHandle<()>> {
        if self.registry.register(device_id, rule).is_some() {
            debug!(category = "reconcile", device_id = %device_id, "Replaced device rule");
        }
        self.observe_device(feed, device_id)
    }
}
