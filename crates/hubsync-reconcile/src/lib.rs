//! Desired-state reconciliation for hubsync.
//!
//! - [`desired`]: the atomically refreshed desired-state store
//! - [`rules`]: per-device reconciliation rules and their registry
//! - [`command`]: corrective commands and their wire shapes
//! - [`dispatcher`]: fire-and-forget command delivery
//! - [`engine`]: the per-event reconciliation loop

pub mod command;
pub mod desired;
pub mod dispatcher;
pub mod engine;
pub mod rules;

pub use command::{Command, CommandPayload, MethodCall};
pub use desired::{
    Attributes, DesiredState, DesiredSnapshot, DesiredStateConfig, DesiredStateStore, FileSource,
    StateError, StateSource,
};
pub use dispatcher::{CommandDispatcher, DispatcherStats};
pub use engine::ReconciliationEngine;
pub use rules::{
    AttributeRule, Correction, DynRule, Mismatch, ReconciliationRule, RuleRegistry, RuleSet,
    RuleSetConfig,
};
