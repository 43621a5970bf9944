// Circuit definitions - the JSON wire form accepted by POST /circuits

//! # Circuit Definitions
//!
//! A [`CircuitDefinition`] is what callers send over the wire. It names
//! action *types* rather than carrying code, so it has to be resolved
//! against an action catalog before it becomes a runnable
//! [`Circuit`](super::Circuit). See `ActionCatalog::build_circuit`.
//!
//! ```json
//! {
//!   "name": "hot_lead_alert",
//!   "version": 1,
//!   "triggers": [{"type": "event", "kind": "lead_created"}],
//!   "expects": ["lead_id"],
//!   "actions": [
//!     {"type": "action", "name": "fetch", "action": "fetch_data",
//!      "inputs": ["lead_id"], "output": "lead"},
//!     {"type": "conditional", "name": "is_hot",
//!      "when": {"type": "exists", "field": "lead"},
//!      "then": [...], "else": [...]}
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::{ActionType, RetryPolicy};
use super::circuit::OnFailure;
use super::predicate::Predicate;
use super::trigger::Trigger;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub expects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ms: Option<u64>,
    #[serde(default)]
    pub on_failure: OnFailure,
    pub actions: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDefinition {
    Action(ActionDefinition),
    Conditional(ConditionalDefinition),
}

impl StepDefinition {
    pub fn name(&self) -> &str {
        match self {
            StepDefinition::Action(action) => &action.name,
            StepDefinition::Conditional(conditional) => &conditional.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    /// Catalog type name, e.g. `predict_score`
    pub action: ActionType,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Overrides the catalog's default permission tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Box<ActionDefinition>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalDefinition {
    pub name: String,
    pub when: Predicate,
    #[serde(default)]
    pub then: Vec<StepDefinition>,
    #[serde(rename = "else", default)]
    pub otherwise: Vec<StepDefinition>,
}
