// Action catalog - action type names to handler constructors

//! # Action Catalog
//!
//! The catalog maps an [`ActionType`] to a [`CatalogEntry`]: default traits
//! for actions of that type (kind, side effect, idempotency, permission) and
//! a factory that builds a handler from an [`ActionDefinition`].
//!
//! Registration is explicit and duplicate names are rejected. The catalog is
//! built mutably at startup, then shared behind an `Arc`, after which it can
//! no longer change.
//!
//! ## Built-ins
//!
//! | type | slot | kind | side effect | permission |
//! |---|---|---|---|---|
//! | `fetch_data` | data_source | fetch | external read | |
//! | `scrape_web` | scraper | enrich | external read | |
//! | `news_search` | news | enrich | external read | |
//! | `rag_query` | retriever | enrich | external read | |
//! | `predict_score` | score_model | predict | pure | |
//! | `competitor_query` | competitor_intel | enrich | external read | |
//! | `crm_write` | crm | persist | external write | `crm.write` |
//! | `slack_notify` | chat | notify | external write | `slack.post` |
//! | `log` | | log | pure | |
//!
//! A collaborator-backed built-in is only registered when its slot is
//! configured; `log` is always available.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::collaborators::{Collaborator, CollaboratorSlot, Collaborators};
use crate::models::{
    ActionDefinition, ActionHandler, ActionKind, ActionResult, ActionSpec, ActionType, Circuit,
    CircuitDefinition, ExecutionContext, Idempotency, LogLevel, SideEffect, Step, StepDefinition,
};
use crate::{CircuitError, Result};

/// Builds a handler for one action definition
pub trait ActionFactory: Send + Sync {
    fn create(&self, definition: &ActionDefinition) -> Result<Arc<dyn ActionHandler>>;
}

impl<F> ActionFactory for F
where
    F: Fn(&ActionDefinition) -> Result<Arc<dyn ActionHandler>> + Send + Sync,
{
    fn create(&self, definition: &ActionDefinition) -> Result<Arc<dyn ActionHandler>> {
        self(definition)
    }
}

/// Shares one handler across every definition of a type
struct SharedHandler(Arc<dyn ActionHandler>);

impl ActionFactory for SharedHandler {
    fn create(&self, _definition: &ActionDefinition) -> Result<Arc<dyn ActionHandler>> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
pub struct CatalogEntry {
    pub action_type: ActionType,
    pub kind: ActionKind,
    pub side_effect: SideEffect,
    pub idempotency: Idempotency,
    pub permission: Option<String>,
    factory: Arc<dyn ActionFactory>,
}

impl CatalogEntry {
    pub fn new(action_type: ActionType, factory: impl ActionFactory + 'static) -> Self {
        Self {
            action_type,
            kind: ActionKind::Decide,
            side_effect: SideEffect::Pure,
            idempotency: Idempotency::Idempotent,
            permission: None,
            factory: Arc::new(factory),
        }
    }

    /// Entry whose every action shares `handler`
    pub fn handler(action_type: ActionType, handler: Arc<dyn ActionHandler>) -> Self {
        Self::new(action_type, SharedHandler(handler))
    }

    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_side_effect(mut self, side_effect: SideEffect) -> Self {
        self.side_effect = side_effect;
        self
    }

    pub fn with_idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("action_type", &self.action_type)
            .field("kind", &self.kind)
            .field("side_effect", &self.side_effect)
            .field("permission", &self.permission)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ActionCatalog {
    entries: HashMap<String, CatalogEntry>,
    order: Vec<String>,
}

impl ActionCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with `log` plus every built-in whose collaborator is configured
    pub fn with_builtins(collaborators: &Collaborators) -> Self {
        let mut catalog = Self::new();
        for action_type in ActionType::BUILTINS.iter() {
            let entry = match builtin_slot(action_type) {
                None => Some(log_entry()),
                Some(slot) => collaborators
                    .get(slot)
                    .map(|collaborator| collaborator_entry(action_type, collaborator)),
            };
            if let Some(entry) = entry {
                // names are unique within BUILTINS
                catalog.insert(entry);
            }
        }
        info!(types = ?catalog.names(), "action catalog ready");
        catalog
    }

    /// Register an action type; duplicate names are rejected
    pub fn register(&mut self, entry: CatalogEntry) -> Result<()> {
        let name = entry.action_type.as_str().to_string();
        if self.entries.contains_key(&name) {
            return Err(CircuitError::DuplicateAction(name));
        }
        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, entry: CatalogEntry) {
        let name = entry.action_type.as_str().to_string();
        self.order.push(name.clone());
        self.entries.insert(name, entry);
    }

    pub fn get(&self, action_type: &ActionType) -> Option<&CatalogEntry> {
        self.entries.get(action_type.as_str())
    }

    pub fn contains(&self, action_type: &ActionType) -> bool {
        self.entries.contains_key(action_type.as_str())
    }

    /// Registered type names in registration order
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Resolve a wire definition into a validated circuit
    pub fn build_circuit(&self, definition: &CircuitDefinition) -> Result<Circuit> {
        let mut circuit = Circuit::new(&definition.name, definition.version)
            .expecting(definition.expects.iter().cloned())
            .with_on_failure(definition.on_failure);
        if let Some(description) = &definition.description {
            circuit = circuit.with_description(description);
        }
        if let Some(budget_ms) = definition.budget_ms {
            circuit = circuit.with_budget(Duration::from_millis(budget_ms));
        }
        for trigger in &definition.triggers {
            circuit.bind(trigger.clone());
        }

        for step in &definition.actions {
            let step = self.build_step(step)?;
            circuit.add(step)?;
        }
        circuit.validate()?;
        Ok(circuit)
    }

    fn build_step(&self, definition: &StepDefinition) -> Result<Step> {
        match definition {
            StepDefinition::Action(action) => Ok(Step::Action(self.build_action(action)?)),
            StepDefinition::Conditional(conditional) => {
                let then = conditional
                    .then
                    .iter()
                    .map(|s| self.build_step(s))
                    .collect::<Result<Vec<_>>>()?;
                let otherwise = conditional
                    .otherwise
                    .iter()
                    .map(|s| self.build_step(s))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Step::conditional(
                    &conditional.name,
                    conditional.when.clone(),
                    then,
                    otherwise,
                ))
            }
        }
    }

    pub fn build_action(&self, definition: &ActionDefinition) -> Result<ActionSpec> {
        let entry = self.get(&definition.action).ok_or_else(|| {
            CircuitError::Definition(format!(
                "action '{}' uses unknown action type '{}'",
                definition.name, definition.action
            ))
        })?;

        let handler = entry.factory.create(definition)?;
        let mut spec = ActionSpec::new(&definition.name, definition.action.clone(), handler)
            .with_kind(entry.kind)
            .with_side_effect(entry.side_effect)
            .with_idempotency(entry.idempotency)
            .with_inputs(definition.inputs.iter().cloned())
            .with_params(definition.params.clone());

        spec.output = definition.output.clone();
        spec.permission = definition.permission.clone().or_else(|| entry.permission.clone());
        spec.timeout = definition.timeout_ms.map(Duration::from_millis);
        spec.retry = definition.retry;
        if let Some(compensation) = &definition.compensation {
            spec = spec.with_compensation(self.build_action(compensation)?);
        }
        Ok(spec)
    }
}

fn builtin_slot(action_type: &ActionType) -> Option<CollaboratorSlot> {
    match action_type {
        ActionType::FetchData => Some(CollaboratorSlot::DataSource),
        ActionType::ScrapeWeb => Some(CollaboratorSlot::Scraper),
        ActionType::NewsSearch => Some(CollaboratorSlot::News),
        ActionType::RagQuery => Some(CollaboratorSlot::Retriever),
        ActionType::PredictScore => Some(CollaboratorSlot::ScoreModel),
        ActionType::CompetitorQuery => Some(CollaboratorSlot::CompetitorIntel),
        ActionType::CrmWrite => Some(CollaboratorSlot::Crm),
        ActionType::SlackNotify => Some(CollaboratorSlot::Chat),
        ActionType::Log | ActionType::Extension(_) => None,
    }
}

fn collaborator_entry(action_type: &ActionType, collaborator: Arc<dyn Collaborator>) -> CatalogEntry {
    let factory = {
        let collaborator = collaborator.clone();
        move |definition: &ActionDefinition| -> Result<Arc<dyn ActionHandler>> {
            Ok(Arc::new(CollaboratorAction {
                name: definition.name.clone(),
                action_type: definition.action.clone(),
                inputs: definition.inputs.clone(),
                params: definition.params.clone(),
                collaborator: collaborator.clone(),
            }))
        }
    };

    let entry = CatalogEntry::new(action_type.clone(), factory);
    match action_type {
        ActionType::FetchData => entry
            .with_kind(ActionKind::Fetch)
            .with_side_effect(SideEffect::ExternalRead),
        ActionType::PredictScore => entry.with_kind(ActionKind::Predict),
        ActionType::CrmWrite => entry
            .with_kind(ActionKind::Persist)
            .with_side_effect(SideEffect::ExternalWrite)
            .with_idempotency(Idempotency::NonIdempotent)
            .with_permission("crm.write"),
        ActionType::SlackNotify => entry
            .with_kind(ActionKind::Notify)
            .with_side_effect(SideEffect::ExternalWrite)
            .with_idempotency(Idempotency::NonIdempotent)
            .with_permission("slack.post"),
        _ => entry
            .with_kind(ActionKind::Enrich)
            .with_side_effect(SideEffect::ExternalRead),
    }
}

fn log_entry() -> CatalogEntry {
    let factory = |definition: &ActionDefinition| -> Result<Arc<dyn ActionHandler>> {
        let level = match definition.params.get("level") {
            None => LogLevel::Info,
            Some(level) => serde_json::from_value(level.clone()).map_err(|_| {
                CircuitError::Definition(format!(
                    "action '{}' has an invalid log level {}",
                    definition.name, level
                ))
            })?,
        };
        let message = definition
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(&definition.name)
            .to_string();

        Ok(Arc::new(LogAction {
            level,
            message,
            inputs: definition.inputs.clone(),
        }))
    };
    CatalogEntry::new(ActionType::Log, factory).with_kind(ActionKind::Log)
}

/// Built-in action that forwards to a collaborator
struct CollaboratorAction {
    name: String,
    action_type: ActionType,
    inputs: Vec<String>,
    params: Value,
    collaborator: Arc<dyn Collaborator>,
}

#[async_trait]
impl ActionHandler for CollaboratorAction {
    async fn execute(&self, ctx: &ExecutionContext) -> ActionResult {
        let request = json!({
            "action": self.name,
            "type": self.action_type.as_str(),
            "params": self.params,
            "inputs": collect_inputs(ctx, &self.inputs),
            "correlation_id": ctx.correlation_id(),
            "event": {
                "kind": ctx.event().kind().as_str(),
                "source": ctx.event().source(),
            },
        });

        let answer = self.collaborator.call(request).await;
        if ctx.is_cancelled() {
            return ActionResult::cancelled();
        }

        match answer {
            Ok(output) => ActionResult::ok(output),
            Err(e) => ActionResult::external(e.message, e.recoverable),
        }
    }
}

/// Built-in `log` action: appends to the run log
struct LogAction {
    level: LogLevel,
    message: String,
    inputs: Vec<String>,
}

#[async_trait]
impl ActionHandler for LogAction {
    async fn execute(&self, ctx: &ExecutionContext) -> ActionResult {
        let fields = collect_inputs(ctx, &self.inputs);
        info!(correlation_id = %ctx.correlation_id(), "{}", self.message);
        let seq = ctx.log(self.level, self.message.clone(), fields);
        ActionResult::ok(json!({ "seq": seq }))
    }
}

fn collect_inputs(ctx: &ExecutionContext, inputs: &[String]) -> Map<String, Value> {
    inputs
        .iter()
        .filter_map(|key| ctx.get(key).map(|value| (key.clone(), value.clone())))
        .collect()
}
