// Circuit domain model - named, versioned workflows

//! # Circuits
//!
//! A [`Circuit`] is a description, not a run: triggers that fire it, an
//! ordered sequence of steps, a wall-clock budget and an on-failure policy.
//!
//! ## Arena Layout
//!
//! Steps live in an arena (`Vec<Node>`) addressed by [`NodeId`]. The root
//! sequence and each conditional's branches are lists of ids. Nodes are only
//! ever appended, and a conditional's children are appended before the
//! conditional itself, so every edge points at a lower index and the graph
//! is acyclic by construction.
//!
//! ## Key Flow
//!
//! Validation walks the steps forward, tracking which context keys are
//! guaranteed to exist:
//! - the circuit's `expects` keys and the payload-filter keys every bound
//!   trigger guarantees are available from the start
//! - an action needs all of its inputs available, then adds its output key
//! - after a conditional, only keys produced on *both* branches remain
//!
//! Violations are reported as `definition_error` at registration time,
//! never at runtime.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use super::action::{duration_ms, ActionSpec};
use super::predicate::Predicate;
use super::trigger::Trigger;
use crate::{CircuitError, Result};

/// Index of a node in a circuit's arena
pub type NodeId = usize;

/// What happens to the rest of a run after an action fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Abort,
    Continue,
    Compensate,
}

#[derive(Debug, Clone)]
pub struct ConditionalNode {
    pub name: String,
    pub predicate: Predicate,
    pub then_branch: Vec<NodeId>,
    pub else_branch: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Action(ActionSpec),
    Conditional(ConditionalNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Action(spec) => &spec.name,
            Node::Conditional(conditional) => &conditional.name,
        }
    }
}

/// A step as handed to [`Circuit::add`], before it is laid into the arena
#[derive(Debug, Clone)]
pub enum Step {
    Action(ActionSpec),
    Conditional {
        name: String,
        predicate: Predicate,
        then: Vec<Step>,
        otherwise: Vec<Step>,
    },
}

impl Step {
    pub fn conditional(
        name: impl Into<String>,
        predicate: Predicate,
        then: Vec<Step>,
        otherwise: Vec<Step>,
    ) -> Self {
        Step::Conditional {
            name: name.into(),
            predicate,
            then,
            otherwise,
        }
    }
}

impl From<ActionSpec> for Step {
    fn from(spec: ActionSpec) -> Self {
        Step::Action(spec)
    }
}

#[derive(Debug, Clone)]
pub struct Circuit {
    pub name: String,
    pub version: u32,
    pub description: Option<String>,
    pub triggers: Vec<Trigger>,
    /// Keys the trigger payload is expected to carry
    pub expects: Vec<String>,
    /// Wall-clock budget for a whole run; the engine default applies when unset
    pub budget: Option<Duration>,
    pub on_failure: OnFailure,
    nodes: Vec<Node>,
    root: Vec<NodeId>,
}

impl Circuit {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            triggers: Vec::new(),
            expects: Vec::new(),
            budget: None,
            on_failure: OnFailure::default(),
            nodes: Vec::new(),
            root: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn expecting<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expects.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Bind a trigger
    pub fn bind(&mut self, trigger: Trigger) -> &mut Self {
        self.triggers.push(trigger);
        self
    }

    /// Append a step to the root sequence
    ///
    /// The circuit is re-validated with the new step in place; on error the
    /// step is rolled back and the circuit is left as it was.
    pub fn add(&mut self, step: impl Into<Step>) -> Result<NodeId> {
        let arena_len = self.nodes.len();
        let id = self.insert(step.into());
        self.root.push(id);

        if let Err(e) = self.validate() {
            self.root.pop();
            self.nodes.truncate(arena_len);
            return Err(e);
        }
        Ok(id)
    }

    fn insert(&mut self, step: Step) -> NodeId {
        match step {
            Step::Action(spec) => {
                self.nodes.push(Node::Action(spec));
            }
            Step::Conditional {
                name,
                predicate,
                then,
                otherwise,
            } => {
                let then_branch = then.into_iter().map(|s| self.insert(s)).collect();
                let else_branch = otherwise.into_iter().map(|s| self.insert(s)).collect();
                self.nodes.push(Node::Conditional(ConditionalNode {
                    name,
                    predicate,
                    then_branch,
                    else_branch,
                }));
            }
        }
        self.nodes.len() - 1
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn root(&self) -> &[NodeId] {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn matches(&self, event: &super::event::TriggerEvent) -> bool {
        self.triggers.iter().any(|t| t.matches(event))
    }

    /// Names of every step in declaration order, branches included
    pub fn step_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&self.root, &mut names);
        names
    }

    fn collect_names(&self, ids: &[NodeId], names: &mut Vec<String>) {
        for &id in ids {
            if let Some(node) = self.nodes.get(id) {
                names.push(node.name().to_string());
                if let Node::Conditional(c) = node {
                    self.collect_names(&c.then_branch, names);
                    self.collect_names(&c.else_branch, names);
                }
            }
        }
    }

    /// Keys available before the first step runs
    pub fn initial_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.expects.iter().cloned().collect();
        let mut guaranteed = self.triggers.iter().map(Trigger::guaranteed_keys);
        if let Some(first) = guaranteed.next() {
            keys.extend(guaranteed.fold(first, |acc, set| &acc & &set));
        }
        keys
    }

    /// Check the arena shape and the key flow
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CircuitError::Definition("circuit name must not be empty".into()));
        }
        if self.version == 0 {
            return Err(CircuitError::Definition(format!(
                "circuit '{}' version must be at least 1",
                self.name
            )));
        }
        if self.root.is_empty() {
            return Err(CircuitError::Definition(format!(
                "circuit '{}' has no actions",
                self.name
            )));
        }

        self.check_arena()?;

        let mut available = self.initial_keys();
        let mut names = HashSet::new();
        self.walk(&self.root, &mut available, &mut names)
    }

    fn check_arena(&self) -> Result<()> {
        let mut referenced = vec![0usize; self.nodes.len()];
        let mut edges: Vec<(Option<NodeId>, NodeId)> =
            self.root.iter().map(|&id| (None, id)).collect();

        for (parent, node) in self.nodes.iter().enumerate() {
            if let Node::Conditional(c) = node {
                edges.extend(
                    c.then_branch
                        .iter()
                        .chain(c.else_branch.iter())
                        .map(|&child| (Some(parent), child)),
                );
            }
        }

        for (parent, child) in edges {
            let slot = referenced.get_mut(child).ok_or_else(|| {
                CircuitError::Definition(format!("step index {} is out of range", child))
            })?;
            *slot += 1;
            if let Some(parent) = parent {
                if child >= parent {
                    return Err(CircuitError::Definition(format!(
                        "step {} refers forward to step {}",
                        parent, child
                    )));
                }
            }
        }

        if let Some(id) = referenced.iter().position(|&count| count != 1) {
            return Err(CircuitError::Definition(format!(
                "step '{}' must appear exactly once in the circuit",
                self.nodes[id].name()
            )));
        }
        Ok(())
    }

    fn walk(
        &self,
        ids: &[NodeId],
        available: &mut BTreeSet<String>,
        names: &mut HashSet<String>,
    ) -> Result<()> {
        for &id in ids {
            match &self.nodes[id] {
                Node::Action(spec) => {
                    self.check_action(spec, available, names)?;
                    if let Some(output) = &spec.output {
                        available.insert(output.clone());
                    }
                    if let Some(compensation) = &spec.compensation {
                        // compensation runs after the action, so it may read its output
                        self.check_action(compensation, available, names)?;
                    }
                }
                Node::Conditional(c) => {
                    self.claim_name(&c.name, names)?;
                    for key in c.predicate.required_keys() {
                        if !available.contains(key) {
                            return Err(CircuitError::Definition(format!(
                                "conditional '{}' reads '{}' which no upstream step produces",
                                c.name, key
                            )));
                        }
                    }

                    let mut then_keys = available.clone();
                    self.walk(&c.then_branch, &mut then_keys, names)?;
                    let mut else_keys = available.clone();
                    self.walk(&c.else_branch, &mut else_keys, names)?;

                    *available = &then_keys & &else_keys;
                }
            }
        }
        Ok(())
    }

    fn check_action(
        &self,
        spec: &ActionSpec,
        available: &BTreeSet<String>,
        names: &mut HashSet<String>,
    ) -> Result<()> {
        self.claim_name(&spec.name, names)?;
        for input in &spec.inputs {
            if !available.contains(input) {
                return Err(CircuitError::Definition(format!(
                    "action '{}' needs '{}' which no upstream step produces",
                    spec.name, input
                )));
            }
        }
        Ok(())
    }

    fn claim_name(&self, name: &str, names: &mut HashSet<String>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CircuitError::Definition(format!(
                "circuit '{}' has a step without a name",
                self.name
            )));
        }
        if !names.insert(name.to_string()) {
            return Err(CircuitError::Definition(format!(
                "step name '{}' is used more than once in circuit '{}'",
                name, self.name
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> CircuitSummary {
        CircuitSummary {
            name: self.name.clone(),
            version: self.version,
            description: self.description.clone(),
            triggers: self.triggers.clone(),
            expects: self.expects.clone(),
            on_failure: self.on_failure,
            budget: self.budget,
            steps: self.step_names(),
        }
    }
}

/// Listing view of a registered circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSummary {
    pub name: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub triggers: Vec<Trigger>,
    pub expects: Vec<String>,
    pub on_failure: OnFailure,
    #[serde(
        rename = "budget_ms",
        default,
        with = "duration_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub budget: Option<Duration>,
    pub steps: Vec<String>,
}
