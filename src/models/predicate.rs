// Predicates over execution context state

//! # Context Predicates
//!
//! Conditional steps in a circuit choose their branch with a [`Predicate`].
//! Predicates are a closed set of field checks combined with AND, OR and
//! NOT. They read the run's context state and nothing else, so evaluating
//! one can never change the run.
//!
//! ## Field Paths
//!
//! A field is a context key, optionally followed by dotted segments that
//! descend into JSON objects: `lead.score` reads the `score` entry of the
//! object stored under `lead`. Only the first segment takes part in
//! key-flow validation.
//!
//! `exists` is the one check that may name a key nothing guarantees: it is
//! how a circuit branches on an optional payload field, e.g.
//! `not(exists("unsubscribed"))`. Every other check needs its key upstream.
//!
//! ## JSON Form
//!
//! The `#[serde(tag = "type")]` attribute gives flat tagged objects:
//! `{"type": "greater_than", "field": "score", "value": 0.8}`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A condition evaluated against context state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// The field is present (any value, including null)
    Exists { field: String },

    /// The field equals the given JSON value exactly
    Equals { field: String, value: Value },

    /// The field is a number strictly greater than the threshold
    GreaterThan { field: String, value: f64 },

    /// The field is a number strictly less than the threshold
    LessThan { field: String, value: f64 },

    /// The field is a string containing the substring, or an array
    /// containing the string as an element
    Contains { field: String, substring: String },

    /// All nested predicates hold. Empty is true.
    All { predicates: Vec<Predicate> },

    /// At least one nested predicate holds. Empty is false.
    Any { predicates: Vec<Predicate> },

    /// The nested predicate does not hold
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn exists(field: impl Into<String>) -> Self {
        Predicate::Exists { field: field.into() }
    }

    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Predicate::Equals {
            field: field.into(),
            value,
        }
    }

    pub fn greater_than(field: impl Into<String>, value: f64) -> Self {
        Predicate::GreaterThan {
            field: field.into(),
            value,
        }
    }

    pub fn less_than(field: impl Into<String>, value: f64) -> Self {
        Predicate::LessThan {
            field: field.into(),
            value,
        }
    }

    pub fn contains(field: impl Into<String>, substring: impl Into<String>) -> Self {
        Predicate::Contains {
            field: field.into(),
            substring: substring.into(),
        }
    }

    /// Evaluate against a context state map
    pub fn evaluate(&self, state: &Map<String, Value>) -> bool {
        match self {
            Predicate::Exists { field } => lookup(state, field).is_some(),

            Predicate::Equals { field, value } => lookup(state, field) == Some(value),

            Predicate::GreaterThan { field, value } => lookup(state, field)
                .and_then(Value::as_f64)
                .map_or(false, |v| v > *value),

            Predicate::LessThan { field, value } => lookup(state, field)
                .and_then(Value::as_f64)
                .map_or(false, |v| v < *value),

            Predicate::Contains { field, substring } => match lookup(state, field) {
                Some(Value::String(s)) => s.contains(substring.as_str()),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str() == Some(substring.as_str())),
                _ => false,
            },

            Predicate::All { predicates } => predicates.iter().all(|p| p.evaluate(state)),

            Predicate::Any { predicates } => predicates.iter().any(|p| p.evaluate(state)),

            Predicate::Not { predicate } => !predicate.evaluate(state),
        }
    }

    /// Context keys this predicate reads (first path segment of each field)
    pub fn referenced_keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys
    }

    /// Keys that must be available before this predicate runs
    ///
    /// Same as [`referenced_keys`](Self::referenced_keys) minus the fields
    /// only probed by `exists`.
    pub fn required_keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        self.collect_required(&mut keys);
        keys
    }

    fn collect_required<'a>(&'a self, keys: &mut Vec<&'a str>) {
        match self {
            Predicate::Exists { .. } => {}
            Predicate::Equals { field, .. }
            | Predicate::GreaterThan { field, .. }
            | Predicate::LessThan { field, .. }
            | Predicate::Contains { field, .. } => keys.push(root_key(field)),
            Predicate::All { predicates } | Predicate::Any { predicates } => {
                for p in predicates {
                    p.collect_required(keys);
                }
            }
            Predicate::Not { predicate } => predicate.collect_required(keys),
        }
    }

    fn collect_keys<'a>(&'a self, keys: &mut Vec<&'a str>) {
        match self {
            Predicate::Exists { field }
            | Predicate::Equals { field, .. }
            | Predicate::GreaterThan { field, .. }
            | Predicate::LessThan { field, .. }
            | Predicate::Contains { field, .. } => keys.push(root_key(field)),
            Predicate::All { predicates } | Predicate::Any { predicates } => {
                for p in predicates {
                    p.collect_keys(keys);
                }
            }
            Predicate::Not { predicate } => predicate.collect_keys(keys),
        }
    }
}

/// First segment of a dotted field path
pub fn root_key(field: &str) -> &str {
    field.split('.').next().unwrap_or(field)
}

/// Resolve a dotted field path against a state map
pub fn lookup<'a>(state: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut segments = field.split('.');
    let first = segments.next()?;
    let mut current = state.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
