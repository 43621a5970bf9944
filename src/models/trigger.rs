// Triggers - pure predicates over trigger events

//! # Triggers
//!
//! A [`Trigger`] decides whether a circuit fires for an event. Matching is a
//! pure function of the event, so the order in which the engine evaluates
//! triggers can never change which circuits run.
//!
//! - `Event` matches on the event kind plus an exact-match payload filter
//! - `All` / `Any` / `Not` compose other triggers
//!
//! ```
//! use circuit_script::models::{Trigger, TriggerEvent, EventKind};
//! use serde_json::json;
//!
//! let trigger = Trigger::on(EventKind::LeadCreated).with_filter("region", json!("emea"));
//! let event = TriggerEvent::new(EventKind::LeadCreated, "crm", json!({"region": "emea"}));
//! assert!(trigger.matches(&event));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::event::{EventKind, TriggerEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Matches when the kind is equal and every filter entry is present in
    /// the payload with an equal value
    Event {
        kind: EventKind,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        payload_filter: Map<String, Value>,
    },

    /// Every nested trigger matches. Empty matches everything.
    All { triggers: Vec<Trigger> },

    /// At least one nested trigger matches. Empty matches nothing.
    Any { triggers: Vec<Trigger> },

    /// The nested trigger does not match
    Not { trigger: Box<Trigger> },
}

impl Trigger {
    /// Simple trigger on an event kind with no payload filter
    pub fn on(kind: impl Into<EventKind>) -> Self {
        Trigger::Event {
            kind: kind.into(),
            payload_filter: Map::new(),
        }
    }

    /// Add a payload filter entry. Has no effect on composite triggers.
    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Trigger::Event { payload_filter, .. } = &mut self {
            payload_filter.insert(key.into(), value);
        }
        self
    }

    pub fn all(triggers: Vec<Trigger>) -> Self {
        Trigger::All { triggers }
    }

    pub fn any(triggers: Vec<Trigger>) -> Self {
        Trigger::Any { triggers }
    }

    pub fn not(trigger: Trigger) -> Self {
        Trigger::Not {
            trigger: Box::new(trigger),
        }
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match self {
            Trigger::Event {
                kind,
                payload_filter,
            } => {
                kind == event.kind()
                    && payload_filter
                        .iter()
                        .all(|(key, expected)| event.payload_value(key) == Some(expected))
            }
            Trigger::All { triggers } => triggers.iter().all(|t| t.matches(event)),
            Trigger::Any { triggers } => triggers.iter().any(|t| t.matches(event)),
            Trigger::Not { trigger } => !trigger.matches(event),
        }
    }

    /// Payload keys that are present whenever this trigger matches
    ///
    /// Used by key-flow validation: a circuit may read these keys without an
    /// upstream action producing them.
    pub fn guaranteed_keys(&self) -> BTreeSet<String> {
        match self {
            Trigger::Event { payload_filter, .. } => payload_filter.keys().cloned().collect(),
            Trigger::All { triggers } => triggers
                .iter()
                .flat_map(|t| t.guaranteed_keys())
                .collect(),
            Trigger::Any { triggers } => {
                let mut sets = triggers.iter().map(Trigger::guaranteed_keys);
                match sets.next() {
                    Some(first) => sets.fold(first, |acc, set| &acc & &set),
                    None => BTreeSet::new(),
                }
            }
            Trigger::Not { .. } => BTreeSet::new(),
        }
    }
}
