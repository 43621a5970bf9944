// Trigger events - the immutable descriptors that start circuit runs

//! # Trigger Events
//!
//! A [`TriggerEvent`] describes something that happened outside the engine
//! (a lead was created, a cadence ticked, a webhook arrived). The API layer
//! builds one, the engine consumes it, and nobody mutates it afterwards: the
//! fields are private and the engine shares the event behind an `Arc`.
//!
//! ## Wire Shape
//!
//! ```json
//! { "kind": "lead_created",
//!   "source": "crm",
//!   "correlation_id": "uuid",
//!   "ts": "2024-01-01T00:00:00Z",
//!   "payload": { "lead_id": "L1" } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event kind tag
///
/// The vocabulary is fixed for the sales automation events the engine knows
/// about; anything else travels as [`EventKind::Custom`] and keeps its tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    LeadCreated,
    LeadScored,
    OpportunityUpdated,
    CadenceTick,
    ExternalWebhook,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::LeadCreated => "lead_created",
            EventKind::LeadScored => "lead_scored",
            EventKind::OpportunityUpdated => "opportunity_updated",
            EventKind::CadenceTick => "cadence_tick",
            EventKind::ExternalWebhook => "external_webhook",
            EventKind::Custom(tag) => tag,
        }
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        match tag {
            "lead_created" => EventKind::LeadCreated,
            "lead_scored" => EventKind::LeadScored,
            "opportunity_updated" => EventKind::OpportunityUpdated,
            "cadence_tick" => EventKind::CadenceTick,
            "external_webhook" => EventKind::ExternalWebhook,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        EventKind::from(tag.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_source() -> String {
    "api".to_string()
}

fn default_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Immutable descriptor of an incoming event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    kind: EventKind,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default = "Utc::now")]
    ts: DateTime<Utc>,
    #[serde(default = "default_payload")]
    payload: serde_json::Value,
    /// Principal the event acts on behalf of, if the caller supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    principal: Option<String>,
}

impl TriggerEvent {
    /// Create an event stamped with the current time
    pub fn new(kind: impl Into<EventKind>, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            correlation_id: None,
            ts: Utc::now(),
            payload,
            principal: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Look up a top-level payload entry
    pub fn payload_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// Short form stored in execution records
    pub fn summary(&self) -> EventSummary {
        EventSummary {
            kind: self.kind.clone(),
            source: self.source.clone(),
            ts: self.ts,
        }
    }
}

/// The part of a trigger event kept in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub kind: EventKind,
    pub source: String,
    pub ts: DateTime<Utc>,
}
