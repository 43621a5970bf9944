// Execution context - the per-run scratchpad

//! # Execution Context
//!
//! Every circuit run owns exactly one [`ExecutionContext`]. Actions read
//! their declared inputs from it, the engine writes action outputs into it,
//! and the whole thing is snapshotted into history when the run ends.
//!
//! ## Ownership
//!
//! The engine owns the context for the duration of one run and hands
//! actions a shared reference. Only the engine mutates `state`, and only
//! between actions, so a run never sees concurrent writers. Two pieces are
//! reachable through `&self`:
//! - the structured log, behind a mutex so actions can append entries
//! - the cancellation token, which is shared with the budget timer and with
//!   callers holding a run handle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::event::TriggerEvent;
use crate::engine::authz::AuthorizationHook;

/// Identity an action runs on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == Self::ANONYMOUS
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured entry in the context log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic within one run, starting at 1
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// Wall-clock timing of one step, relative to the run start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub name: String,
    pub offset_ms: u64,
    pub duration_ms: u64,
}

/// Immutable view of a context, as stored in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    /// Full state, or `None` when the snapshot was elided to its keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
    pub keys: Vec<String>,
    pub log: Vec<LogEntry>,
    pub timings: Vec<StepTiming>,
}

impl ContextSnapshot {
    /// Drop the state values, keeping only the key names
    pub fn elide(mut self) -> Self {
        self.state = None;
        self
    }
}

pub struct ExecutionContext {
    correlation_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Map<String, Value>,
    log: Mutex<Vec<LogEntry>>,
    timings: Vec<StepTiming>,
    cancellation: CancellationToken,
    event: Arc<TriggerEvent>,
    principal: Principal,
    authorizer: Arc<dyn AuthorizationHook>,
}

impl ExecutionContext {
    /// Allocate a context for one run of `event`
    ///
    /// The top-level entries of an object payload are copied into state so
    /// that actions can declare payload fields as inputs.
    pub fn new(
        event: Arc<TriggerEvent>,
        correlation_id: impl Into<String>,
        authorizer: Arc<dyn AuthorizationHook>,
        cancellation: CancellationToken,
    ) -> Self {
        let state = event.payload().as_object().cloned().unwrap_or_default();
        let principal = event
            .principal()
            .map(Principal::new)
            .unwrap_or_else(Principal::anonymous);

        Self {
            correlation_id: correlation_id.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            state,
            log: Mutex::new(Vec::new()),
            timings: Vec::new(),
            cancellation,
            event,
            principal,
            authorizer,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn event(&self) -> &TriggerEvent {
        &self.event
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn authorizer(&self) -> &Arc<dyn AuthorizationHook> {
        &self.authorizer
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    /// Write a value; an existing value under the same key is overwritten
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    /// Append a structured log entry and return its sequence number
    pub fn log(&self, level: LogLevel, message: impl Into<String>, fields: Map<String, Value>) -> u64 {
        let mut log = self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = log.len() as u64 + 1;
        log.push(LogEntry {
            seq,
            at: Utc::now(),
            level,
            message: message.into(),
            fields,
        });
        seq
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.log(LogLevel::Info, message, Map::new())
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn record_timing(&mut self, name: &str, started: Instant, duration_ms: u64) {
        let offset_ms = started.saturating_duration_since(self.started).as_millis() as u64;
        self.timings.push(StepTiming {
            name: name.to_string(),
            offset_ms,
            duration_ms,
        });
    }

    /// Flag the run as cancelled
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Token shared with the budget timer and run handles
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            correlation_id: self.correlation_id.clone(),
            started_at: self.started_at,
            elapsed_ms: self.elapsed_ms(),
            cancelled: self.is_cancelled(),
            state: Some(self.state.clone()),
            keys: self.state.keys().cloned().collect(),
            log: self.log_entries(),
            timings: self.timings.clone(),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("correlation_id", &self.correlation_id)
            .field("principal", &self.principal)
            .field("keys", &self.state.keys().collect::<Vec<_>>())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
