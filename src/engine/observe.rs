// Observability hooks for circuit runs

//! # Observers
//!
//! The engine reports every run through an [`Observer`]. All methods have
//! no-op defaults, so an implementation only overrides what it cares about.
//! Hooks are synchronous and must not block; anything slow belongs behind a
//! channel.
//!
//! Call order for one run:
//! 1. `run_started`
//! 2. per action: `action_started`, any number of `action_retry`, then
//!    `action_finished` (skipped actions only get `action_finished`)
//! 3. `run_finished` with the assembled record

use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{ActionFailure, ActionRecord, EventKind, ExecutionRecord, RunStatus};

/// Identity of the run a hook fires for
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub circuit: String,
    pub version: u32,
    pub correlation_id: String,
    pub trigger: EventKind,
}

pub trait Observer: Send + Sync {
    fn run_started(&self, _run: &RunInfo) {}

    fn action_started(&self, _run: &RunInfo, _action: &str) {}

    fn action_retry(&self, _run: &RunInfo, _action: &str, _attempt: u32, _failure: &ActionFailure) {}

    fn action_finished(&self, _run: &RunInfo, _record: &ActionRecord) {}

    fn run_finished(&self, _record: &ExecutionRecord) {}
}

/// Discards everything; the engine default
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Writes run outcomes to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn action_retry(&self, run: &RunInfo, action: &str, attempt: u32, failure: &ActionFailure) {
        warn!(
            circuit = %run.circuit,
            correlation_id = %run.correlation_id,
            action,
            attempt,
            error_kind = %failure.kind,
            "retrying action: {}",
            failure.message
        );
    }

    fn action_finished(&self, run: &RunInfo, record: &ActionRecord) {
        if record.outcome.is_failure() {
            warn!(
                circuit = %run.circuit,
                correlation_id = %run.correlation_id,
                action = %record.name,
                outcome = %record.outcome,
                attempts = record.attempts,
                "action failed: {}",
                record.message.as_deref().unwrap_or("")
            );
        }
    }

    fn run_finished(&self, record: &ExecutionRecord) {
        let skipped = record
            .actions
            .iter()
            .filter(|a| a.outcome == crate::models::ActionOutcome::Skipped)
            .count();

        match record.status {
            RunStatus::Failed if record.error.is_some() => tracing::error!(
                circuit = %record.circuit,
                version = record.version,
                correlation_id = %record.correlation_id,
                error = record.error.as_deref().unwrap_or(""),
                "circuit run broke"
            ),
            _ => info!(
                circuit = %record.circuit,
                version = record.version,
                correlation_id = %record.correlation_id,
                status = %record.status,
                actions = record.actions.len(),
                failures = record.failures(),
                skipped,
                compensations = record.compensations.len(),
                duration_ms = record.duration_ms,
                "circuit run finished"
            ),
        }
    }
}

/// Forwards every hook to each observer in order
#[derive(Clone, Default)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Observer for FanoutObserver {
    fn run_started(&self, run: &RunInfo) {
        self.observers.iter().for_each(|o| o.run_started(run));
    }

    fn action_started(&self, run: &RunInfo, action: &str) {
        self.observers.iter().for_each(|o| o.action_started(run, action));
    }

    fn action_retry(&self, run: &RunInfo, action: &str, attempt: u32, failure: &ActionFailure) {
        self.observers
            .iter()
            .for_each(|o| o.action_retry(run, action, attempt, failure));
    }

    fn action_finished(&self, run: &RunInfo, record: &ActionRecord) {
        self.observers.iter().for_each(|o| o.action_finished(run, record));
    }

    fn run_finished(&self, record: &ExecutionRecord) {
        self.observers.iter().for_each(|o| o.run_finished(record));
    }
}

/// Records every hook call; used by tests across the crate
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub events: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
impl Observer for RecordingObserver {
    fn run_started(&self, run: &RunInfo) {
        self.push(format!("run_started:{}", run.circuit));
    }

    fn action_started(&self, _run: &RunInfo, action: &str) {
        self.push(format!("action_started:{}", action));
    }

    fn action_retry(&self, _run: &RunInfo, action: &str, attempt: u32, _failure: &ActionFailure) {
        self.push(format!("action_retry:{}:{}", action, attempt));
    }

    fn action_finished(&self, _run: &RunInfo, record: &ActionRecord) {
        self.push(format!("action_finished:{}:{}", record.name, record.outcome));
    }

    fn run_finished(&self, record: &ExecutionRecord) {
        self.push(format!("run_finished:{}:{}", record.circuit, record.status));
    }
}
