// Execution records - the append-only history of circuit runs

//! # Execution Records
//!
//! One [`ExecutionRecord`] is produced per circuit run, whatever happened
//! during it. Failure is carried in the record's `status`, so callers always
//! get a record list back even when individual runs failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::action::{ActionResult, ErrorKind, SkipReason};
use super::context::ContextSnapshot;
use super::event::EventSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Ok,
    Failed,
    Skipped,
    TimedOut,
    Unauthorized,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Ok => "ok",
            ActionOutcome::Failed => "failed",
            ActionOutcome::Skipped => "skipped",
            ActionOutcome::TimedOut => "timed_out",
            ActionOutcome::Unauthorized => "unauthorized",
        }
    }

    /// Failed, timed out and unauthorized all count as failures for the
    /// on-failure policy
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ActionOutcome::Failed | ActionOutcome::TimedOut | ActionOutcome::Unauthorized
        )
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Failed,
    Partial,
    Compensated,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
            RunStatus::Compensated => "compensated",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(RunStatus::Ok),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            "compensated" => Ok(RunStatus::Compensated),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Which branch a conditional step took
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Then,
    Else,
}

/// Per-action entry of an execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub name: String,
    pub outcome: ActionOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
    #[serde(default)]
    pub attempts: u32,
}

impl ActionRecord {
    pub fn skipped(name: impl Into<String>, reason: &SkipReason) -> Self {
        Self {
            name: name.into(),
            outcome: ActionOutcome::Skipped,
            duration_ms: 0,
            error_kind: None,
            message: None,
            reason: Some(reason.to_string()),
            branch: None,
            attempts: 0,
        }
    }

    /// Build a record from the final result of an action
    pub fn from_result(name: impl Into<String>, result: &ActionResult, duration_ms: u64, attempts: u32) -> Self {
        let mut record = Self {
            name: name.into(),
            outcome: ActionOutcome::Ok,
            duration_ms,
            error_kind: None,
            message: None,
            reason: None,
            branch: None,
            attempts,
        };

        match result {
            ActionResult::Ok { .. } => {}
            ActionResult::Failed(failure) => {
                record.outcome = match failure.kind {
                    ErrorKind::Timeout => ActionOutcome::TimedOut,
                    ErrorKind::Unauthorized => ActionOutcome::Unauthorized,
                    _ => ActionOutcome::Failed,
                };
                record.error_kind = Some(failure.kind);
                record.message = Some(failure.message.clone());
            }
            ActionResult::Skipped { reason } => {
                record.outcome = ActionOutcome::Skipped;
                record.reason = Some(reason.to_string());
            }
        }
        record
    }

    pub fn skip_reason_is(&self, reason: &SkipReason) -> bool {
        self.outcome == ActionOutcome::Skipped && self.reason.as_deref() == Some(&reason.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub circuit: String,
    pub version: u32,
    pub correlation_id: String,
    pub status: RunStatus,
    pub trigger: EventSummary,
    pub actions: Vec<ActionRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations: Vec<ActionRecord>,
    /// Set when the run itself broke rather than one of its actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSnapshot>,
}

impl ExecutionRecord {
    /// Record for a run that broke inside the engine rather than in an action
    pub fn internal_error(
        circuit: &str,
        version: u32,
        correlation_id: &str,
        trigger: EventSummary,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            circuit: circuit.to_string(),
            version,
            correlation_id: correlation_id.to_string(),
            status: RunStatus::Failed,
            trigger,
            actions: Vec::new(),
            compensations: Vec::new(),
            error_kind: Some(ErrorKind::InternalError),
            error: Some(message.into()),
            duration_ms,
            started_at,
            finished_at: Utc::now(),
            context: None,
        }
    }

    pub fn action(&self, name: &str) -> Option<&ActionRecord> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn failures(&self) -> usize {
        self.actions.iter().filter(|a| a.outcome.is_failure()).count()
    }
}

/// How much of the final context is kept in history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    #[default]
    Full,
    Keys,
    None,
}

impl SnapshotPolicy {
    pub fn apply(&self, snapshot: ContextSnapshot) -> Option<ContextSnapshot> {
        match self {
            SnapshotPolicy::Full => Some(snapshot),
            SnapshotPolicy::Keys => Some(snapshot.elide()),
            SnapshotPolicy::None => None,
        }
    }
}

impl FromStr for SnapshotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SnapshotPolicy::Full),
            "keys" => Ok(SnapshotPolicy::Keys),
            "none" => Ok(SnapshotPolicy::None),
            other => Err(format!("unknown snapshot policy '{}'", other)),
        }
    }
}

/// Filter over history
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryFilter {
    pub circuit_name: Option<String>,
    pub status: Option<RunStatus>,
}

impl HistoryFilter {
    pub fn circuit(name: impl Into<String>) -> Self {
        Self {
            circuit_name: Some(name.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn accepts(&self, record: &ExecutionRecord) -> bool {
        self.circuit_name
            .as_ref()
            .map_or(true, |name| &record.circuit == name)
            && self.status.map_or(true, |status| record.status == status)
    }
}
