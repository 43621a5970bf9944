// Action domain models - units of work inside a circuit

//! # Actions
//!
//! An action is a declarative description ([`ActionSpec`]) plus the code
//! that does the work ([`ActionHandler`]). The description tells the engine
//! everything it checks before dispatch:
//! - which context keys must exist (`inputs`) and where the output goes
//! - whether a permission is required
//! - how long one attempt may take and how failures are retried
//!
//! The handler only does the work. It never writes to the context; it
//! returns an [`ActionResult`] and the engine stores the output.
//!
//! ## Result Variants
//!
//! - `Ok { output }`: success, with an optional JSON output
//! - `Failed(ActionFailure)`: an [`ErrorKind`], message and `recoverable` flag
//! - `Skipped { reason }`: nothing was done

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::context::ExecutionContext;

/// Action type names
///
/// A tagged variant over the built-in catalog, plus `Extension` for types
/// registered by users at startup. The string name is what travels over the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    FetchData,
    ScrapeWeb,
    NewsSearch,
    RagQuery,
    PredictScore,
    CompetitorQuery,
    CrmWrite,
    SlackNotify,
    Log,
    Extension(String),
}

impl ActionType {
    pub const BUILTINS: [ActionType; 9] = [
        ActionType::FetchData,
        ActionType::ScrapeWeb,
        ActionType::NewsSearch,
        ActionType::RagQuery,
        ActionType::PredictScore,
        ActionType::CompetitorQuery,
        ActionType::CrmWrite,
        ActionType::SlackNotify,
        ActionType::Log,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            ActionType::FetchData => "fetch_data",
            ActionType::ScrapeWeb => "scrape_web",
            ActionType::NewsSearch => "news_search",
            ActionType::RagQuery => "rag_query",
            ActionType::PredictScore => "predict_score",
            ActionType::CompetitorQuery => "competitor_query",
            ActionType::CrmWrite => "crm_write",
            ActionType::SlackNotify => "slack_notify",
            ActionType::Log => "log",
            ActionType::Extension(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::BUILTINS
            .iter()
            .find(|builtin| builtin.as_str() == name)
            .cloned()
            .unwrap_or_else(|| ActionType::Extension(name.to_string()))
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, ActionType::Extension(_))
    }
}

impl From<String> for ActionType {
    fn from(name: String) -> Self {
        ActionType::from_name(&name)
    }
}

impl From<ActionType> for String {
    fn from(action_type: ActionType) -> Self {
        action_type.as_str().to_string()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Fetch,
    Enrich,
    Predict,
    Decide,
    Notify,
    Persist,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Pure,
    ExternalRead,
    ExternalWrite,
}

/// Error taxonomy, with stable snake_case strings on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DefinitionError,
    MissingInput,
    Unauthorized,
    Timeout,
    ExternalError,
    Cancelled,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DefinitionError => "definition_error",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExternalError => "external_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an action did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cancellation,
    BranchNotTaken,
    UpstreamFailure,
    /// Reason given by the action itself
    Other(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Cancellation => f.write_str("cancellation"),
            SkipReason::BranchNotTaken => f.write_str("branch_not_taken"),
            SkipReason::UpstreamFailure => f.write_str("upstream_failure"),
            SkipReason::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
    Ok { output: Option<Value> },
    Failed(ActionFailure),
    Skipped { reason: SkipReason },
}

impl ActionResult {
    pub fn ok(output: Value) -> Self {
        ActionResult::Ok {
            output: Some(output),
        }
    }

    pub fn done() -> Self {
        ActionResult::Ok { output: None }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        ActionResult::Failed(ActionFailure {
            kind,
            message: message.into(),
            recoverable,
        })
    }

    /// Upstream failure reported by an action
    pub fn external(message: impl Into<String>, recoverable: bool) -> Self {
        Self::failed(ErrorKind::ExternalError, message, recoverable)
    }

    pub fn skipped(reason: SkipReason) -> Self {
        ActionResult::Skipped { reason }
    }

    /// What an action returns when it resumes into a cancelled context
    pub fn cancelled() -> Self {
        Self::skipped(SkipReason::Cancellation)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ActionResult::Ok { .. })
    }

    pub fn is_recoverable_failure(&self) -> bool {
        matches!(self, ActionResult::Failed(failure) if failure.recoverable)
    }
}

/// Exponential backoff with jitter
///
/// Delay before retry `n` (1-based) is `base * factor^(n-1)`, scaled by a
/// random factor in `[1 - jitter, 1 + jitter]` and capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(rename = "base_ms", with = "duration_ms")]
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    #[serde(rename = "cap_ms", with = "duration_ms")]
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2.0,
            jitter: 0.2,
            cap: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay before the given retry, without jitter
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let millis = self.base.as_millis() as f64 * self.factor.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.cap.as_millis() as f64) as u64)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let scale = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let millis = (nominal * scale).min(self.cap.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(flatten)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// The executable half of an action
///
/// `execute` may suspend. Every suspension is a cancellation checkpoint: on
/// resume, an implementation should return [`ActionResult::cancelled`] if
/// `ctx.is_cancelled()`.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> ActionResult;
}

/// Declarative description of one action in a circuit
#[derive(Clone)]
pub struct ActionSpec {
    pub name: String,
    pub action_type: ActionType,
    pub kind: ActionKind,
    pub inputs: Vec<String>,
    pub output: Option<String>,
    pub idempotency: Idempotency,
    pub permission: Option<String>,
    /// Per-attempt timeout; the engine default applies when unset
    pub timeout: Option<Duration>,
    /// Retry policy; the engine default applies when unset
    pub retry: Option<RetryPolicy>,
    pub side_effect: SideEffect,
    pub compensation: Option<Box<ActionSpec>>,
    pub params: Value,
    pub handler: Arc<dyn ActionHandler>,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, action_type: ActionType, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.into(),
            action_type,
            kind: ActionKind::Decide,
            inputs: Vec::new(),
            output: None,
            idempotency: Idempotency::Idempotent,
            permission: None,
            timeout: None,
            retry: None,
            side_effect: SideEffect::Pure,
            compensation: None,
            params: Value::Null,
            handler,
        }
    }

    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.output = Some(key.into());
        self
    }

    pub fn with_permission(mut self, tag: impl Into<String>) -> Self {
        self.permission = Some(tag.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
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

    pub fn with_compensation(mut self, compensation: ActionSpec) -> Self {
        self.compensation = Some(Box::new(compensation));
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

impl fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("action_type", &self.action_type)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("permission", &self.permission)
            .field("side_effect", &self.side_effect)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

/// Serde helpers for durations carried as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
