// Per-run procedure: walk one circuit against one execution context

//! # Runner
//!
//! A [`Run`] owns the [`ExecutionContext`] of a single circuit run and walks
//! the circuit's steps strictly in order. For every action it performs the
//! pre-dispatch checks, in this order:
//!
//! 1. cancellation: a cancelled run marks the action `skipped(cancellation)`
//! 2. inputs: every declared key must be present, else `missing_input`
//! 3. authorization: a permission tag is checked against the hook
//! 4. the retry loop: each attempt runs under the per-action timeout; only
//!    recoverable failures are retried, after a jittered backoff
//!
//! Waiting on a handler or a backoff is a suspension point. The runner races
//! both against the cancellation token, so a budget expiry or a caller's
//! cancel is observed there rather than after the action finishes.
//!
//! ## Rust Learning Notes:
//!
//! ### Recursive async
//! Conditionals nest step sequences, so walking them is recursive. An
//! `async fn` cannot call itself directly (its future would have infinite
//! size); `run_steps` returns a boxed future instead.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::{error::Elapsed, Instant};
use tracing::{field, info_span, Instrument};

use super::observe::{Observer, RunInfo};
use super::scheduler::EngineConfig;
use crate::models::{
    ActionOutcome, ActionRecord, ActionResult, ActionSpec, Branch, Circuit, ErrorKind,
    ExecutionContext, ExecutionRecord, LogLevel, Node, NodeId, OnFailure, RunStatus, SkipReason,
};

pub(crate) struct Run<'a> {
    circuit: &'a Circuit,
    config: &'a EngineConfig,
    observer: &'a dyn Observer,
    info: RunInfo,
    ctx: ExecutionContext,
    actions: Vec<ActionRecord>,
    compensations: Vec<ActionRecord>,
    /// Actions that finished ok, in execution order
    succeeded: Vec<&'a ActionSpec>,
    /// Remaining steps are skipped as `upstream_failure`
    halted: bool,
    aborted: bool,
    compensated: bool,
}

impl<'a> Run<'a> {
    pub(crate) fn new(
        circuit: &'a Circuit,
        config: &'a EngineConfig,
        observer: &'a dyn Observer,
        ctx: ExecutionContext,
    ) -> Self {
        let info = RunInfo {
            circuit: circuit.name.clone(),
            version: circuit.version,
            correlation_id: ctx.correlation_id().to_string(),
            trigger: ctx.event().kind().clone(),
        };

        Self {
            circuit,
            config,
            observer,
            info,
            ctx,
            actions: Vec::new(),
            compensations: Vec::new(),
            succeeded: Vec::new(),
            halted: false,
            aborted: false,
            compensated: false,
        }
    }

    pub(crate) async fn execute(mut self) -> ExecutionRecord {
        let started = Instant::now();
        let span = info_span!(
            "circuit.run",
            circuit = %self.info.circuit,
            version = self.info.version,
            correlation_id = %self.info.correlation_id,
            trigger = %self.info.trigger,
            status = field::Empty,
        );

        self.observer.run_started(&self.info);
        self.ctx.info(format!(
            "circuit {} v{} started by {}",
            self.info.circuit, self.info.version, self.info.trigger
        ));

        let circuit = self.circuit;
        self.run_steps(circuit.root()).instrument(span.clone()).await;

        let status = self.status();
        span.record("status", status.as_str());
        self.finish(started, status)
    }

    fn run_steps(&mut self, ids: &'a [NodeId]) -> BoxFuture<'_, ()> {
        async move {
            let circuit = self.circuit;
            for &id in ids {
                let node = match circuit.node(id) {
                    Some(node) => node,
                    None => continue,
                };

                if self.halted {
                    self.skip_node(node, &SkipReason::UpstreamFailure);
                    continue;
                }

                match node {
                    Node::Action(spec) => {
                        let record = self.run_action(spec).await;
                        let outcome = record.outcome;
                        self.actions.push(record);

                        if outcome == ActionOutcome::Ok {
                            self.succeeded.push(spec);
                        } else if outcome.is_failure() {
                            self.handle_failure().await;
                        }
                    }
                    Node::Conditional(conditional) => {
                        if self.ctx.is_cancelled() {
                            self.skip_node(node, &SkipReason::Cancellation);
                            continue;
                        }

                        let taken = conditional.predicate.evaluate(self.ctx.state());
                        let mut record =
                            ActionRecord::from_result(&conditional.name, &ActionResult::done(), 0, 0);
                        record.branch = Some(if taken { Branch::Then } else { Branch::Else });
                        self.ctx.log(
                            LogLevel::Debug,
                            format!("conditional {} evaluated", conditional.name),
                            fields(&[("taken", json!(taken))]),
                        );
                        self.observer.action_finished(&self.info, &record);
                        self.actions.push(record);

                        // records stay in declaration order whichever branch runs
                        if taken {
                            self.run_steps(&conditional.then_branch).await;
                            self.skip_steps(&conditional.else_branch, &SkipReason::BranchNotTaken);
                        } else {
                            self.skip_steps(&conditional.then_branch, &SkipReason::BranchNotTaken);
                            self.run_steps(&conditional.else_branch).await;
                        }
                    }
                }
            }
        }
        .boxed()
    }

    async fn run_action(&mut self, spec: &'a ActionSpec) -> ActionRecord {
        let started = Instant::now();
        let span = info_span!("action", action.name = %spec.name, outcome = field::Empty);
        self.observer.action_started(&self.info, &spec.name);

        let (mut result, attempts) = self.attempt(spec, true).instrument(span.clone()).await;

        // nothing is written once the run is cancelled
        if result.is_ok() && self.ctx.is_cancelled() {
            result = ActionResult::cancelled();
        }
        if let (ActionResult::Ok { output: Some(value) }, Some(key)) = (&result, &spec.output) {
            self.ctx.put(key.clone(), value.clone());
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.ctx.record_timing(&spec.name, started, duration_ms);

        let record = ActionRecord::from_result(&spec.name, &result, duration_ms, attempts);
        span.record("outcome", record.outcome.as_str());
        self.log_outcome(&record);
        self.observer.action_finished(&self.info, &record);
        record
    }

    /// Pre-dispatch checks and the retry loop; returns the final result and
    /// the number of attempts made
    async fn attempt(&self, spec: &ActionSpec, honor_cancellation: bool) -> (ActionResult, u32) {
        let cancellation = self.ctx.cancellation().clone();
        if honor_cancellation && cancellation.is_cancelled() {
            return (ActionResult::cancelled(), 0);
        }

        let missing: Vec<&str> = spec
            .inputs
            .iter()
            .filter(|key| !self.ctx.has(key))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return (
                ActionResult::failed(
                    ErrorKind::MissingInput,
                    format!("missing input: {}", missing.join(", ")),
                    false,
                ),
                0,
            );
        }

        if let Some(permission) = &spec.permission {
            let principal = self.ctx.principal();
            if !self.ctx.authorizer().is_allowed(principal, permission).await {
                return (
                    ActionResult::failed(
                        ErrorKind::Unauthorized,
                        format!("principal '{}' lacks permission '{}'", principal, permission),
                        false,
                    ),
                    0,
                );
            }
            if honor_cancellation && cancellation.is_cancelled() {
                return (ActionResult::cancelled(), 0);
            }
        }

        let policy = spec.retry.unwrap_or(self.config.retry);
        let max_attempts = policy.max_attempts.min(self.config.retry.max_attempts).max(1);
        let timeout = spec.timeout.unwrap_or(self.config.action_timeout);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = tokio::time::timeout(timeout, spec.handler.execute(&self.ctx));
            let result = if honor_cancellation {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => ActionResult::cancelled(),
                    outcome = call => settle(outcome, timeout),
                }
            } else {
                settle(call.await, timeout)
            };

            if attempt >= max_attempts || !result.is_recoverable_failure() {
                return (result, attempt);
            }

            if let ActionResult::Failed(failure) = &result {
                self.observer
                    .action_retry(&self.info, &spec.name, attempt, failure);
            }

            let delay = policy.backoff.delay(attempt);
            if honor_cancellation {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return (ActionResult::cancelled(), attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn handle_failure(&mut self) {
        match self.circuit.on_failure {
            OnFailure::Abort => {
                // halt this walk only; the token belongs to the caller and the budget
                self.halted = true;
                self.aborted = true;
            }
            OnFailure::Continue => {}
            OnFailure::Compensate => {
                self.halted = true;
                self.compensated = true;
                self.compensate().await;
            }
        }
    }

    /// Run declared compensations of succeeded actions, newest first
    ///
    /// Best effort: a failing compensation is recorded and the rest still
    /// run. Cancellation is not consulted.
    async fn compensate(&mut self) {
        let succeeded = std::mem::take(&mut self.succeeded);
        for spec in succeeded.into_iter().rev() {
            if let Some(compensation) = spec.compensation.as_deref() {
                let started = Instant::now();
                self.observer.action_started(&self.info, &compensation.name);

                let (result, attempts) = self.attempt(compensation, false).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                let record =
                    ActionRecord::from_result(&compensation.name, &result, duration_ms, attempts);

                self.log_outcome(&record);
                self.observer.action_finished(&self.info, &record);
                self.compensations.push(record);
            }
        }
    }

    fn skip_steps(&mut self, ids: &[NodeId], reason: &SkipReason) {
        let circuit = self.circuit;
        for &id in ids {
            if let Some(node) = circuit.node(id) {
                self.skip_node(node, reason);
            }
        }
    }

    fn skip_node(&mut self, node: &Node, reason: &SkipReason) {
        let record = ActionRecord::skipped(node.name(), reason);
        self.observer.action_finished(&self.info, &record);
        self.actions.push(record);

        if let Node::Conditional(conditional) = node {
            self.skip_steps(&conditional.then_branch, reason);
            self.skip_steps(&conditional.else_branch, reason);
        }
    }

    fn log_outcome(&self, record: &ActionRecord) {
        let level = match record.outcome {
            ActionOutcome::Ok => LogLevel::Info,
            ActionOutcome::Skipped => LogLevel::Debug,
            _ => LogLevel::Warn,
        };
        let mut entry = fields(&[
            ("outcome", json!(record.outcome)),
            ("attempts", json!(record.attempts)),
            ("duration_ms", json!(record.duration_ms)),
        ]);
        if let Some(kind) = record.error_kind {
            entry.insert("error_kind".into(), json!(kind));
        }
        self.ctx
            .log(level, format!("action {} {}", record.name, record.outcome), entry);
    }

    fn status(&self) -> RunStatus {
        if self.compensated {
            RunStatus::Compensated
        } else if self.aborted {
            RunStatus::Failed
        } else if self
            .actions
            .iter()
            .any(|a| a.skip_reason_is(&SkipReason::Cancellation))
        {
            RunStatus::Cancelled
        } else if self.actions.iter().any(|a| a.outcome.is_failure()) {
            RunStatus::Partial
        } else {
            RunStatus::Ok
        }
    }

    fn finish(self, started: Instant, status: RunStatus) -> ExecutionRecord {
        let duration_ms = started.elapsed().as_millis() as u64;
        let level = match status {
            RunStatus::Ok => LogLevel::Info,
            _ => LogLevel::Warn,
        };
        self.ctx.log(
            level,
            format!("circuit {} finished", self.info.circuit),
            fields(&[("status", json!(status))]),
        );

        let trigger = self.ctx.event().summary();
        let started_at = self.ctx.started_at();
        let context = self.config.snapshot_policy.apply(self.ctx.snapshot());

        ExecutionRecord {
            circuit: self.info.circuit,
            version: self.info.version,
            correlation_id: self.info.correlation_id,
            status,
            trigger,
            actions: self.actions,
            compensations: self.compensations,
            error_kind: None,
            error: None,
            duration_ms,
            started_at,
            finished_at: Utc::now(),
            context,
        }
    }
}

fn settle(outcome: Result<ActionResult, Elapsed>, timeout: Duration) -> ActionResult {
    outcome.unwrap_or_else(|_| {
        ActionResult::failed(
            ErrorKind::Timeout,
            format!("attempt exceeded {}ms", timeout.as_millis()),
            true,
        )
    })
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
