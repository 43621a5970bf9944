// Prometheus metrics observer

//! # Metrics
//!
//! [`CircuitMetrics`] is an [`Observer`] that feeds a private Prometheus
//! registry. The HTTP layer renders it at `/metrics` with [`CircuitMetrics::encode`].
//!
//! | metric | type | labels |
//! |---|---|---|
//! | `circuit_runs_started_total` | counter | |
//! | `actions_total` | counter | `name`, `outcome` |
//! | `action_duration_seconds` | histogram | `name` |
//! | `action_retries_total` | counter | `name` |
//! | `circuit_duration_seconds` | histogram | `circuit`, `status` |

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use super::observe::{Observer, RunInfo};
use crate::models::{ActionFailure, ActionRecord, ExecutionRecord};
use crate::Result;

const ACTION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const RUN_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

#[derive(Clone)]
pub struct CircuitMetrics {
    registry: Registry,
    runs_started: IntCounter,
    actions: IntCounterVec,
    action_duration: HistogramVec,
    action_retries: IntCounterVec,
    circuit_duration: HistogramVec,
}

impl CircuitMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_started = IntCounter::new(
            "circuit_runs_started_total",
            "Circuit runs started",
        )?;
        let actions = IntCounterVec::new(
            Opts::new("actions_total", "Actions finished, by outcome"),
            &["name", "outcome"],
        )?;
        let action_duration = HistogramVec::new(
            HistogramOpts::new("action_duration_seconds", "Action duration including retries")
                .buckets(ACTION_BUCKETS.to_vec()),
            &["name"],
        )?;
        let action_retries = IntCounterVec::new(
            Opts::new("action_retries_total", "Retries after recoverable failures"),
            &["name"],
        )?;
        let circuit_duration = HistogramVec::new(
            HistogramOpts::new("circuit_duration_seconds", "Circuit run duration")
                .buckets(RUN_BUCKETS.to_vec()),
            &["circuit", "status"],
        )?;

        registry.register(Box::new(runs_started.clone()))?;
        registry.register(Box::new(actions.clone()))?;
        registry.register(Box::new(action_duration.clone()))?;
        registry.register(Box::new(action_retries.clone()))?;
        registry.register(Box::new(circuit_duration.clone()))?;

        Ok(Self {
            registry,
            runs_started,
            actions,
            action_duration,
            action_retries,
            circuit_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.get()
    }

    pub fn retries(&self, action: &str) -> u64 {
        self.action_retries.with_label_values(&[action]).get()
    }

    pub fn actions(&self, action: &str, outcome: &str) -> u64 {
        self.actions.with_label_values(&[action, outcome]).get()
    }
}

impl Observer for CircuitMetrics {
    fn run_started(&self, _run: &RunInfo) {
        self.runs_started.inc();
    }

    fn action_retry(&self, _run: &RunInfo, action: &str, _attempt: u32, _failure: &ActionFailure) {
        self.action_retries.with_label_values(&[action]).inc();
    }

    fn action_finished(&self, _run: &RunInfo, record: &ActionRecord) {
        self.actions
            .with_label_values(&[record.name.as_str(), record.outcome.as_str()])
            .inc();
        self.action_duration
            .with_label_values(&[record.name.as_str()])
            .observe(record.duration_ms as f64 / 1000.0);
    }

    fn run_finished(&self, record: &ExecutionRecord) {
        self.circuit_duration
            .with_label_values(&[record.circuit.as_str(), record.status.as_str()])
            .observe(record.duration_ms as f64 / 1000.0);
    }
}
