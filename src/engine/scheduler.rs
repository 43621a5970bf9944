// Circuit engine - registration, dispatch and history

//! # Circuit Engine
//!
//! [`CircuitEngine`] is the shared entry point. It is cheap to clone; every
//! clone talks to the same circuit table, history and concurrency limit.
//!
//! ## Dispatch
//!
//! `dispatch_async` matches an event against every registered circuit and
//! hands back one [`RunHandle`] per match, in registration order. Runs are
//! started by a dispatcher task that takes a semaphore permit per run, so at
//! most `max_parallel_circuits` runs execute at once and the rest queue in
//! FIFO order. `dispatch` does the same and waits for every record.
//!
//! Each run executes in its own task under a supervisor that:
//! - cancels the run's token when the circuit budget expires
//! - turns a panic in the run into an `internal_error` record
//! - appends the record to history and reports it to the observer
//!
//! ## Shared State
//!
//! The circuit table and the history ring buffer sit behind one `RwLock`.
//! Readers get clones, so the lock is never held across a run.

use chrono::Utc;
use futures::future::join_all;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::authz::{AllowAll, AuthorizationHook};
use super::catalog::ActionCatalog;
use super::collaborators::Collaborators;
use super::history::History;
use super::observe::{NoopObserver, Observer};
use super::runner::Run;
use crate::models::{
    Circuit, CircuitDefinition, CircuitSummary, ExecutionContext, ExecutionRecord, HistoryFilter,
    RetryPolicy, SnapshotPolicy, TriggerEvent,
};
use crate::{CircuitError, Result};

/// Engine resource caps
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_parallel_circuits: usize,
    /// Budget for circuits that do not declare one
    pub circuit_budget: Duration,
    /// Per-attempt timeout for actions that do not declare one
    pub action_timeout: Duration,
    pub history_capacity: usize,
    /// Default retry policy; its `max_attempts` also caps every action
    pub retry: RetryPolicy,
    pub snapshot_policy: SnapshotPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_circuits: 16,
            circuit_budget: Duration::from_secs(60),
            action_timeout: Duration::from_secs(10),
            history_capacity: super::history::DEFAULT_CAPACITY,
            retry: RetryPolicy::default(),
            snapshot_policy: SnapshotPolicy::Full,
        }
    }
}

struct EngineState {
    circuits: Vec<Arc<Circuit>>,
    history: History,
}

struct EngineInner {
    config: EngineConfig,
    state: RwLock<EngineState>,
    permits: Arc<Semaphore>,
    catalog: Arc<ActionCatalog>,
    authorizer: Arc<dyn AuthorizationHook>,
    observer: Arc<dyn Observer>,
}

/// One scheduled run waiting for a permit
struct Job {
    circuit: Arc<Circuit>,
    event: Arc<TriggerEvent>,
    correlation_id: String,
    cancellation: CancellationToken,
    sender: oneshot::Sender<ExecutionRecord>,
}

/// Caller's view of a scheduled run
pub struct RunHandle {
    circuit: String,
    version: u32,
    correlation_id: String,
    cancellation: CancellationToken,
    receiver: oneshot::Receiver<ExecutionRecord>,
}

impl RunHandle {
    pub fn circuit(&self) -> &str {
        &self.circuit
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Ask the run to stop; remaining actions are skipped as `cancellation`
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wait for the run's record
    pub async fn join(self) -> Result<ExecutionRecord> {
        self.receiver.await.map_err(|_| {
            CircuitError::Internal(format!(
                "run of {} v{} ended without a record",
                self.circuit, self.version
            ))
        })
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("circuit", &self.circuit)
            .field("version", &self.version)
            .field("correlation_id", &self.correlation_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Builder for [`CircuitEngine`]
pub struct CircuitEngineBuilder {
    config: EngineConfig,
    catalog: Option<Arc<ActionCatalog>>,
    authorizer: Arc<dyn AuthorizationHook>,
    observer: Arc<dyn Observer>,
}

impl CircuitEngineBuilder {
    pub fn with_catalog(mut self, catalog: Arc<ActionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn AuthorizationHook>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> CircuitEngine {
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(ActionCatalog::with_builtins(&Collaborators::new())));
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_circuits.max(1)));
        let history = History::with_capacity(self.config.history_capacity);

        CircuitEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                state: RwLock::new(EngineState {
                    circuits: Vec::new(),
                    history,
                }),
                permits,
                catalog,
                authorizer: self.authorizer,
                observer: self.observer,
            }),
        }
    }
}

#[derive(Clone)]
pub struct CircuitEngine {
    inner: Arc<EngineInner>,
}

impl CircuitEngine {
    pub fn builder(config: EngineConfig) -> CircuitEngineBuilder {
        CircuitEngineBuilder {
            config,
            catalog: None,
            authorizer: Arc::new(AllowAll),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Engine with default collaborators: allow-all authorization, no-op
    /// observer and a catalog holding only `log`
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.inner.catalog
    }

    /// Add a circuit; `(name, version)` must be unused and the circuit valid
    pub async fn register(&self, circuit: Circuit) -> Result<CircuitSummary> {
        circuit.validate()?;

        let mut state = self.inner.state.write().await;
        if state
            .circuits
            .iter()
            .any(|c| c.name == circuit.name && c.version == circuit.version)
        {
            return Err(CircuitError::DuplicateCircuit {
                name: circuit.name,
                version: circuit.version,
            });
        }

        let summary = circuit.summary();
        info!(circuit = %circuit.name, version = circuit.version, "registered circuit");
        state.circuits.push(Arc::new(circuit));
        Ok(summary)
    }

    /// Resolve a wire definition through the catalog and register it
    pub async fn register_definition(&self, definition: &CircuitDefinition) -> Result<CircuitSummary> {
        let circuit = self.inner.catalog.build_circuit(definition)?;
        self.register(circuit).await
    }

    /// Registered circuits in registration order
    pub async fn list_circuits(&self) -> Vec<CircuitSummary> {
        let state = self.inner.state.read().await;
        state.circuits.iter().map(|c| c.summary()).collect()
    }

    /// Look up a circuit by name; the highest version unless one is given
    pub async fn circuit(&self, name: &str, version: Option<u32>) -> Option<Arc<Circuit>> {
        let state = self.inner.state.read().await;
        state
            .circuits
            .iter()
            .filter(|c| c.name == name && version.map_or(true, |v| c.version == v))
            .max_by_key(|c| c.version)
            .cloned()
    }

    /// Run every matching circuit and wait for all records
    ///
    /// Records come back in registration order. An event nothing matches
    /// yields an empty list and leaves history untouched.
    pub async fn dispatch(&self, event: TriggerEvent) -> Vec<ExecutionRecord> {
        let handles = self.dispatch_async(event).await;
        join_all(handles.into_iter().map(RunHandle::join))
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(record) => Some(record),
                Err(e) => {
                    error!("dropping run without record: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Schedule every matching circuit and return without waiting
    pub async fn dispatch_async(&self, event: TriggerEvent) -> Vec<RunHandle> {
        let matched: Vec<Arc<Circuit>> = {
            let state = self.inner.state.read().await;
            state
                .circuits
                .iter()
                .filter(|c| c.matches(&event))
                .cloned()
                .collect()
        };

        debug!(kind = %event.kind(), source = event.source(), matched = matched.len(), "dispatching event");
        if matched.is_empty() {
            return Vec::new();
        }
        self.schedule(matched, event)
    }

    /// Run one named circuit whether or not its triggers match
    pub async fn execute(
        &self,
        name: &str,
        version: Option<u32>,
        event: TriggerEvent,
    ) -> Result<ExecutionRecord> {
        let circuit = self.circuit(name, version).await.ok_or_else(|| {
            CircuitError::NotFound(match version {
                Some(v) => format!("circuit {} v{}", name, v),
                None => format!("circuit {}", name),
            })
        })?;

        let handle = self
            .schedule(vec![circuit], event)
            .pop()
            .ok_or_else(|| CircuitError::Internal("no run was scheduled".into()))?;
        handle.join().await
    }

    /// The most recent `limit` records accepted by `filter`, oldest first
    pub async fn history(&self, limit: usize, filter: &HistoryFilter) -> Vec<ExecutionRecord> {
        self.inner.state.read().await.history.query(limit, filter)
    }

    pub async fn history_len(&self) -> usize {
        self.inner.state.read().await.history.len()
    }

    fn schedule(&self, circuits: Vec<Arc<Circuit>>, event: TriggerEvent) -> Vec<RunHandle> {
        let correlation_id = event
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let event = Arc::new(event);

        let mut handles = Vec::with_capacity(circuits.len());
        let mut jobs = Vec::with_capacity(circuits.len());
        for circuit in circuits {
            let cancellation = CancellationToken::new();
            let (sender, receiver) = oneshot::channel();
            handles.push(RunHandle {
                circuit: circuit.name.clone(),
                version: circuit.version,
                correlation_id: correlation_id.clone(),
                cancellation: cancellation.clone(),
                receiver,
            });
            jobs.push(Job {
                circuit,
                event: event.clone(),
                correlation_id: correlation_id.clone(),
                cancellation,
                sender,
            });
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            for job in jobs {
                let permit = match inner.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("run queue closed, dropping remaining runs");
                        return;
                    }
                };
                tokio::spawn(inner.clone().supervise(job, permit));
            }
        });

        handles
    }
}

impl EngineInner {
    async fn supervise(self: Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let Job {
            circuit,
            event,
            correlation_id,
            cancellation,
            sender,
        } = job;

        let started_at = Utc::now();
        let started = Instant::now();
        let budget = circuit.budget.unwrap_or(self.config.circuit_budget);

        let mut run = {
            let circuit = circuit.clone();
            let config = self.config.clone();
            let observer = self.observer.clone();
            let ctx = ExecutionContext::new(
                event.clone(),
                correlation_id.clone(),
                self.authorizer.clone(),
                cancellation.clone(),
            );
            tokio::spawn(async move { Run::new(&circuit, &config, observer.as_ref(), ctx).execute().await })
        };

        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);
        let mut expired = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = &mut deadline, if !expired => {
                    expired = true;
                    warn!(
                        circuit = %circuit.name,
                        correlation_id = %correlation_id,
                        budget_ms = budget.as_millis() as u64,
                        "circuit budget exceeded, cancelling run"
                    );
                    cancellation.cancel();
                }
            }
        };

        let record = match outcome {
            Ok(record) => record,
            Err(e) => {
                let message = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                error!(
                    circuit = %circuit.name,
                    version = circuit.version,
                    correlation_id = %correlation_id,
                    "circuit run panicked: {}",
                    message
                );
                ExecutionRecord::internal_error(
                    &circuit.name,
                    circuit.version,
                    &correlation_id,
                    event.summary(),
                    started_at,
                    started.elapsed().as_millis() as u64,
                    message,
                )
            }
        };

        self.state.write().await.history.push(record.clone());
        self.observer.run_finished(&record);
        drop(permit);

        // the caller may have dropped its handle
        let _ = sender.send(record);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "run panicked".to_string()
    }
}
