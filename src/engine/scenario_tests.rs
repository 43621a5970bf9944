// End-to-end tests for circuit runs through the engine
use crate::{
    engine::{
        authz::StaticPolicy,
        metrics::CircuitMetrics,
        observe::RecordingObserver,
        scheduler::{CircuitEngine, EngineConfig},
    },
    models::{
        ActionHandler, ActionOutcome, ActionResult, ActionSpec, ActionType, Branch, Circuit,
        CircuitDefinition, ErrorKind, EventKind, ExecutionContext, ExecutionRecord, HistoryFilter,
        OnFailure, Predicate, RetryPolicy, RunStatus, SkipReason, SnapshotPolicy, Step, Trigger,
        TriggerEvent,
    },
};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Script = Box<dyn Fn(u32, &ExecutionContext) -> ActionResult + Send + Sync>;

/// Handler driven by a closure over the 1-based call number
struct Scripted {
    calls: AtomicU32,
    script: Script,
}

impl Scripted {
    fn new(script: impl Fn(u32, &ExecutionContext) -> ActionResult + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            script: Box::new(script),
        })
    }

    fn returning(output: Value) -> Arc<Self> {
        Self::new(move |_, _| ActionResult::ok(output.clone()))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionHandler for Scripted {
    async fn execute(&self, ctx: &ExecutionContext) -> ActionResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(call, ctx)
    }
}

/// Sleeps, then returns its output unless the run was cancelled meanwhile
struct Sleepy {
    duration: Duration,
    output: Value,
}

#[async_trait]
impl ActionHandler for Sleepy {
    async fn execute(&self, ctx: &ExecutionContext) -> ActionResult {
        tokio::time::sleep(self.duration).await;
        if ctx.is_cancelled() {
            return ActionResult::cancelled();
        }
        ActionResult::ok(self.output.clone())
    }
}

fn sleepy(duration: Duration) -> Arc<Sleepy> {
    Arc::new(Sleepy {
        duration,
        output: json!({"slept_ms": duration.as_millis() as u64}),
    })
}

/// Stalls on its first call only
struct SlowFirst {
    calls: AtomicU32,
    stall: Duration,
}

#[async_trait]
impl ActionHandler for SlowFirst {
    async fn execute(&self, _ctx: &ExecutionContext) -> ActionResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.stall).await;
        }
        ActionResult::ok(json!({"answer": 42}))
    }
}

/// Tracks how many handler calls are in flight at once
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ActionHandler for Gauge {
    async fn execute(&self, _ctx: &ExecutionContext) -> ActionResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        ActionResult::done()
    }
}

struct Panics;

#[async_trait]
impl ActionHandler for Panics {
    async fn execute(&self, _ctx: &ExecutionContext) -> ActionResult {
        panic!("scoring model exploded")
    }
}

fn action(name: &str, handler: Arc<dyn ActionHandler>) -> ActionSpec {
    ActionSpec::new(name, ActionType::from_name(name), handler)
}

fn lead_circuit(name: &str, steps: Vec<Step>) -> Circuit {
    let mut circuit = Circuit::new(name, 1).expecting(["lead_id"]);
    circuit.bind(Trigger::on(EventKind::LeadCreated));
    for step in steps {
        circuit.add(step).unwrap();
    }
    circuit
}

fn lead_created() -> TriggerEvent {
    TriggerEvent::new(
        EventKind::LeadCreated,
        "crm",
        json!({"lead_id": "L1", "score_hint": 92}),
    )
}

fn outcomes(record: &ExecutionRecord) -> Vec<(String, ActionOutcome)> {
    record
        .actions
        .iter()
        .map(|a| (a.name.clone(), a.outcome))
        .collect()
}

async fn run_one(engine: &CircuitEngine, event: TriggerEvent) -> ExecutionRecord {
    let mut records = engine.dispatch(event).await;
    assert_eq!(records.len(), 1, "expected exactly one matching circuit");
    records.remove(0)
}

#[tokio::test]
async fn test_lead_score_and_branch() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let create_opportunity = Scripted::returning(json!({"opportunity_id": "O1"}));

    let circuit = lead_circuit(
        "hot_lead_alert",
        vec![
            action("fetch", Scripted::returning(json!({"id": "L1", "company": "Acme"})))
                .with_inputs(["lead_id"])
                .with_output("lead")
                .into(),
            action("predict", Scripted::returning(json!(0.9)))
                .with_inputs(["lead"])
                .with_output("score")
                .into(),
            Step::conditional(
                "is_hot",
                Predicate::greater_than("score", 0.8),
                vec![
                    action("notify", Scripted::returning(json!({"sent": true}))).into(),
                    action("create_opportunity", create_opportunity.clone())
                        .with_inputs(["lead"])
                        .with_output("opportunity")
                        .with_permission("crm.write")
                        .into(),
                ],
                vec![action("log_cold", Scripted::returning(json!({}))).into()],
            ),
        ],
    );
    engine.register(circuit).await.unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(
        outcomes(&record),
        vec![
            ("fetch".to_string(), ActionOutcome::Ok),
            ("predict".to_string(), ActionOutcome::Ok),
            ("is_hot".to_string(), ActionOutcome::Ok),
            ("notify".to_string(), ActionOutcome::Ok),
            ("create_opportunity".to_string(), ActionOutcome::Ok),
            ("log_cold".to_string(), ActionOutcome::Skipped),
        ]
    );
    assert_eq!(record.action("is_hot").unwrap().branch, Some(Branch::Then));
    assert!(record
        .action("log_cold")
        .unwrap()
        .skip_reason_is(&SkipReason::BranchNotTaken));
    assert_eq!(create_opportunity.calls(), 1);

    let state = record.context.as_ref().unwrap().state.as_ref().unwrap();
    assert_eq!(state["opportunity"]["opportunity_id"], "O1");
    assert_eq!(state["score"], json!(0.9));
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_succeed() {
    let metrics = CircuitMetrics::new().unwrap();
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_observer(Arc::new(metrics.clone()))
        .build();

    let scrape = Scripted::new(|call, _| {
        if call < 3 {
            ActionResult::external("upstream returned 503", true)
        } else {
            ActionResult::ok(json!({"pages": 4}))
        }
    });
    engine
        .register(lead_circuit(
            "enrich",
            vec![action("scrape", scrape.clone()).with_output("pages").into()],
        ))
        .await
        .unwrap();

    let record = run_one(&engine, lead_created()).await;
    let scraped = record.action("scrape").unwrap();
    assert_eq!(scraped.outcome, ActionOutcome::Ok);
    assert_eq!(scraped.attempts, 3);
    assert_eq!(scrape.calls(), 3);
    assert_eq!(metrics.retries("scrape"), 2);
    assert_eq!(metrics.actions("scrape", "ok"), 1);

    // two jittered backoffs: 250ms and 500ms, each at least 80% of nominal
    assert!(record.duration_ms >= 600, "duration {}ms", record.duration_ms);
    assert!(record.duration_ms < 60_000);
    assert_eq!(record.status, RunStatus::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_with_abort() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let notify = Scripted::returning(json!({}));
    engine
        .register(lead_circuit(
            "research",
            vec![
                action("rag_query", sleepy(Duration::from_secs(30)))
                    .with_retry(RetryPolicy::none())
                    .into(),
                action("notify", notify.clone()).into(),
            ],
        ))
        .await
        .unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Failed);

    let rag = record.action("rag_query").unwrap();
    assert_eq!(rag.outcome, ActionOutcome::TimedOut);
    assert_eq!(rag.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(rag.attempts, 1);
    assert!(rag.duration_ms >= 10_000 && rag.duration_ms < 30_000);

    assert!(record
        .action("notify")
        .unwrap()
        .skip_reason_is(&SkipReason::UpstreamFailure));
    assert_eq!(notify.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_attempt_is_retried() {
    let metrics = CircuitMetrics::new().unwrap();
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_observer(Arc::new(metrics.clone()))
        .build();

    let rag = Arc::new(SlowFirst {
        calls: AtomicU32::new(0),
        stall: Duration::from_secs(5),
    });
    engine
        .register(lead_circuit(
            "research",
            vec![action("rag_query", rag.clone())
                .with_timeout(Duration::from_secs(1))
                .with_output("answer")
                .into()],
        ))
        .await
        .unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Ok);

    let query = record.action("rag_query").unwrap();
    assert_eq!(query.outcome, ActionOutcome::Ok);
    assert_eq!(query.attempts, 2);
    assert_eq!(rag.calls.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.retries("rag_query"), 1);

    // the 1s action timeout applies, not the 10s engine default
    assert!(record.duration_ms >= 1_000, "duration {}ms", record.duration_ms);
    assert!(record.duration_ms < 5_000, "duration {}ms", record.duration_ms);
}

#[tokio::test]
async fn test_unauthorized_aborts_run() {
    let policy = StaticPolicy::new().grant("rep-1", "slack.post");
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_authorizer(Arc::new(policy))
        .build();

    let create_opportunity = Scripted::returning(json!({"opportunity_id": "O1"}));
    engine
        .register(lead_circuit(
            "auto_opportunity",
            vec![
                action("score", Scripted::returning(json!(0.95)))
                    .with_output("score")
                    .into(),
                action("create_opportunity", create_opportunity.clone())
                    .with_permission("crm.write")
                    .into(),
                action("announce", Scripted::returning(json!({})))
                    .with_permission("slack.post")
                    .into(),
            ],
        ))
        .await
        .unwrap();

    let record = run_one(&engine, lead_created().with_principal("rep-1")).await;
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.action("score").unwrap().outcome, ActionOutcome::Ok);

    let denied = record.action("create_opportunity").unwrap();
    assert_eq!(denied.outcome, ActionOutcome::Unauthorized);
    assert_eq!(denied.attempts, 0);
    assert!(denied.message.as_deref().unwrap().contains("crm.write"));
    assert_eq!(create_opportunity.calls(), 0);

    assert!(record
        .action("announce")
        .unwrap()
        .skip_reason_is(&SkipReason::UpstreamFailure));
}

#[tokio::test]
async fn test_unmatched_event_leaves_history_alone() {
    let engine = CircuitEngine::new(EngineConfig::default());
    engine
        .register(lead_circuit(
            "hot_lead_alert",
            vec![action("fetch", Scripted::returning(json!({}))).into()],
        ))
        .await
        .unwrap();

    let records = engine
        .dispatch(TriggerEvent::new(EventKind::CadenceTick, "scheduler", json!({})))
        .await;
    assert!(records.is_empty());
    assert_eq!(engine.history_len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_dispatch_respects_limit() {
    let engine = CircuitEngine::new(EngineConfig {
        max_parallel_circuits: 16,
        ..EngineConfig::default()
    });
    let gauge = Arc::new(Gauge {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    engine
        .register(lead_circuit("touch", vec![action("touch", gauge.clone()).into()]))
        .await
        .unwrap();

    let dispatches = (0..64).map(|i| {
        let engine = engine.clone();
        async move {
            let event = TriggerEvent::new(EventKind::LeadCreated, "crm", json!({"lead_id": i}));
            engine.dispatch(event).await
        }
    });
    let records: Vec<ExecutionRecord> = join_all(dispatches).await.into_iter().flatten().collect();

    assert_eq!(records.len(), 64);
    assert!(records.iter().all(|r| r.status == RunStatus::Ok));

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 16, "peak concurrency {}", peak);
    assert!(peak > 1, "runs never overlapped");
    assert_eq!(engine.history_len().await, 64);
}

#[tokio::test]
async fn test_repeated_dispatch_is_deterministic() {
    let engine = CircuitEngine::new(EngineConfig::default());
    for name in ["first", "second", "third"] {
        engine
            .register(lead_circuit(
                name,
                vec![
                    action("lookup", Scripted::returning(json!({"tier": "gold"})))
                        .with_output("account")
                        .into(),
                    Step::conditional(
                        "is_gold",
                        Predicate::equals("account.tier", json!("gold")),
                        vec![action("fast_track", Scripted::returning(json!({}))).into()],
                        vec![action("nurture", Scripted::returning(json!({}))).into()],
                    ),
                ],
            ))
            .await
            .unwrap();
    }

    let trace = |records: Vec<ExecutionRecord>| -> Vec<(String, String, ActionOutcome)> {
        records
            .iter()
            .flat_map(|r| {
                r.actions
                    .iter()
                    .map(move |a| (r.circuit.clone(), a.name.clone(), a.outcome))
            })
            .collect()
    };

    let first = trace(engine.dispatch(lead_created()).await);
    let second = trace(engine.dispatch(lead_created()).await);
    assert_eq!(first, second);
    assert_eq!(first[0].0, "first");
    assert_eq!(first.last().unwrap().0, "third");
}

#[tokio::test]
async fn test_register_rejects_unproduced_inputs() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let definition: CircuitDefinition = serde_json::from_value(json!({
        "name": "dangling",
        "triggers": [{"type": "event", "kind": "lead_created"}],
        "actions": [
            {"type": "action", "name": "first", "action": "log", "output": "note"},
            {"type": "action", "name": "second", "action": "log", "inputs": ["opportunity"]}
        ]
    }))
    .unwrap();

    let err = engine.register_definition(&definition).await.unwrap_err();
    assert_eq!(err.kind(), "definition_error");
    assert!(err.to_string().contains("opportunity"));
    assert!(engine.list_circuits().await.is_empty());

    // a payload filter guarantees its key
    let definition: CircuitDefinition = serde_json::from_value(json!({
        "name": "filtered",
        "triggers": [{"type": "event", "kind": "lead_created", "payload_filter": {"region": "emea"}}],
        "actions": [{"type": "action", "name": "note", "action": "log", "inputs": ["region"]}]
    }))
    .unwrap();
    assert!(engine.register_definition(&definition).await.is_ok());
}

#[tokio::test]
async fn test_registration_by_name_and_version() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let build = |version: u32| {
        let mut circuit = Circuit::new("nurture", version);
        circuit.bind(Trigger::on(EventKind::CadenceTick));
        circuit
            .add(action("touch", Scripted::returning(json!({"version": version}))).with_output("touch"))
            .unwrap();
        circuit
    };

    engine.register(build(1)).await.unwrap();
    let err = engine.register(build(1)).await.unwrap_err();
    assert_eq!(err.kind(), "duplicate");

    engine.register(build(2)).await.unwrap();
    let listed = engine.list_circuits().await;
    assert_eq!(
        listed.iter().map(|c| c.version).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(engine.circuit("nurture", None).await.unwrap().version, 2);
    assert_eq!(engine.circuit("nurture", Some(1)).await.unwrap().version, 1);
    assert!(engine.circuit("nurture", Some(3)).await.is_none());

    // both versions fire on a matching event
    let records = engine
        .dispatch(TriggerEvent::new(EventKind::CadenceTick, "scheduler", json!({})))
        .await;
    assert_eq!(records.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_respects_declaration() {
    let engine = CircuitEngine::new(EngineConfig::default());

    let permanent = Scripted::new(|_, _| ActionResult::external("400 bad request", false));
    let greedy = Scripted::new(|_, _| ActionResult::external("503", true));
    let modest = Scripted::new(|_, _| ActionResult::external("503", true));

    let mut circuit = lead_circuit(
        "retries",
        vec![
            action("permanent", permanent.clone()).into(),
            action("greedy", greedy.clone())
                .with_retry(RetryPolicy::attempts(5))
                .into(),
            action("modest", modest.clone())
                .with_retry(RetryPolicy::attempts(2))
                .into(),
        ],
    );
    circuit.on_failure = OnFailure::Continue;
    engine.register(circuit).await.unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(permanent.calls(), 1);
    assert_eq!(record.action("permanent").unwrap().attempts, 1);
    // engine cap of 3 wins over the declared 5
    assert_eq!(greedy.calls(), 3);
    assert_eq!(modest.calls(), 2);
    assert_eq!(record.status, RunStatus::Partial);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_skips_remaining_actions() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let write = Scripted::returning(json!({"written": true}));
    engine
        .register(lead_circuit(
            "slow",
            vec![
                action("research", sleepy(Duration::from_secs(1)))
                    .with_output("research")
                    .into(),
                action("write", write.clone()).with_output("written").into(),
            ],
        ))
        .await
        .unwrap();

    let mut handles = engine.dispatch_async(lead_created()).await;
    assert_eq!(handles.len(), 1);
    let handle = handles.remove(0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    assert!(handle.is_cancelled());

    let record = handle.join().await.unwrap();
    assert_eq!(record.status, RunStatus::Cancelled);
    for name in ["research", "write"] {
        assert!(
            record
                .action(name)
                .unwrap()
                .skip_reason_is(&SkipReason::Cancellation),
            "{} was not skipped",
            name
        );
    }
    assert_eq!(write.calls(), 0);

    let snapshot = record.context.unwrap();
    assert!(snapshot.cancelled);
    let state = snapshot.state.unwrap();
    assert!(!state.contains_key("research"));
    assert!(!state.contains_key("written"));
}

#[tokio::test]
async fn test_no_writes_after_cancellation() {
    let engine = CircuitEngine::new(EngineConfig::default());
    engine
        .register(lead_circuit(
            "self_cancel",
            vec![
                action(
                    "stop",
                    Scripted::new(|_, ctx| {
                        ctx.cancel();
                        ActionResult::ok(json!("late value"))
                    }),
                )
                .with_output("late")
                .into(),
                action("after", Scripted::returning(json!({}))).into(),
            ],
        ))
        .await
        .unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Cancelled);
    assert!(record.action("stop").unwrap().skip_reason_is(&SkipReason::Cancellation));
    assert!(record.action("after").unwrap().skip_reason_is(&SkipReason::Cancellation));
    let state = record.context.unwrap().state.unwrap();
    assert!(!state.contains_key("late"));
}

#[tokio::test]
async fn test_history_keeps_most_recent() {
    let engine = CircuitEngine::new(EngineConfig {
        history_capacity: 5,
        ..EngineConfig::default()
    });
    engine
        .register(lead_circuit(
            "ping",
            vec![action("ping", Scripted::returning(json!({}))).into()],
        ))
        .await
        .unwrap();

    for i in 0..8 {
        engine
            .dispatch(lead_created().with_correlation_id(format!("c-{}", i)))
            .await;
    }

    assert_eq!(engine.history_len().await, 5);
    let kept: Vec<String> = engine
        .history(100, &HistoryFilter::default())
        .await
        .into_iter()
        .map(|r| r.correlation_id)
        .collect();
    assert_eq!(kept, vec!["c-3", "c-4", "c-5", "c-6", "c-7"]);

    let latest = engine.history(2, &HistoryFilter::circuit("ping")).await;
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[1].correlation_id, "c-7");
}

#[tokio::test]
async fn test_abort_skips_everything_downstream() {
    let observer = Arc::new(RecordingObserver::default());
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_observer(observer.clone())
        .build();

    engine
        .register(lead_circuit(
            "abort",
            vec![
                action("a", Scripted::returning(json!(1))).with_output("a").into(),
                action("b", Scripted::new(|_, _| ActionResult::external("boom", false))).into(),
                Step::conditional(
                    "c",
                    Predicate::exists("a"),
                    vec![action("d", Scripted::returning(json!({}))).into()],
                    vec![],
                ),
                action("e", Scripted::returning(json!({}))).into(),
            ],
        ))
        .await
        .unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.failures(), 1);
    for name in ["c", "d", "e"] {
        assert!(record
            .action(name)
            .unwrap()
            .skip_reason_is(&SkipReason::UpstreamFailure));
    }

    assert_eq!(
        observer.events(),
        vec![
            "run_started:abort",
            "action_started:a",
            "action_finished:a:ok",
            "action_started:b",
            "action_finished:b:failed",
            "action_finished:c:skipped",
            "action_finished:d:skipped",
            "action_finished:e:skipped",
            "run_finished:abort:failed",
        ]
    );
}

#[tokio::test]
async fn test_abort_does_not_cancel_handle() {
    let engine = CircuitEngine::new(EngineConfig::default());
    engine
        .register(lead_circuit(
            "abort",
            vec![
                action("b", Scripted::new(|_, _| ActionResult::external("boom", false))).into(),
                action("e", Scripted::returning(json!({}))).into(),
            ],
        ))
        .await
        .unwrap();

    let mut handles = engine.dispatch_async(lead_created()).await;
    let handle = handles.remove(0);
    while engine.history_len().await == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(!handle.is_cancelled());

    let record = handle.join().await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record
        .action("e")
        .unwrap()
        .skip_reason_is(&SkipReason::UpstreamFailure));
    assert!(!record.context.unwrap().cancelled);
}

#[tokio::test]
async fn test_continue_policy_runs_on() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let after = Scripted::returning(json!({}));
    let mut circuit = lead_circuit(
        "best_effort",
        vec![
            action("news", Scripted::new(|_, _| ActionResult::external("no results", false))).into(),
            action("after", after.clone()).into(),
        ],
    );
    circuit.on_failure = OnFailure::Continue;
    engine.register(circuit).await.unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Partial);
    assert_eq!(record.action("after").unwrap().outcome, ActionOutcome::Ok);
    assert_eq!(after.calls(), 1);
}

#[tokio::test]
async fn test_compensation_runs_newest_first() {
    let observer = Arc::new(RecordingObserver::default());
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_observer(observer.clone())
        .build();

    let mut circuit = lead_circuit(
        "saga",
        vec![
            action("reserve", Scripted::returning(json!({"id": "R1"})))
                .with_output("reservation")
                .with_compensation(action(
                    "release",
                    Scripted::returning(json!({})),
                ))
                .into(),
            action("create_opportunity", Scripted::returning(json!({"id": "O1"})))
                .with_output("opportunity")
                .with_compensation(
                    action("delete_opportunity", Scripted::returning(json!({})))
                        .with_inputs(["opportunity"]),
                )
                .into(),
            action("notify", Scripted::new(|_, _| ActionResult::external("slack down", false))).into(),
            action("audit", Scripted::returning(json!({}))).into(),
        ],
    );
    circuit.on_failure = OnFailure::Compensate;
    engine.register(circuit).await.unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Compensated);
    assert!(record
        .action("audit")
        .unwrap()
        .skip_reason_is(&SkipReason::UpstreamFailure));

    let compensations: Vec<(&str, ActionOutcome)> = record
        .compensations
        .iter()
        .map(|c| (c.name.as_str(), c.outcome))
        .collect();
    assert_eq!(
        compensations,
        vec![
            ("delete_opportunity", ActionOutcome::Ok),
            ("release", ActionOutcome::Ok),
        ]
    );
    assert!(observer
        .events()
        .contains(&"action_finished:delete_opportunity:ok".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_budget_expiry_cancels_run() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let circuit = lead_circuit(
        "tight",
        vec![
            action("crawl", sleepy(Duration::from_secs(5))).into(),
            action("summarize", Scripted::returning(json!({}))).into(),
        ],
    )
    .with_budget(Duration::from_secs(1));
    engine.register(circuit).await.unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Cancelled);
    assert!(record.action("crawl").unwrap().skip_reason_is(&SkipReason::Cancellation));
    assert!(record
        .action("summarize")
        .unwrap()
        .skip_reason_is(&SkipReason::Cancellation));
    assert!(record.duration_ms < 5_000);
}

#[tokio::test]
async fn test_panicking_action_becomes_internal_error() {
    let engine = CircuitEngine::new(EngineConfig::default());
    engine
        .register(lead_circuit("fragile", vec![action("score", Arc::new(Panics)).into()]))
        .await
        .unwrap();

    let record = run_one(&engine, lead_created()).await;
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_kind, Some(ErrorKind::InternalError));
    assert!(record.error.as_deref().unwrap().contains("scoring model exploded"));
    assert_eq!(engine.history_len().await, 1);

    // the engine keeps serving
    let records = engine.dispatch(lead_created()).await;
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_execute_named_circuit() {
    let engine = CircuitEngine::new(EngineConfig::default());
    engine
        .register(lead_circuit(
            "manual",
            vec![action("fetch", Scripted::returning(json!({}))).with_inputs(["lead_id"]).into()],
        ))
        .await
        .unwrap();

    // triggers are not consulted
    let event = TriggerEvent::new(EventKind::ExternalWebhook, "zapier", json!({"lead_id": "L9"}))
        .with_correlation_id("corr-42");
    let record = engine.execute("manual", None, event).await.unwrap();
    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(record.correlation_id, "corr-42");
    assert_eq!(record.trigger.kind, EventKind::ExternalWebhook);

    let err = engine
        .execute("manual", Some(7), lead_created())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_missing_payload_key_fails_at_runtime() {
    let engine = CircuitEngine::new(EngineConfig::default());
    let fetch = Scripted::returning(json!({}));
    engine
        .register(lead_circuit(
            "needs_lead",
            vec![action("fetch", fetch.clone()).with_inputs(["lead_id"]).into()],
        ))
        .await
        .unwrap();

    let record = run_one(
        &engine,
        TriggerEvent::new(EventKind::LeadCreated, "crm", json!({"email": "a@b.c"})),
    )
    .await;
    let fetched = record.action("fetch").unwrap();
    assert_eq!(fetched.error_kind, Some(ErrorKind::MissingInput));
    assert_eq!(fetched.attempts, 0);
    assert_eq!(fetch.calls(), 0);
    assert_eq!(record.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_one_correlation_id_per_dispatch() {
    let engine = CircuitEngine::new(EngineConfig::default());
    for name in ["a", "b"] {
        engine
            .register(lead_circuit(name, vec![action("noop", Scripted::returning(json!({}))).into()]))
            .await
            .unwrap();
    }

    let records = engine.dispatch(lead_created()).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].correlation_id, records[1].correlation_id);
    assert!(uuid::Uuid::parse_str(&records[0].correlation_id).is_ok());
}

#[tokio::test]
async fn test_snapshot_policy() {
    for (policy, has_context, has_state) in [
        (SnapshotPolicy::Full, true, true),
        (SnapshotPolicy::Keys, true, false),
        (SnapshotPolicy::None, false, false),
    ] {
        let engine = CircuitEngine::new(EngineConfig {
            snapshot_policy: policy,
            ..EngineConfig::default()
        });
        engine
            .register(lead_circuit(
                "snap",
                vec![action("fetch", Scripted::returning(json!({"secret": "x"})))
                    .with_output("lead")
                    .into()],
            ))
            .await
            .unwrap();

        let record = run_one(&engine, lead_created()).await;
        assert_eq!(record.context.is_some(), has_context, "{:?}", policy);
        if let Some(snapshot) = record.context {
            assert_eq!(snapshot.state.is_some(), has_state, "{:?}", policy);
            assert!(snapshot.keys.contains(&"lead".to_string()));
            assert!(!snapshot.log.is_empty());
        }
    }
}
