// Integration tests for the HTTP API
use crate::{
    api::{CircuitApiServer, CircuitApiServerBuilder},
    engine::{ActionCatalog, CircuitEngine, CircuitMetrics, Collaborators, EngineConfig, StaticPolicy},
    models::Principal,
};

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

fn engine() -> CircuitEngine {
    CircuitEngine::new(EngineConfig::default())
}

fn app(server: CircuitApiServer) -> Router {
    server.create_router()
}

fn open_app() -> (Router, CircuitEngine) {
    let engine = engine();
    let metrics = CircuitMetrics::new().unwrap();
    let router = app(
        CircuitApiServerBuilder::new(engine.clone())
            .with_metrics(metrics)
            .build(),
    );
    (router, engine)
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

fn triage_definition(version: u32) -> Value {
    json!({
        "name": "lead_triage",
        "version": version,
        "triggers": [{"type": "event", "kind": "lead_created"}],
        "expects": ["lead_id"],
        "actions": [
            {"type": "action", "name": "note", "action": "log", "inputs": ["lead_id"],
             "params": {"message": "lead arrived"}}
        ]
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = open_app();
    let (status, body) = send(&app, request(Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["circuits"], 0);
}

#[tokio::test]
async fn test_register_and_list_circuits() {
    let (app, _) = open_app();

    let (status, body) = send(
        &app,
        request(Method::POST, "/circuits", Some(triage_definition(1))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "lead_triage");
    assert_eq!(body["steps"], json!(["note"]));

    let (status, body) = send(
        &app,
        request(Method::POST, "/circuits", Some(triage_definition(1))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "duplicate");

    let (status, body) = send(&app, request(Method::GET, "/circuits", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_definitions_are_bad_requests() {
    let (app, _) = open_app();

    let mut dangling = triage_definition(1);
    dangling["expects"] = json!([]);
    let (status, body) = send(&app, request(Method::POST, "/circuits", Some(dangling))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "definition_error");

    let (status, body) = send(
        &app,
        request(Method::POST, "/circuits", Some(json!({"name": "x", "actions": [{"type": "loop"}]}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "definition_error");
}

#[tokio::test]
async fn test_dispatch_event_returns_records() {
    let (app, engine) = open_app();
    send(&app, request(Method::POST, "/circuits", Some(triage_definition(1)))).await;

    let event = json!({"kind": "lead_created", "source": "crm", "payload": {"lead_id": "L1"}});
    let (status, body) = send(&app, request(Method::POST, "/events", Some(event))).await;
    assert_eq!(status, StatusCode::OK);
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["circuit"], "lead_triage");
    assert_eq!(records[0]["status"], "ok");
    assert_eq!(records[0]["actions"][0]["outcome"], "ok");

    let (status, body) = send(
        &app,
        request(Method::POST, "/events", Some(json!({"kind": "cadence_tick"}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
    assert_eq!(engine.history_len().await, 1);

    let (status, body) = send(
        &app,
        request(Method::POST, "/events", Some(json!({"source": "crm"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_input");
}

#[tokio::test]
async fn test_failed_run_is_still_ok_response() {
    let (app, _) = open_app();
    send(&app, request(Method::POST, "/circuits", Some(triage_definition(1)))).await;

    // the payload lacks lead_id, so the run fails with missing_input
    let (status, body) = send(
        &app,
        request(Method::POST, "/events", Some(json!({"kind": "lead_created", "payload": {}}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "failed");
    assert_eq!(body[0]["actions"][0]["error_kind"], "missing_input");
}

#[tokio::test]
async fn test_execute_circuit_by_name() {
    let (app, _) = open_app();
    send(&app, request(Method::POST, "/circuits", Some(triage_definition(1)))).await;
    send(&app, request(Method::POST, "/circuits", Some(triage_definition(2)))).await;

    let (status, body) = send(
        &app,
        request(Method::POST, "/circuits/lead_triage/execute", Some(json!({"lead_id": "L5"}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["version"], 2);
    assert_eq!(body[0]["trigger"]["kind"], "manual");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/circuits/lead_triage/execute?version=1",
            Some(json!({"kind": "lead_created", "payload": {"lead_id": "L5"}})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["version"], 1);

    let (status, body) = send(
        &app,
        request(Method::POST, "/circuits/nope/execute", Some(json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn test_execute_bare_payload_with_kind_field() {
    let (app, _) = open_app();
    send(&app, request(Method::POST, "/circuits", Some(triage_definition(1)))).await;

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/circuits/lead_triage/execute",
            Some(json!({"kind": "inbound", "lead_id": "L1"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["trigger"]["kind"], "manual");
    assert_eq!(body[0]["status"], "ok");
    assert_eq!(body[0]["actions"][0]["outcome"], "ok");
    assert_eq!(body[0]["context"]["state"]["lead_id"], "L1");
    assert_eq!(body[0]["context"]["state"]["kind"], "inbound");
}

#[tokio::test]
async fn test_executions_filtering() {
    let (app, _) = open_app();
    send(&app, request(Method::POST, "/circuits", Some(triage_definition(1)))).await;

    for payload in [json!({"lead_id": "L1"}), json!({}), json!({"lead_id": "L3"})] {
        send(
            &app,
            request(Method::POST, "/events", Some(json!({"kind": "lead_created", "payload": payload}))),
        )
        .await;
    }

    let (_, all) = send(&app, request(Method::GET, "/executions", None)).await;
    assert_eq!(all.as_array().unwrap().len(), 3);

    let (_, failed) = send(&app, request(Method::GET, "/executions?status=failed", None)).await;
    assert_eq!(failed.as_array().unwrap().len(), 1);

    let (_, latest) = send(
        &app,
        request(Method::GET, "/executions?limit=1&circuit_name=lead_triage", None),
    )
    .await;
    assert_eq!(latest.as_array().unwrap().len(), 1);
    assert_eq!(latest[0]["status"], "ok");

    let (status, body) = send(&app, request(Method::GET, "/executions?status=bogus", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_input");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = open_app();
    send(&app, request(Method::POST, "/circuits", Some(triage_definition(1)))).await;
    send(
        &app,
        request(
            Method::POST,
            "/events",
            Some(json!({"kind": "lead_created", "payload": {"lead_id": "L1"}})),
        ),
    )
    .await;

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/metrics", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("circuit_runs_started_total"));

    let bare = app_without_metrics();
    let (status, _) = send(&bare, request(Method::GET, "/metrics", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn app_without_metrics() -> Router {
    app(CircuitApiServerBuilder::new(engine()).build())
}

#[tokio::test]
async fn test_metrics_count_runs_when_observed() {
    let metrics = CircuitMetrics::new().unwrap();
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_observer(Arc::new(metrics.clone()))
        .build();
    let app = app(
        CircuitApiServerBuilder::new(engine)
            .with_metrics(metrics.clone())
            .build(),
    );

    send(&app, request(Method::POST, "/circuits", Some(triage_definition(1)))).await;
    send(
        &app,
        request(
            Method::POST,
            "/events",
            Some(json!({"kind": "lead_created", "payload": {"lead_id": "L1"}})),
        ),
    )
    .await;
    assert_eq!(metrics.runs_started(), 1);
    assert_eq!(metrics.actions("note", "ok"), 1);
}

#[tokio::test]
async fn test_api_key_auth() {
    let mut keys = HashMap::new();
    keys.insert("k-rep".to_string(), Principal::new("rep-1"));

    let policy = StaticPolicy::new().grant("rep-1", "crm.write");
    let catalog = ActionCatalog::with_builtins(&Collaborators::new());
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_catalog(Arc::new(catalog))
        .with_authorizer(Arc::new(policy))
        .build();
    let app = app(CircuitApiServerBuilder::new(engine).with_api_keys(keys).build());

    let mut definition = triage_definition(1);
    definition["actions"][0]["permission"] = json!("crm.write");

    let (status, body) = send(&app, request(Method::POST, "/circuits", Some(definition.clone()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthorized");

    let authed = |method: Method, uri: &str, body: Option<Value>, key: &str| {
        let mut request = request(method, uri, body);
        request.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {}", key).parse().unwrap(),
        );
        request
    };

    let (status, _) = send(&app, authed(Method::POST, "/circuits", Some(definition), "k-rep")).await;
    assert_eq!(status, StatusCode::CREATED);

    // the event claims another principal; the key wins
    let event = json!({"kind": "lead_created", "principal": "admin", "payload": {"lead_id": "L1"}});
    let (status, body) = send(&app, authed(Method::POST, "/events", Some(event.clone()), "k-rep")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "ok");

    let (status, _) = send(&app, authed(Method::POST, "/events", Some(event), "k-wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // health stays open
    let (status, _) = send(&app, request(Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_principal_header_drives_authorization() {
    let policy = StaticPolicy::new().grant("alice", "crm.write");
    let engine = CircuitEngine::builder(EngineConfig::default())
        .with_authorizer(Arc::new(policy))
        .build();
    let app = app(CircuitApiServerBuilder::new(engine).build());

    let mut definition = triage_definition(1);
    definition["actions"][0]["permission"] = json!("crm.write");
    send(&app, request(Method::POST, "/circuits", Some(definition))).await;

    let event = json!({"kind": "lead_created", "payload": {"lead_id": "L1"}});
    let (_, anonymous) = send(&app, request(Method::POST, "/events", Some(event.clone()))).await;
    assert_eq!(anonymous[0]["actions"][0]["outcome"], "unauthorized");

    let mut as_alice = request(Method::POST, "/events", Some(event));
    as_alice
        .headers_mut()
        .insert("x-principal", "alice".parse().unwrap());
    let (_, allowed) = send(&app, as_alice).await;
    assert_eq!(allowed[0]["actions"][0]["outcome"], "ok");
}

#[tokio::test]
async fn test_unknown_route() {
    let (app, _) = open_app();
    let (status, body) = send(&app, request(Method::GET, "/nowhere", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}
