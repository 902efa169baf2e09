//! Approval lifecycle tests over the HTTP surface.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use ctrl_approvals::{ApprovalsConfig, ApprovalsServer};
use ctrl_core::mocks::MockToolExecutor;
use ctrl_core::RequestStatus;
use ctrl_store::{AuditStore, NewDecision, NewRequest};

fn app(store: AuditStore, executor: Arc<MockToolExecutor>) -> Router {
    ApprovalsServer::new(ApprovalsConfig::default(), store, executor).build_router()
}

fn seeded_request(id: &str, status: RequestStatus) -> NewRequest {
    NewRequest {
        id: id.to_string(),
        server: "twitter".to_string(),
        tool: "publish_tweet".to_string(),
        arguments_json: r#"{"text":"gm"}"#.to_string(),
        arguments_hash: "abc".to_string(),
        actor: Some("agent-1".to_string()),
        env: "dev".to_string(),
        status,
        risk_score: Some(70),
        risk_mode: Some("review".to_string()),
    }
}

async fn seed(store: &AuditStore, id: &str, status: RequestStatus) {
    store.insert_request(seeded_request(id, status)).await.unwrap();
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() {
    let store = AuditStore::open_in_memory().unwrap();
    let app = app(store, Arc::new(MockToolExecutor::new()));
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn pending_lists_only_pending_requests() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    seed(&store, "r2", RequestStatus::Executed).await;
    seed(&store, "r3", RequestStatus::Pending).await;

    let app = app(store, Arc::new(MockToolExecutor::new()));
    let (status, body) = get(&app, "/pending").await;
    assert_eq!(status, StatusCode::OK);

    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    // Newest first.
    assert_eq!(items[0]["id"], "r3");
    assert_eq!(items[1]["id"], "r1");
    assert_eq!(items[0]["status"], "pending");
    assert_eq!(items[0]["risk_score"], 70);
    // Summary shape: no raw arguments in the listing.
    assert!(items[0].get("arguments_json").is_none());
}

#[tokio::test]
async fn requests_endpoint_filters_by_status() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Denied).await;
    seed(&store, "r2", RequestStatus::Pending).await;

    let app = app(store, Arc::new(MockToolExecutor::new()));

    let (status, body) = get(&app, "/requests?status=denied").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], "r1");

    let (status, body) = get(&app, "/requests").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _) = get(&app, "/requests?limit=9999").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get(&app, "/requests?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("bogus"));
}

#[tokio::test]
async fn status_returns_full_view_or_404() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    store
        .insert_decision(NewDecision {
            id: "d1".to_string(),
            request_id: "r1".to_string(),
            decision: "pending".to_string(),
            matched_policy_id: Some("hold-risky".to_string()),
            matched_condition: "server=* tool=* env=*".to_string(),
            reason: "Approval required (risk.score >= 50)".to_string(),
        })
        .await
        .unwrap();

    let app = app(store, Arc::new(MockToolExecutor::new()));

    let (status, body) = get(&app, "/status/r1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["request"]["id"], "r1");
    assert_eq!(body["request"]["arguments"], json!({"text": "gm"}));
    assert_eq!(body["request"]["risk_mode"], "review");
    assert!(body["request"].get("result_preview").is_none());
    assert_eq!(body["decision"]["policy_id"], "hold-risky");
    assert_eq!(body["decision"]["decision"], "pending");

    let (status, _) = get(&app, "/status/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approve_executes_and_journals() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    let executor = Arc::new(MockToolExecutor::returning(json!({"tweet_id": 99})));
    let app = app(store.clone(), executor.clone());

    let (status, body) = post(&app, "/approve/r1", json!({"approved_by": "alice"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "status": "executed"}));

    // The persisted intent was executed verbatim.
    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "twitter");
    assert_eq!(calls[0].1, "publish_tweet");
    assert_eq!(calls[0].2, json!({"text": "gm"}));

    let row = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Executed);
    assert_eq!(row.approved_by.as_deref(), Some("alice"));
    assert!(row.approved_at.is_some());

    let types: Vec<String> = store
        .events_for("r1")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["approval.granted", "proxy.executed", "tool.result"]);

    // The preview is visible through /status.
    let (_, body) = get(&app, "/status/r1").await;
    assert_eq!(body["request"]["result_preview"], r#"{"tweet_id":99}"#);
}

#[tokio::test]
async fn approve_truncates_long_results() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    let long = "x".repeat(2000);
    let executor = Arc::new(MockToolExecutor::returning(json!(long)));
    let app = app(store.clone(), executor);

    let (status, _) = post(&app, "/approve/r1", json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let view = store.status_view("r1").await.unwrap().unwrap();
    assert_eq!(view.result_preview.unwrap().chars().count(), 500);
}

#[tokio::test]
async fn approve_requires_pending_state() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "done", RequestStatus::Executed).await;
    let executor = Arc::new(MockToolExecutor::new());
    let app = app(store, executor.clone());

    let (status, body) = post(&app, "/approve/done", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("executed"));
    assert_eq!(executor.call_count(), 0);

    let (status, _) = post(&app, "/approve/ghost", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reapprove_is_rejected_without_side_effects() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    let executor = Arc::new(MockToolExecutor::new());
    let app = app(store.clone(), executor.clone());

    let (status, _) = post(&app, "/approve/r1", json!({"approved_by": "alice"})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(&app, "/approve/r1", json!({"approved_by": "bob"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Exactly one execution; the first approver stands.
    assert_eq!(executor.call_count(), 1);
    let row = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(row.approved_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn failed_execution_reports_500_and_failed_status() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    let executor = Arc::new(MockToolExecutor::failing("boom"));
    let app = app(store.clone(), executor);

    let (status, body) = post(&app, "/approve/r1", json!({"approved_by": "alice"})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("r1"));

    let row = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    // The approval itself stayed durable.
    assert_eq!(row.approved_by.as_deref(), Some("alice"));

    let types: Vec<String> = store
        .events_for("r1")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["approval.granted", "proxy.failed"]);
}

#[tokio::test]
async fn deny_transitions_and_skips_execution() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    let executor = Arc::new(MockToolExecutor::new());
    let app = app(store.clone(), executor.clone());

    let (status, body) = post(&app, "/deny/r1", json!({"approved_by": "bob"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "status": "denied"}));
    assert_eq!(executor.call_count(), 0);

    let row = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Denied);

    let events = store.events_for("r1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "approval.denied");
    assert_eq!(events[0].data_json, r#"{"by":"bob"}"#);
}

#[tokio::test]
async fn deny_requires_pending_state() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "done", RequestStatus::Executed).await;
    let app = app(store, Arc::new(MockToolExecutor::new()));

    let (status, _) = post(&app, "/deny/done", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&app, "/deny/ghost", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_body_defaults_to_human_operator() {
    let store = AuditStore::open_in_memory().unwrap();
    seed(&store, "r1", RequestStatus::Pending).await;
    let app = app(store.clone(), Arc::new(MockToolExecutor::new()));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/approve/r1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let row = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(row.approved_by.as_deref(), Some("human"));
}
