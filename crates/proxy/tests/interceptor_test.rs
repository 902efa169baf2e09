//! End-to-end pipeline tests: intercept → risk → policy → enforce → audit.

use std::sync::Arc;

use ctrl_core::canonical::{canonical_json, sha256_hex};
use ctrl_core::config::{PolicyConfig, RiskConfigFile};
use ctrl_core::mocks::MockToolExecutor;
use ctrl_core::{Error, RequestStatus, ToolCallRequest};
use ctrl_proxy::Interceptor;
use ctrl_risk::RiskEngine;
use ctrl_store::AuditStore;
use serde_json::json;

const LADDER: &str = "
risk:
  mode: modes
  modes:
    safe: {score: 0}
    review: {score: 40}
    danger: {score: 80}
";

fn policy_cfg(yaml: &str) -> Arc<PolicyConfig> {
    let cfg: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
    cfg.validate().unwrap();
    Arc::new(cfg)
}

fn risk_engine(yaml: &str) -> Arc<RiskEngine> {
    let file: RiskConfigFile = serde_yaml::from_str(yaml).unwrap();
    Arc::new(RiskEngine::new(file.risk).unwrap())
}

fn interceptor(
    policy_yaml: &str,
    risk_yaml: &str,
    executor: Arc<MockToolExecutor>,
) -> (Interceptor, AuditStore) {
    let store = AuditStore::open_in_memory().unwrap();
    let interceptor = Interceptor::new(
        store.clone(),
        policy_cfg(policy_yaml),
        risk_engine(risk_yaml),
        executor,
        "dev",
    );
    (interceptor, store)
}

async fn event_types(store: &AuditStore, request_id: &str) -> Vec<String> {
    store
        .events_for(request_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn allow_path_forwards_and_journals() {
    let executor = Arc::new(MockToolExecutor::returning(json!({"markets": 42})));
    let (interceptor, store) = interceptor(
        "policies:\n  - id: allow-coingecko\n    match: {server: coingecko}\n    effect: allow\n",
        LADDER,
        executor.clone(),
    );

    let call = ToolCallRequest::new("coingecko", "get_markets", json!({}));
    let result = interceptor.intercept(&call).await.unwrap();
    assert_eq!(result, json!({"markets": 42}));
    assert_eq!(executor.call_count(), 1);

    let rows = store.list_requests(None, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.status, RequestStatus::Executed);
    assert_eq!(row.risk_mode.as_deref(), Some("safe"));

    assert_eq!(
        event_types(&store, &row.id).await,
        vec![
            "request.created",
            "risk.scored",
            "decision.made",
            "proxy.forwarding",
            "proxy.executed",
        ]
    );
}

#[tokio::test]
async fn empty_policy_list_denies_by_default() {
    let executor = Arc::new(MockToolExecutor::new());
    let (interceptor, store) = interceptor("policies: []\n", LADDER, executor.clone());

    let call = ToolCallRequest::new("x", "y", json!({}));
    let err = interceptor.intercept(&call).await.unwrap_err();

    let request_id = match err {
        Error::PolicyDenied {
            request_id,
            server,
            tool,
            reason,
        } => {
            assert_eq!(server, "x");
            assert_eq!(tool, "y");
            assert_eq!(reason, "No policy matched");
            request_id
        }
        other => panic!("expected PolicyDenied, got {other:?}"),
    };

    // The remote adapter is never consulted on deny.
    assert_eq!(executor.call_count(), 0);

    let row = store.get_request(request_id.clone()).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Denied);

    let view = store.status_view(request_id.clone()).await.unwrap().unwrap();
    let decision = view.decision.unwrap();
    assert_eq!(decision.decision, "deny");
    assert_eq!(decision.matched_policy_id, None);
    assert_eq!(decision.matched_condition, "none");

    assert_eq!(
        event_types(&store, &request_id).await,
        vec!["request.created", "risk.scored", "decision.made", "request.denied"]
    );
}

#[tokio::test]
async fn require_approval_if_overrides_allow_to_pending() {
    let executor = Arc::new(MockToolExecutor::new());
    let risk_yaml = "
risk:
  mode: modes
  modes:
    safe: {score: 0}
    review: {score: 40}
    danger: {score: 80}
  rules:
    - name: tweet-risk
      when: {tool: publish_tweet}
      score_expr: \"70\"
";
    let (interceptor, store) = interceptor(
        "policies:\n  - id: hold-risky\n    match: {}\n    effect: allow\n    require_approval_if: \"risk.score >= 50\"\n",
        risk_yaml,
        executor.clone(),
    );

    let call = ToolCallRequest::new("twitter", "publish_tweet", json!({"text": "gm"}));
    let err = interceptor.intercept(&call).await.unwrap_err();

    let request_id = match err {
        Error::ApprovalRequired {
            request_id, reason, ..
        } => {
            assert_eq!(reason, "Approval required (risk.score >= 50)");
            request_id
        }
        other => panic!("expected ApprovalRequired, got {other:?}"),
    };

    assert_eq!(executor.call_count(), 0);

    let row = store.get_request(request_id.clone()).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Pending);
    assert_eq!(row.risk_score, Some(70));

    let events = store.events_for(request_id.clone()).await.unwrap();
    let overridden = events
        .iter()
        .find(|e| e.event_type == "decision.overridden")
        .expect("decision.overridden event");
    let data: serde_json::Value = serde_json::from_str(&overridden.data_json).unwrap();
    assert_eq!(data["to"], "pending");
    assert_eq!(data["because"], "require_approval_if");
    assert_eq!(data["risk"]["score"], 70);

    // The decision row still names the original policy.
    let view = store.status_view(request_id).await.unwrap().unwrap();
    assert_eq!(
        view.decision.unwrap().matched_policy_id.as_deref(),
        Some("hold-risky")
    );
}

#[tokio::test]
async fn below_threshold_risk_does_not_trigger_approval() {
    let executor = Arc::new(MockToolExecutor::new());
    let (interceptor, _store) = interceptor(
        "policies:\n  - id: hold-risky\n    match: {}\n    effect: allow\n    require_approval_if: \"risk.score >= 50\"\n",
        LADDER,
        executor.clone(),
    );

    let call = ToolCallRequest::new("coingecko", "get_markets", json!({}));
    interceptor.intercept(&call).await.unwrap();
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn pending_effect_parks_without_condition() {
    let executor = Arc::new(MockToolExecutor::new());
    let (interceptor, store) = interceptor(
        "policies:\n  - id: hold-all\n    match: {}\n    effect: pending\n    reason: Needs review\n",
        LADDER,
        executor.clone(),
    );

    let call = ToolCallRequest::new("github", "create_issue", json!({"title": "t"}));
    let err = interceptor.intercept(&call).await.unwrap_err();
    let request_id = match err {
        Error::ApprovalRequired { request_id, .. } => request_id,
        other => panic!("expected ApprovalRequired, got {other:?}"),
    };

    let types = event_types(&store, &request_id).await;
    // No override event: the policy was pending as written.
    assert!(!types.contains(&"decision.overridden".to_string()));
    assert_eq!(types.last().map(String::as_str), Some("request.pending"));
}

#[tokio::test]
async fn remote_failure_marks_failed_and_reraises() {
    let executor = Arc::new(MockToolExecutor::failing("connection refused"));
    let (interceptor, store) = interceptor(
        "policies:\n  - id: allow-all\n    match: {}\n    effect: allow\n",
        LADDER,
        executor,
    );

    let call = ToolCallRequest::new("coingecko", "get_markets", json!({}));
    let err = interceptor.intercept(&call).await.unwrap_err();
    assert!(matches!(err, Error::ToolExecution(_)));

    let rows = store.list_requests(None, 10).await.unwrap();
    let row = &rows[0];
    assert_eq!(row.status, RequestStatus::Failed);

    let events = store.events_for(row.id.clone()).await.unwrap();
    let failed = events.iter().find(|e| e.event_type == "proxy.failed").unwrap();
    assert!(failed.data_json.contains("connection refused"));
}

#[tokio::test]
async fn arguments_are_canonicalized_and_hashed() {
    let executor = Arc::new(MockToolExecutor::new());
    let (interceptor, store) = interceptor(
        "policies:\n  - id: allow-all\n    match: {}\n    effect: allow\n",
        LADDER,
        executor,
    );

    let args = json!({"b": 2, "a": {"y": 1, "x": [1, 2]}});
    let call = ToolCallRequest::new("coingecko", "get_markets", args.clone());
    interceptor.intercept(&call).await.unwrap();

    let row = store.list_requests(None, 1).await.unwrap().remove(0);
    assert_eq!(row.arguments_json, canonical_json(&args));
    assert_eq!(row.arguments_hash, sha256_hex(&row.arguments_json));
    // Sorted keys, no whitespace.
    assert_eq!(row.arguments_json, r#"{"a":{"x":[1,2],"y":1},"b":2}"#);
}

#[tokio::test]
async fn env_header_and_actor_are_recorded() {
    let executor = Arc::new(MockToolExecutor::new());
    let (interceptor, store) = interceptor(
        "policies:\n  - id: allow-dev\n    match: {env: dev}\n    effect: allow\n  - id: deny-prod\n    match: {env: prod}\n    effect: deny\n    reason: Not in prod\n",
        LADDER,
        executor,
    );

    let call = ToolCallRequest::new("coingecko", "get_markets", json!({}))
        .with_actor("alice")
        .with_header("x-ctrl-env", "prod");
    let err = interceptor.intercept(&call).await.unwrap_err();
    assert!(matches!(err, Error::PolicyDenied { .. }));

    let row = store.list_requests(None, 1).await.unwrap().remove(0);
    assert_eq!(row.env, "prod");
    assert_eq!(row.actor.as_deref(), Some("alice"));
}

#[tokio::test]
async fn sandbox_escape_in_risk_vars_still_scores() {
    let executor = Arc::new(MockToolExecutor::new());
    let risk_yaml = "
risk:
  mode: modes
  modes:
    safe: {score: 0}
    review: {score: 40}
    danger: {score: 80}
  vars:
    oops: \"__import__('os').system('x')\"
";
    let (interceptor, store) = interceptor(
        "policies:\n  - id: allow-all\n    match: {}\n    effect: allow\n",
        risk_yaml,
        executor,
    );

    let call = ToolCallRequest::new("coingecko", "get_markets", json!({}));
    interceptor.intercept(&call).await.unwrap();

    // Scoring continued with the var bound to 0.
    let row = store.list_requests(None, 1).await.unwrap().remove(0);
    assert_eq!(row.risk_score, Some(0));
    assert_eq!(row.status, RequestStatus::Executed);
}
