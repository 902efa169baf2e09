#![deny(unused)]
//! Approval HTTP surface for ctrl.
//!
//! Read-only projections of the audit store (`/pending`, `/requests`,
//! `/status/{id}`) plus the two lifecycle endpoints (`/approve/{id}`,
//! `/deny/{id}`). Approval is two-phase: the `approved` status and its
//! audit event commit in one transaction, and only then does the remote
//! tool call run. The audit log stays authoritative even if execution
//! crashes mid-flight.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ctrl_core::{Error, EventType, RequestRow, RequestStatus, Result, ToolExecutor};
use ctrl_store::AuditStore;

/// Approval server configuration.
#[derive(Debug, Clone)]
pub struct ApprovalsConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8788,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub store: AuditStore,
    pub executor: Arc<dyn ToolExecutor>,
}

/// Approval API server.
pub struct ApprovalsServer {
    config: ApprovalsConfig,
    state: Arc<AppState>,
}

impl ApprovalsServer {
    pub fn new(config: ApprovalsConfig, store: AuditStore, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { store, executor }),
        }
    }

    /// Build the Axum router. CORS is permissive: the operator UI lives in
    /// the same trust zone for v0.
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/pending", get(pending_handler))
            .route("/requests", get(requests_handler))
            .route("/status/{id}", get(status_handler))
            .route("/approve/{id}", post(approve_handler))
            .route("/deny/{id}", post(deny_handler))
            .with_state(self.state.clone())
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the process exits.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        tracing::info!(addr = %addr, "Approvals server starting");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind {addr}: {e}")))?;
        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")))?;
        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Body of approve/deny; the operator identity defaults to "human".
#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    pub approved_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// Row projection returned by the list endpoints.
#[derive(Debug, Serialize)]
pub struct RequestSummary {
    pub id: String,
    pub created_at: String,
    pub server: String,
    pub tool: String,
    pub env: String,
    pub status: String,
    pub risk_score: Option<i64>,
}

impl From<RequestRow> for RequestSummary {
    fn from(row: RequestRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            server: row.server,
            tool: row.tool,
            env: row.env,
            status: row.status.as_str().to_string(),
            risk_score: row.risk_score,
        }
    }
}

fn error_response(err: &Error) -> (StatusCode, axum::Json<serde_json::Value>) {
    let code = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidState(_) => StatusCode::BAD_REQUEST,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, axum::Json(serde_json::json!({"error": err.to_string()})))
}

/// Truncate to at most `limit` characters. Cutting on `char` boundaries
/// keeps multi-byte sequences intact; a grapheme may still be split.
pub fn truncate_preview(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

/// Lenient body parse: an absent or malformed body means an anonymous
/// operator, not a 4xx.
fn approved_by(body: &Bytes) -> String {
    serde_json::from_slice::<ApproveBody>(body)
        .ok()
        .and_then(|b| b.approved_by)
        .unwrap_or_else(|| "human".to_string())
}

/// Render a tool result the way an operator wants to skim it: bare strings
/// stay bare, everything else is compact JSON.
fn render_result(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn pending_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state
        .store
        .list_requests(Some(RequestStatus::Pending), 200)
        .await
    {
        Ok(rows) => {
            let summaries: Vec<RequestSummary> = rows.into_iter().map(Into::into).collect();
            (StatusCode::OK, axum::Json(serde_json::json!(summaries))).into_response()
        }
        Err(err) => error_response(&err).into_response(),
    }
}

async fn requests_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => match RequestStatus::parse(raw) {
            Ok(status) => Some(status),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(serde_json::json!({"error": format!("unknown status '{raw}'")})),
                )
                    .into_response()
            }
        },
    };

    // The store clamps to 1..=500.
    let limit = params.limit.unwrap_or(200);
    match state.store.list_requests(status, limit).await {
        Ok(rows) => {
            let summaries: Vec<RequestSummary> = rows.into_iter().map(Into::into).collect();
            (StatusCode::OK, axum::Json(serde_json::json!(summaries))).into_response()
        }
        Err(err) => error_response(&err).into_response(),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let view = match state.store.status_view(id.clone()).await {
        Ok(Some(view)) => view,
        Ok(None) => {
            return error_response(&Error::not_found(format!("request {id}"))).into_response()
        }
        Err(err) => return error_response(&err).into_response(),
    };

    let arguments: serde_json::Value =
        serde_json::from_str(&view.request.arguments_json).unwrap_or(serde_json::json!({}));

    let mut request = serde_json::json!({
        "id": view.request.id,
        "created_at": view.request.created_at,
        "server": view.request.server,
        "tool": view.request.tool,
        "env": view.request.env,
        "actor": view.request.actor,
        "status": view.request.status.as_str(),
        "risk_score": view.request.risk_score,
        "risk_mode": view.request.risk_mode,
        "approved_at": view.request.approved_at,
        "approved_by": view.request.approved_by,
        "arguments": arguments,
    });
    if let Some(preview) = view.result_preview {
        request["result_preview"] = serde_json::Value::String(preview);
    }

    let decision = view.decision.map(|d| {
        serde_json::json!({
            "decided_at": d.decided_at,
            "decision": d.decision,
            "policy_id": d.matched_policy_id,
            "matched": d.matched_condition,
            "reason": d.reason,
        })
    });

    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "request": request,
            "decision": decision,
        })),
    )
        .into_response()
}

async fn deny_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let by = approved_by(&body);

    let outcome = state
        .store
        .transition_with_event(
            id.clone(),
            RequestStatus::Pending,
            RequestStatus::Denied,
            EventType::ApprovalDenied,
            serde_json::json!({"by": by}),
        )
        .await;

    match outcome {
        Ok(()) => {
            tracing::info!(request_id = %id, by = %by, "Request denied by operator");
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({"ok": true, "status": "denied"})),
            )
                .into_response()
        }
        Err(err) => error_response(&err).into_response(),
    }
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let by = approved_by(&body);

    let row = match state.store.get_request(id.clone()).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return error_response(&Error::not_found(format!("request {id}"))).into_response()
        }
        Err(err) => return error_response(&err).into_response(),
    };

    // Phase one: durable approval. Commits status, approver and the
    // approval.granted event before any network I/O.
    if let Err(err) = state.store.approve(id.clone(), by.clone()).await {
        return error_response(&err).into_response();
    }
    tracing::info!(request_id = %id, by = %by, "Request approved; executing");

    let args: serde_json::Value =
        serde_json::from_str(&row.arguments_json).unwrap_or(serde_json::json!({}));

    // Phase two: execute outside any transaction.
    match state.executor.execute(&row.server, &row.tool, &args).await {
        Ok(result) => {
            let preview = truncate_preview(&render_result(&result), 500);
            let record = async {
                state
                    .store
                    .transition_with_event(
                        id.clone(),
                        RequestStatus::Approved,
                        RequestStatus::Executed,
                        EventType::ProxyExecuted,
                        serde_json::json!({"ok": true}),
                    )
                    .await?;
                state
                    .store
                    .insert_event(
                        Some(id.clone()),
                        EventType::ToolResult,
                        serde_json::json!({"result_preview": preview}),
                    )
                    .await?;
                Ok::<(), Error>(())
            };
            if let Err(err) = record.await {
                return error_response(&err).into_response();
            }
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({"ok": true, "status": "executed"})),
            )
                .into_response()
        }
        Err(exec_err) => {
            tracing::error!(request_id = %id, error = %exec_err, "Post-approval execution failed");
            if let Err(err) = state
                .store
                .transition_with_event(
                    id.clone(),
                    RequestStatus::Approved,
                    RequestStatus::Failed,
                    EventType::ProxyFailed,
                    serde_json::json!({"error": exec_err.to_string()}),
                )
                .await
            {
                return error_response(&err).into_response();
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({
                    "error": format!("execution failed: {exec_err} (request {id})"),
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_preview("hello", 500), "hello");
        assert_eq!(truncate_preview("hello", 3), "hel");
        // Multi-byte characters are never split.
        let s = "é".repeat(600);
        let out = truncate_preview(&s, 500);
        assert_eq!(out.chars().count(), 500);
        assert!(out.is_char_boundary(out.len()));
    }

    #[test]
    fn results_render_bare_strings_and_compact_json() {
        assert_eq!(render_result(&serde_json::json!("plain")), "plain");
        assert_eq!(render_result(&serde_json::json!({"a": 1})), r#"{"a":1}"#);
    }
}
