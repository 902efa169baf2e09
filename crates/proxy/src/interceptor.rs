//! The intercept → score → decide → enforce → record pipeline.
//!
//! Every intended tool call flows through [`Interceptor::intercept`]. The
//! request row and every audit event are committed before any enforcement
//! error is raised or any remote call starts, so a cancelled caller never
//! leaves a request in an intermediate state.

use std::sync::Arc;
use uuid::Uuid;

use ctrl_core::canonical::{canonical_json, sha256_hex};
use ctrl_core::config::{Effect, PolicyConfig};
use ctrl_core::{Error, EventType, RequestStatus, Result, ToolCallRequest, ToolExecutor};
use ctrl_policy::{decide_explain, requires_approval};
use ctrl_risk::RiskEngine;
use ctrl_store::{AuditStore, NewDecision, NewRequest};

/// Header consulted for the intent's environment.
const ENV_HEADER: &str = "x-ctrl-env";

pub struct Interceptor {
    store: AuditStore,
    policy: Arc<PolicyConfig>,
    risk: Arc<RiskEngine>,
    executor: Arc<dyn ToolExecutor>,
    default_env: String,
}

impl Interceptor {
    pub fn new(
        store: AuditStore,
        policy: Arc<PolicyConfig>,
        risk: Arc<RiskEngine>,
        executor: Arc<dyn ToolExecutor>,
        default_env: impl Into<String>,
    ) -> Self {
        Self {
            store,
            policy,
            risk,
            executor,
            default_env: default_env.into(),
        }
    }

    /// Run one intent through the full pipeline.
    ///
    /// Returns the tool result on the allow path; raises `PolicyDenied`,
    /// `ApprovalRequired` or the remote failure otherwise. Enforcement
    /// outcomes are journaled before they are raised.
    pub async fn intercept(&self, call: &ToolCallRequest) -> Result<serde_json::Value> {
        let server = non_empty(&call.server, "unknown");
        let tool = non_empty(&call.tool, "unknown");
        let env = call
            .headers
            .get(ENV_HEADER)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| self.default_env.clone());
        let actor = call.actor.clone();

        let request_id = Uuid::new_v4().to_string();
        let arguments_json = canonical_json(&call.args);
        let arguments_hash = sha256_hex(&arguments_json);

        // Risk first, so the request row carries its score from the start.
        let risk = self.risk.score(server, tool, &env, &call.args);
        let risk_json = risk.to_json();

        tracing::info!(
            request_id = %request_id,
            server = %server,
            tool = %tool,
            env = %env,
            risk_mode = %risk.mode,
            risk_score = risk.score,
            "Intercepted tool call"
        );

        self.store
            .insert_request(NewRequest {
                id: request_id.clone(),
                server: server.to_string(),
                tool: tool.to_string(),
                arguments_json,
                arguments_hash,
                actor: actor.clone(),
                env: env.clone(),
                status: RequestStatus::Proposed,
                risk_score: Some(risk.score),
                risk_mode: Some(risk.mode.clone()),
            })
            .await?;

        self.store
            .insert_event(
                Some(request_id.clone()),
                EventType::RequestCreated,
                serde_json::json!({"server": server, "tool": tool, "env": env, "actor": actor}),
            )
            .await?;
        self.store
            .insert_event(Some(request_id.clone()), EventType::RiskScored, risk_json.clone())
            .await?;

        let mut decision = decide_explain(&self.policy, server, tool, &env);

        self.store
            .insert_decision(NewDecision {
                id: Uuid::new_v4().to_string(),
                request_id: request_id.clone(),
                decision: decision.decision.as_str().to_string(),
                matched_policy_id: decision.policy_id.clone(),
                matched_condition: decision.matched.clone(),
                reason: decision.reason.clone(),
            })
            .await?;
        self.store
            .insert_event(
                Some(request_id.clone()),
                EventType::DecisionMade,
                serde_json::json!({
                    "decision": decision.decision.as_str(),
                    "policy_id": decision.policy_id,
                    "reason": decision.reason,
                    "matched": decision.matched,
                }),
            )
            .await?;

        // Approval gating: the matched policy may force `pending` based on
        // the risk result. Fails closed inside `requires_approval`.
        let matched_policy = decision
            .policy_id
            .as_deref()
            .and_then(|id| self.policy.get(id));
        if let Some(policy) = matched_policy {
            if requires_approval(policy.require_approval_if.as_deref(), &risk) {
                let expr = policy.require_approval_if.as_deref().unwrap_or("risk-gated");
                decision.decision = Effect::Pending;
                decision.reason = format!("Approval required ({expr})");
                self.store
                    .insert_event(
                        Some(request_id.clone()),
                        EventType::DecisionOverridden,
                        serde_json::json!({
                            "to": "pending",
                            "because": "require_approval_if",
                            "risk": risk_json,
                        }),
                    )
                    .await?;
            }
        }

        match decision.decision {
            Effect::Deny => {
                self.store
                    .transition_with_event(
                        request_id.clone(),
                        RequestStatus::Proposed,
                        RequestStatus::Denied,
                        EventType::RequestDenied,
                        serde_json::json!({"reason": decision.reason, "risk": risk_json}),
                    )
                    .await?;
                tracing::warn!(request_id = %request_id, reason = %decision.reason, "Denied");
                Err(Error::PolicyDenied {
                    request_id,
                    server: server.to_string(),
                    tool: tool.to_string(),
                    reason: decision.reason,
                })
            }
            Effect::Pending => {
                self.store
                    .transition_with_event(
                        request_id.clone(),
                        RequestStatus::Proposed,
                        RequestStatus::Pending,
                        EventType::RequestPending,
                        serde_json::json!({"reason": decision.reason, "risk": risk_json}),
                    )
                    .await?;
                tracing::info!(request_id = %request_id, "Parked for approval");
                Err(Error::ApprovalRequired {
                    request_id,
                    server: server.to_string(),
                    tool: tool.to_string(),
                    reason: decision.reason,
                })
            }
            Effect::Allow => {
                self.store
                    .transition_with_event(
                        request_id.clone(),
                        RequestStatus::Proposed,
                        RequestStatus::Allowed,
                        EventType::ProxyForwarding,
                        serde_json::json!({"server": server, "tool": tool, "risk": risk_json}),
                    )
                    .await?;

                match self.executor.execute(server, tool, &call.args).await {
                    Ok(result) => {
                        self.store
                            .transition_with_event(
                                request_id.clone(),
                                RequestStatus::Allowed,
                                RequestStatus::Executed,
                                EventType::ProxyExecuted,
                                serde_json::json!({"ok": true}),
                            )
                            .await?;
                        Ok(result)
                    }
                    Err(err) => {
                        self.store
                            .transition_with_event(
                                request_id.clone(),
                                RequestStatus::Allowed,
                                RequestStatus::Failed,
                                EventType::ProxyFailed,
                                serde_json::json!({"error": err.to_string()}),
                            )
                            .await?;
                        tracing::error!(request_id = %request_id, error = %err, "Remote call failed");
                        Err(err)
                    }
                }
            }
        }
    }
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
