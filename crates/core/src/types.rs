//! Shared data model: intents, request lifecycle, audit rows.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// A proposed tool invocation, as intercepted from the agent runtime.
///
/// `headers` carries transport metadata (`x-ctrl-env` selects the
/// environment); `actor` is a best-effort identity from the runtime context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Remote server name, as configured in servers.yaml.
    pub server: String,
    /// Tool name on that server.
    pub tool: String,
    /// Tool arguments (a JSON object).
    pub args: serde_json::Value,
    /// Caller identity, if the runtime provided one.
    pub actor: Option<String>,
    /// Transport headers attached to the call.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ToolCallRequest {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            args,
            actor: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle status of an intercepted request.
///
/// `proposed → {allowed, denied, pending}`; `allowed → {executed, failed}`;
/// `pending → {approved, denied}`; `approved → {executed, failed}`.
/// `denied`, `executed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Proposed,
    Allowed,
    Denied,
    Pending,
    Approved,
    Executed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "allowed" => Ok(Self::Allowed),
            "denied" => Ok(Self::Denied),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::internal(format!("unknown request status: {other}"))),
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Executed | Self::Failed)
    }

    /// Whether `self → to` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, to),
            (Proposed, Allowed)
                | (Proposed, Denied)
                | (Proposed, Pending)
                | (Allowed, Executed)
                | (Allowed, Failed)
                | (Pending, Approved)
                | (Pending, Denied)
                | (Approved, Executed)
                | (Approved, Failed)
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per intercepted intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRow {
    pub id: String,
    pub created_at: String,
    pub server: String,
    pub tool: String,
    pub arguments_json: String,
    pub arguments_hash: String,
    pub actor: Option<String>,
    pub env: String,
    pub status: RequestStatus,
    pub risk_score: Option<i64>,
    pub risk_mode: Option<String>,
    pub approved_at: Option<String>,
    pub approved_by: Option<String>,
}

/// One row per policy evaluation of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRow {
    pub id: String,
    pub request_id: String,
    pub decided_at: String,
    pub decision: String,
    pub matched_policy_id: Option<String>,
    pub matched_condition: String,
    pub reason: String,
}

/// One row of the append-only audit event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    pub created_at: String,
    pub request_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data_json: String,
}
