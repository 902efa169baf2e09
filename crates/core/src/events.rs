//! Audit event vocabulary.
//!
//! Event types form a closed, dotted-string set. Everything the pipeline and
//! the approval surface journal goes through one of these.

use serde::{Deserialize, Serialize};

/// The closed set of audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "request.created")]
    RequestCreated,
    #[serde(rename = "risk.scored")]
    RiskScored,
    #[serde(rename = "decision.made")]
    DecisionMade,
    #[serde(rename = "decision.overridden")]
    DecisionOverridden,
    #[serde(rename = "request.denied")]
    RequestDenied,
    #[serde(rename = "request.pending")]
    RequestPending,
    #[serde(rename = "proxy.forwarding")]
    ProxyForwarding,
    #[serde(rename = "proxy.executed")]
    ProxyExecuted,
    #[serde(rename = "proxy.failed")]
    ProxyFailed,
    #[serde(rename = "approval.granted")]
    ApprovalGranted,
    #[serde(rename = "approval.denied")]
    ApprovalDenied,
    #[serde(rename = "tool.result")]
    ToolResult,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestCreated => "request.created",
            Self::RiskScored => "risk.scored",
            Self::DecisionMade => "decision.made",
            Self::DecisionOverridden => "decision.overridden",
            Self::RequestDenied => "request.denied",
            Self::RequestPending => "request.pending",
            Self::ProxyForwarding => "proxy.forwarding",
            Self::ProxyExecuted => "proxy.executed",
            Self::ProxyFailed => "proxy.failed",
            Self::ApprovalGranted => "approval.granted",
            Self::ApprovalDenied => "approval.denied",
            Self::ToolResult => "tool.result",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current UTC time as ISO-8601 at second resolution (`2024-01-01T00:00:00Z`).
///
/// Second resolution matches the audit contract: per-request ordering is
/// carried by write order plus unique event ids, not by timestamp precision.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_render_dotted_names() {
        assert_eq!(EventType::RequestCreated.as_str(), "request.created");
        assert_eq!(EventType::ToolResult.to_string(), "tool.result");
    }

    #[test]
    fn now_iso_is_second_resolution_utc() {
        let ts = now_iso();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }
}
