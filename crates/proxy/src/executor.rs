//! HTTP adapter to remote tool servers.
//!
//! Servers are addressed by the name they carry in servers.yaml. The wire
//! format is a JSON-RPC 2.0 `tools/call` envelope posted to the server's
//! base URL; transport failures, timeouts, non-2xx responses and JSON-RPC
//! error objects all surface as typed errors.

use async_trait::async_trait;
use std::time::Duration;

use ctrl_core::config::ServersConfig;
use ctrl_core::{Error, Result, ToolExecutor};

pub struct HttpToolExecutor {
    servers: ServersConfig,
    client: reqwest::Client,
}

impl HttpToolExecutor {
    pub fn new(servers: ServersConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { servers, client })
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(
        &self,
        server: &str,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let entry = self
            .servers
            .get(server)
            .ok_or_else(|| Error::tool_not_found(format!("server '{server}' is not configured")))?;

        tracing::info!(server = %server, tool = %tool, url = %entry.base_url, "Calling remote tool");

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": tool, "arguments": args},
        });

        let response = self
            .client
            .post(&entry.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("tool call {server}.{tool} timed out"))
                } else {
                    Error::tool_execution(format!("{server}.{tool}: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::tool_execution(format!(
                "{server}.{tool}: server returned {status}"
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::tool_execution(format!("{server}.{tool}: bad response: {e}")))?;

        if let Some(err) = payload.get("error") {
            return Err(Error::tool_execution(format!("{server}.{tool}: {err}")));
        }

        Ok(payload.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }
}
