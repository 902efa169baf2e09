//! Trait seams between the control plane and its collaborators.

use async_trait::async_trait;

use crate::error::Result;

/// Adapter to the remote tool transport.
///
/// Given a configured server name, a tool name and JSON arguments, returns
/// the tool's result or an error. The control plane treats this as an
/// opaque collaborator: both the synchronous allow path and post-approval
/// execution go through it.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        server: &str,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}
