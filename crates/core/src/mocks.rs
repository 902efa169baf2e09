//! Mock implementations of core traits for testing.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::traits::ToolExecutor;

/// Scripted tool executor that records every call it receives.
///
/// Defaults to echoing a small JSON object; `failing` makes every call
/// return a `ToolExecution` error instead.
pub struct MockToolExecutor {
    calls: Mutex<Vec<(String, String, serde_json::Value)>>,
    response: serde_json::Value,
    fail_with: Option<String>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            response: serde_json::json!({"ok": true}),
            fail_with: None,
        }
    }

    /// Return `response` from every call.
    pub fn returning(response: serde_json::Value) -> Self {
        Self {
            response,
            ..Self::new()
        }
    }

    /// Fail every call with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new()
        }
    }

    /// Calls received so far, as `(server, tool, args)` triples.
    pub fn calls(&self) -> Vec<(String, String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(
        &self,
        server: &str,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.calls
            .lock()
            .unwrap()
            .push((server.to_string(), tool.to_string(), args.clone()));

        match &self.fail_with {
            Some(msg) => Err(Error::tool_execution(msg.clone())),
            None => Ok(self.response.clone()),
        }
    }
}
