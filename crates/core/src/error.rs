//! Error types for ctrl.

use thiserror::Error;

/// Result type alias using ctrl's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for ctrl.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration
    // =========================================================================
    #[error("Config error: {0}")]
    Config(String),

    // =========================================================================
    // Expressions
    // =========================================================================
    #[error("Expression error: {0}")]
    Expr(String),

    // =========================================================================
    // Enforcement
    // =========================================================================
    /// The policy engine denied the call. A request row is persisted in
    /// `denied` status under `request_id`.
    #[error("ctrl denied tool call: {server}.{tool} — {reason} (request {request_id})")]
    PolicyDenied {
        request_id: String,
        server: String,
        tool: String,
        reason: String,
    },

    /// The call was parked for human approval. The request row is in
    /// `pending` status under `request_id` and must be resolved out of band.
    #[error("ctrl requires approval (pending): {server}.{tool} — {reason} (request {request_id})")]
    ApprovalRequired {
        request_id: String,
        server: String,
        tool: String,
        reason: String,
    },

    // =========================================================================
    // Remote execution
    // =========================================================================
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // =========================================================================
    // Store / HTTP
    // =========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Generic
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an expression error.
    pub fn expr(msg: impl Into<String>) -> Self {
        Self::Expr(msg.into())
    }

    /// Create a tool not found error.
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound(name.into())
    }

    /// Create a tool execution error.
    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Self::ToolExecution(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
