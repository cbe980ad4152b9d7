use thiserror::Error;

use crate::status::FlowNodeStatus;

#[derive(Debug, Error)]
pub enum SluiceError {
    // Contract violations
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // Retry errors
    #[error("Retry batch is empty")]
    EmptyBatch,

    #[error("Retry batch mixes statuses: expected {expected}, found {found}")]
    HeterogeneousBatch {
        expected: FlowNodeStatus,
        found: FlowNodeStatus,
    },

    // Processing errors
    #[error("Node failed: {node}: {message}")]
    Node { node: String, message: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Upstream failed: {0}")]
    Upstream(String),

    #[error("Subscription cancelled")]
    Cancelled,

    // Storage errors
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SluiceError {
    /// Shorthand for a node failure.
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Node {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Whether the error is a caller bug rather than a runtime failure.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SluiceError::InvalidArgument(_)
                | SluiceError::EmptyBatch
                | SluiceError::HeterogeneousBatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SluiceError>;

/// Reject non-positive values with `InvalidArgument`.
pub fn ensure_positive(value: i64, what: &str) -> Result<()> {
    if value <= 0 {
        return Err(SluiceError::InvalidArgument(format!(
            "{} must be positive [value={}]",
            what, value
        )));
    }
    Ok(())
}
