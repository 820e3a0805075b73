//! Error types for the angel session engine

use thiserror::Error;

/// Result type alias for engine operations
pub type AngelResult<T> = Result<T, AngelError>;

/// Main error type for the angel engine
///
/// Variants are error *kinds*, not exception types: callers dispatch on the
/// kind to pick an HTTP status or a recovery strategy.
#[derive(Error, Debug)]
pub enum AngelError {
    /// Bad request shape, invalid session ID, schema mismatch in tool arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// Session, message, branch, or blob missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Second active call on a session, illegal in-place edit, double confirmation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// LLM backend returned an error or closed mid-stream
    #[error("Provider error: {0}")]
    Provider(String),

    /// Tool handler violated its contract (handler-level failures are fed
    /// back to the model as structured responses instead)
    #[error("Tool error: {tool_name}: {message}")]
    Tool { tool_name: String, message: String },

    /// Database failure, wrapped with context
    #[error("Storage error: {0}")]
    Storage(String),

    /// Sandbox or filesystem access outside the permitted roots
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The call was cancelled
    #[error("Call was cancelled")]
    Cancelled,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AngelError {
    /// Create a new validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a new conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a new provider error
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Create a new tool error
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a new permission error
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is the caller's fault (4xx family)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::Conflict(_) | Self::Permission(_)
        )
    }

    /// Stable kind marker for structured responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Provider(_) => "provider",
            Self::Tool { .. } => "tool",
            Self::Storage(_) => "storage",
            Self::Permission(_) => "permission",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Http(_) => "http",
            Self::Other(_) => "other",
        }
    }
}

impl From<rusqlite::Error> for AngelError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row not found".to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_markers() {
        assert_eq!(AngelError::validation("bad").kind(), "validation");
        assert_eq!(AngelError::conflict("busy").kind(), "conflict");
        assert_eq!(AngelError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_client_errors() {
        assert!(AngelError::not_found("x").is_client_error());
        assert!(AngelError::permission("x").is_client_error());
        assert!(!AngelError::storage("x").is_client_error());
        assert!(!AngelError::Cancelled.is_client_error());
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err: AngelError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), "not_found");
    }
}
