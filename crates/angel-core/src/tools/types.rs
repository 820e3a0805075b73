//! Tool invocation types

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::AngelResult;
use crate::fs::SessionFs;
use crate::storage::message::Attachment;
use crate::storage::session_db::SessionDb;
use crate::types::SessionId;

/// A function call as persisted in a function-call message and dispatched
/// through the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Parse the JSON text of a function-call message
    pub fn from_message_text(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Render as the JSON text of a function-call message
    pub fn to_message_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// What a handler produced
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// JSON-serializable value plus blobs to attach to the assistant's next
    /// visible turn
    Success {
        value: Value,
        attachments: Vec<Attachment>,
    },
    /// Sentinel: the invocation is blocked until the user approves or
    /// denies; the payload is persisted on the branch
    PendingConfirmation { context: Value },
}

impl ToolOutcome {
    pub fn success(value: Value) -> Self {
        Self::Success {
            value,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(value: Value, attachments: Vec<Attachment>) -> Self {
        Self::Success { value, attachments }
    }

    pub fn pending(context: Value) -> Self {
        Self::PendingConfirmation { context }
    }
}

/// Handler-level failure: captured as a structured function response so the
/// model can see it and recover. Never surfaced to the HTTP client.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ToolFailure {
    pub message: String,
}

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<crate::error::AngelError> for ToolFailure {
    fn from(err: crate::error::AngelError) -> Self {
        Self::new(err.to_string())
    }
}

/// Spawns a child orchestrator on a sub-session; injected by the engine so
/// tool crates never depend on the loop directly
#[async_trait::async_trait]
pub trait SubagentSpawner: Send + Sync {
    async fn run_subagent(&self, parent: &SessionId, task: &str) -> AngelResult<String>;
}

/// Everything a handler may touch
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub fs: Arc<SessionFs>,
    pub db: Arc<SessionDb>,
    /// True when the user approved a pending confirmation and the handler
    /// is re-invoked
    pub confirmation_received: bool,
    pub cancel: CancellationToken,
    pub subagent: Option<Arc<dyn SubagentSpawner>>,
}

impl ToolContext {
    /// Local identifier of the session inside its database
    pub fn local_id(&self) -> String {
        self.session_id.local_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_text_round_trip() {
        let mut args = serde_json::Map::new();
        args.insert("file_path".into(), Value::String("a.txt".into()));
        let call = ToolCall::new("read_file", args);
        let text = call.to_message_text();
        let parsed = ToolCall::from_message_text(&text).unwrap();
        assert_eq!(parsed.name, "read_file");
        assert_eq!(parsed.args["file_path"], "a.txt");
    }

    #[test]
    fn test_outcome_constructors() {
        let outcome = ToolOutcome::success(serde_json::json!({"ok": true}));
        assert!(matches!(outcome, ToolOutcome::Success { .. }));
        let outcome = ToolOutcome::pending(serde_json::json!({"file": "x"}));
        assert!(matches!(outcome, ToolOutcome::PendingConfirmation { .. }));
    }
}
