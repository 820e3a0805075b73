//! Message rows and the message taxonomy

use serde::{Deserialize, Serialize};

use crate::types::{BranchId, MessageId};

/// Message type tag.
///
/// The payload shape is determined by the tag plus the free-form text field
/// interpreted per-tag: function calls and responses carry JSON in `text`,
/// compression summaries carry the extracted snapshot, commands carry the
/// raw command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    UserText,
    ModelText,
    Thought,
    FunctionCall,
    FunctionResponse,
    SystemPrompt,
    EnvChange,
    Compression,
    Command,
    ModelError,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserText => "user_text",
            Self::ModelText => "model_text",
            Self::Thought => "thought",
            Self::FunctionCall => "function_call",
            Self::FunctionResponse => "function_response",
            Self::SystemPrompt => "system_prompt",
            Self::EnvChange => "env_change",
            Self::Compression => "compression",
            Self::Command => "command",
            Self::ModelError => "model_error",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_text" => Some(Self::UserText),
            "model_text" => Some(Self::ModelText),
            "thought" => Some(Self::Thought),
            "function_call" => Some(Self::FunctionCall),
            "function_response" => Some(Self::FunctionResponse),
            "system_prompt" => Some(Self::SystemPrompt),
            "env_change" => Some(Self::EnvChange),
            "compression" => Some(Self::Compression),
            "command" => Some(Self::Command),
            "model_error" => Some(Self::ModelError),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether text of this kind participates in full-text search
    pub fn default_indexed(&self) -> bool {
        matches!(
            self,
            Self::UserText | Self::ModelText | Self::SystemPrompt | Self::Compression
        )
    }

    /// Whether in-place edit of the text is allowed
    pub fn editable(&self) -> bool {
        matches!(self, Self::UserText | Self::ModelText)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ModelError | Self::Error)
    }
}

/// A reference from a message to a blob in the same session database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub hash: String,
    pub file_name: String,
    pub mime_type: String,
    /// Set when a prior `/clearblobs` hides the bytes from the LLM view
    /// while the storage row is retained
    #[serde(default)]
    pub omitted: bool,
}

/// A stored message row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    /// Local session identifier (empty for the main session)
    pub session_id: String,
    pub branch_id: BranchId,
    pub parent_id: Option<MessageId>,
    pub chosen_next_id: Option<MessageId>,
    pub kind: MessageKind,
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Cumulative token count at this point of the conversation
    pub cumul_tokens: i64,
    pub created_at: i64,
    pub model: Option<String>,
    pub env_generation: i64,
    /// Free-form auxiliary JSON (e.g. the pre-edit snapshot)
    pub aux: Option<serde_json::Value>,
    pub indexed: bool,
}

/// Fields for inserting a new message; IDs and linkage are filled in by the
/// chain
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub model: Option<String>,
    pub token_delta: i64,
    pub aux: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn new(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            attachments: Vec::new(),
            model: None,
            token_delta: 0,
            aux: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_token_delta(mut self, delta: i64) -> Self {
        self.token_delta = delta;
        self
    }

    pub fn with_aux(mut self, aux: serde_json::Value) -> Self {
        self.aux = Some(aux);
        self
    }
}

/// Serialize an attachment list for the `attachments` column (NULL when empty)
pub fn attachments_to_json(attachments: &[Attachment]) -> Option<String> {
    if attachments.is_empty() {
        None
    } else {
        serde_json::to_string(attachments).ok()
    }
}

/// Parse the `attachments` column
pub fn attachments_from_json(raw: Option<&str>) -> Vec<Attachment> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            MessageKind::UserText,
            MessageKind::ModelText,
            MessageKind::Thought,
            MessageKind::FunctionCall,
            MessageKind::FunctionResponse,
            MessageKind::SystemPrompt,
            MessageKind::EnvChange,
            MessageKind::Compression,
            MessageKind::Command,
            MessageKind::ModelError,
            MessageKind::Error,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("bogus"), None);
    }

    #[test]
    fn test_indexing_rules() {
        assert!(MessageKind::UserText.default_indexed());
        assert!(MessageKind::ModelText.default_indexed());
        assert!(!MessageKind::Thought.default_indexed());
        assert!(!MessageKind::FunctionCall.default_indexed());
        assert!(!MessageKind::FunctionResponse.default_indexed());
        assert!(!MessageKind::EnvChange.default_indexed());
        assert!(!MessageKind::Command.default_indexed());
        assert!(!MessageKind::Error.default_indexed());
    }

    #[test]
    fn test_edit_rules() {
        assert!(MessageKind::UserText.editable());
        assert!(MessageKind::ModelText.editable());
        assert!(!MessageKind::FunctionCall.editable());
        assert!(!MessageKind::Compression.editable());
    }

    #[test]
    fn test_attachment_json_round_trip() {
        let list = vec![Attachment {
            hash: "ab".repeat(32),
            file_name: "img.png".to_string(),
            mime_type: "image/png".to_string(),
            omitted: false,
        }];
        let json = attachments_to_json(&list).unwrap();
        assert_eq!(attachments_from_json(Some(&json)), list);
        assert!(attachments_to_json(&[]).is_none());
        assert!(attachments_from_json(None).is_empty());
    }
}
