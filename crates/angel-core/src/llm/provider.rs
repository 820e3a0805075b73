//! Unified streaming contract over heterogeneous LLM backends
//!
//! A provider hides whether the wire protocol is Gemini-style (native
//! parts, multimodal inline data) or OpenAI-style (flat text with tool
//! calls); both directions are translated by the concrete implementations.
//! Dropping a returned stream releases its transport resources.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::error::AngelResult;

/// Who produced a content entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One entry of the request history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::Text(text.into())])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::model(vec![Part::Text(text.into())])
    }
}

/// One part of a content entry or response chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    InlineData {
        mime_type: String,
        data: Vec<u8>,
    },
    FunctionCall {
        name: String,
        args: serde_json::Map<String, serde_json::Value>,
    },
    FunctionResponse {
        name: String,
        response: serde_json::Value,
    },
    Thought(String),
    ExecutableCode {
        language: String,
        code: String,
    },
    CodeExecutionResult {
        outcome: String,
        output: String,
    },
}

/// Tool declaration advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument object
    pub parameters: serde_json::Value,
}

/// Request parameters shared by all providers
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    pub contents: Vec<Content>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub include_thoughts: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// One streamed response chunk: zero or more parts
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub parts: Vec<Part>,
}

/// Stream of response chunks; terminates cleanly on the provider's
/// end-of-stream marker, on drop, or with an error item
pub type ChunkStream = Pin<Box<dyn Stream<Item = AngelResult<Chunk>> + Send>>;

/// The provider contract
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open a streaming completion
    async fn send_message_stream(
        &self,
        model: &str,
        params: &GenerateParams,
    ) -> AngelResult<ChunkStream>;

    /// Collect a stream into plain text (compression, title generation)
    async fn generate_one_shot(&self, model: &str, params: &GenerateParams) -> AngelResult<String> {
        let mut stream = self.send_message_stream(model, params).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            for part in chunk?.parts {
                if let Part::Text(text) = part {
                    out.push_str(&text);
                }
            }
        }
        Ok(out)
    }

    /// Token count of `contents` under `model`
    async fn count_tokens(&self, model: &str, contents: &[Content]) -> AngelResult<u64>;

    /// Context window of `model`, for budgeting
    async fn max_tokens(&self, model: &str) -> u64;
}

/// chars/4 heuristic shared by backends without a counting endpoint. The
/// same proxy feeds the compression split so behavior stays stable across
/// providers.
pub fn estimate_tokens(contents: &[Content]) -> u64 {
    let chars: usize = contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .map(part_char_len)
        .sum();
    (chars as u64).div_ceil(4)
}

fn part_char_len(part: &Part) -> usize {
    match part {
        Part::Text(t) | Part::Thought(t) => t.chars().count(),
        Part::InlineData { data, .. } => data.len(),
        Part::FunctionCall { name, args } => {
            name.len() + serde_json::Value::Object(args.clone()).to_string().len()
        }
        Part::FunctionResponse { name, response } => name.len() + response.to_string().len(),
        Part::ExecutableCode { code, .. } => code.len(),
        Part::CodeExecutionResult { output, .. } => output.len(),
    }
}

/// Per-model context windows for backends that publish them out of band
pub fn known_context_window(model: &str) -> Option<u64> {
    // Longest-prefix match over the published families.
    const TABLE: &[(&str, u64)] = &[
        ("gemini-2.5-pro", 1_048_576),
        ("gemini-2.5-flash", 1_048_576),
        ("gemini-2.0-flash", 1_048_576),
        ("gemini-1.5-pro", 2_097_152),
        ("gemini-1.5-flash", 1_048_576),
        ("gpt-4o-mini", 128_000),
        ("gpt-4o", 128_000),
        ("gpt-4.1", 1_047_576),
        ("gpt-4-turbo", 128_000),
        ("gpt-4", 8_192),
        ("gpt-3.5-turbo", 16_385),
        ("o3", 200_000),
        ("o4-mini", 200_000),
        ("llama3.1", 131_072),
        ("llama3", 8_192),
        ("qwen2.5", 32_768),
        ("mistral", 32_768),
    ];
    let mut best: Option<(&str, u64)> = None;
    for (prefix, window) in TABLE {
        if model.starts_with(prefix) && best.map_or(true, |(b, _)| prefix.len() > b.len()) {
            best = Some((prefix, *window));
        }
    }
    best.map(|(_, window)| window)
}

/// Fallback window when nothing is known about a model
pub const DEFAULT_CONTEXT_WINDOW: u64 = 32_768;

/// Accumulates streamed tool-call argument fragments keyed by index, for
/// OpenAI-style backends that split a call across deltas
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: HashMap<u64, (String, String)>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: u64, name: Option<&str>, args_fragment: Option<&str>) {
        let entry = self.calls.entry(index).or_default();
        if let Some(name) = name {
            entry.0.push_str(name);
        }
        if let Some(fragment) = args_fragment {
            entry.1.push_str(fragment);
        }
    }

    /// Drain completed calls in index order
    pub fn finish(self) -> Vec<Part> {
        let mut calls: Vec<_> = self.calls.into_iter().collect();
        calls.sort_by_key(|(idx, _)| *idx);
        calls
            .into_iter()
            .map(|(_, (name, raw_args))| {
                let args = serde_json::from_str::<serde_json::Value>(&raw_args)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                Part::FunctionCall { name, args }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_quarter_chars() {
        let contents = vec![Content::user_text("abcdefgh")]; // 8 chars
        assert_eq!(estimate_tokens(&contents), 2);
        let contents = vec![Content::user_text("abc")]; // rounds up
        assert_eq!(estimate_tokens(&contents), 1);
    }

    #[test]
    fn test_known_context_prefers_longest_prefix() {
        assert_eq!(known_context_window("gpt-4o-mini-2024"), Some(128_000));
        assert_eq!(known_context_window("gpt-4-0613"), Some(8_192));
        assert_eq!(known_context_window("gemini-1.5-pro-latest"), Some(2_097_152));
        assert_eq!(known_context_window("unheard-of"), None);
    }

    #[test]
    fn test_tool_call_accumulator_reassembles_fragments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("read_file"), None);
        acc.push(0, None, Some(r#"{"file_pa"#));
        acc.push(0, None, Some(r#"th":"a.txt"}"#));
        acc.push(1, Some("list_directory"), Some("{}"));

        let parts = acc.finish();
        assert_eq!(parts.len(), 2);
        match &parts[0] {
            Part::FunctionCall { name, args } => {
                assert_eq!(name, "read_file");
                assert_eq!(args["file_path"], "a.txt");
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_one_shot_default_collects_text() {
        struct OneChunk;
        #[async_trait]
        impl Provider for OneChunk {
            async fn send_message_stream(
                &self,
                _model: &str,
                _params: &GenerateParams,
            ) -> AngelResult<ChunkStream> {
                let chunks = vec![
                    Ok(Chunk {
                        parts: vec![Part::Text("hello ".into()), Part::Thought("skip".into())],
                    }),
                    Ok(Chunk {
                        parts: vec![Part::Text("world".into())],
                    }),
                ];
                Ok(Box::pin(tokio_stream::iter(chunks)))
            }
            async fn count_tokens(&self, _m: &str, c: &[Content]) -> AngelResult<u64> {
                Ok(estimate_tokens(c))
            }
            async fn max_tokens(&self, _m: &str) -> u64 {
                DEFAULT_CONTEXT_WINDOW
            }
        }

        let text = OneChunk
            .generate_one_shot("m", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(text, "hello world");
    }
}
