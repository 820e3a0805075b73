//! OpenAI-compatible provider: flat text with tool calls
//!
//! Covers hosted OpenAI-style APIs and local Ollama-style servers. The
//! context window comes from the known-model table, then an `api/show`
//! probe cached per model, then a conservative default.

use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use crate::error::{AngelError, AngelResult};
use crate::llm::provider::{
    estimate_tokens, known_context_window, Chunk, ChunkStream, Content, GenerateParams, Part,
    Provider, Role, ToolCallAccumulator, ToolDeclaration, DEFAULT_CONTEXT_WINDOW,
};
use crate::llm::sse::SseDecoder;

pub struct OpenAiProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    window_cache: Mutex<HashMap<String, u64>>,
}

impl OpenAiProvider {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            window_cache: Mutex::new(HashMap::new()),
        }
    }

    fn request_body(model: &str, params: &GenerateParams, stream: bool) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages_to_json(params),
            "stream": stream,
        });
        if !params.tools.is_empty() {
            body["tools"] = Value::Array(params.tools.iter().map(tool_to_json).collect());
        }
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.top_p {
            body["top_p"] = json!(p);
        }
        body
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Ollama-style context probe, one network round-trip per model
    async fn probe_context_window(&self, model: &str) -> Option<u64> {
        let url = format!("{}/api/show", self.base_url);
        let response: Value = self
            .http
            .post(&url)
            .json(&json!({ "name": model }))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;
        let info = response.get("model_info")?.as_object()?;
        info.iter()
            .find(|(key, _)| key.ends_with(".context_length"))
            .and_then(|(_, value)| value.as_u64())
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    #[instrument(skip(self, params), level = "debug")]
    async fn send_message_stream(
        &self,
        model: &str,
        params: &GenerateParams,
    ) -> AngelResult<ChunkStream> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .authorized(self.http.post(&url))
            .json(&Self::request_body(model, params, true))
            .send()
            .await
            .map_err(|e| AngelError::provider(format!("chat request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AngelError::provider(format!(
                "backend returned {status}: {detail}"
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<AngelResult<Chunk>>(32);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut calls = ToolCallAccumulator::new();
            let mut body = response.bytes_stream();
            use tokio_stream::StreamExt;
            'outer: while let Some(piece) = body.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(err) => {
                        let _ = tx
                            .send(Err(AngelError::provider(format!("stream broke: {err}"))))
                            .await;
                        return;
                    }
                };
                for event in decoder.feed(&piece) {
                    if event.is_done() {
                        break 'outer;
                    }
                    match parse_delta(&event.data, &mut calls) {
                        Ok(Some(chunk)) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    }
                }
            }
            // Tool calls arrive fragmented across deltas; flush once the
            // stream ends.
            if !calls.is_empty() {
                let _ = tx.send(Ok(Chunk { parts: calls.finish() })).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn count_tokens(&self, _model: &str, contents: &[Content]) -> AngelResult<u64> {
        // No counting endpoint in this protocol family.
        Ok(estimate_tokens(contents))
    }

    async fn max_tokens(&self, model: &str) -> u64 {
        if let Some(window) = known_context_window(model) {
            return window;
        }
        if let Some(window) = self.window_cache.lock().get(model).copied() {
            return window;
        }
        let window = self
            .probe_context_window(model)
            .await
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        self.window_cache.lock().insert(model.to_string(), window);
        window
    }
}

/// Convert the part-shaped history to the flat message list
fn messages_to_json(params: &GenerateParams) -> Vec<Value> {
    let mut messages = Vec::new();
    if let Some(prompt) = &params.system_prompt {
        messages.push(json!({ "role": "system", "content": prompt }));
    }

    // Call identifiers are synthesized in order; responses consume them in
    // the same order, which matches how the loop persists pairs.
    let mut next_call = 0usize;
    let mut open_calls: std::collections::VecDeque<String> = Default::default();

    for content in &params.contents {
        match content.role {
            Role::Model => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for part in &content.parts {
                    match part {
                        Part::Text(t) => text.push_str(t),
                        Part::FunctionCall { name, args } => {
                            let id = format!("call_{next_call}");
                            next_call += 1;
                            open_calls.push_back(id.clone());
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": Value::Object(args.clone()).to_string(),
                                }
                            }));
                        }
                        // Thoughts never leave the process.
                        _ => {}
                    }
                }
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text)
                };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = Value::Array(tool_calls);
                }
                messages.push(msg);
            }
            Role::User => {
                for part in &content.parts {
                    match part {
                        Part::FunctionResponse { response, .. } => {
                            let id = open_calls.pop_front().unwrap_or_else(|| {
                                let id = format!("call_{next_call}");
                                next_call += 1;
                                id
                            });
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": id,
                                "content": response.to_string(),
                            }));
                        }
                        Part::Text(t) => {
                            messages.push(json!({ "role": "user", "content": t }));
                        }
                        Part::InlineData { mime_type, data } => {
                            use base64::Engine as _;
                            let encoded =
                                base64::engine::general_purpose::STANDARD.encode(data);
                            messages.push(json!({
                                "role": "user",
                                "content": [{
                                    "type": "image_url",
                                    "image_url": { "url": format!("data:{mime_type};base64,{encoded}") }
                                }]
                            }));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    messages
}

fn tool_to_json(tool: &ToolDeclaration) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// One streamed delta frame → text chunk; tool-call fragments accumulate
fn parse_delta(data: &str, calls: &mut ToolCallAccumulator) -> AngelResult<Option<Chunk>> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| AngelError::provider(format!("bad delta frame: {e}")))?;
    if let Some(error) = value.get("error") {
        return Err(AngelError::provider(format!("backend error frame: {error}")));
    }
    let delta = &value["choices"][0]["delta"];
    if let Some(fragments) = delta["tool_calls"].as_array() {
        for fragment in fragments {
            calls.push(
                fragment["index"].as_u64().unwrap_or(0),
                fragment["function"]["name"].as_str(),
                fragment["function"]["arguments"].as_str(),
            );
        }
    }
    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            return Ok(Some(Chunk {
                parts: vec![Part::Text(text.to_string())],
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_flatten_tool_round_trip() {
        let params = GenerateParams {
            contents: vec![
                Content::user_text("read it"),
                Content::model(vec![Part::FunctionCall {
                    name: "read_file".into(),
                    args: serde_json::from_str(r#"{"file_path":"a.txt"}"#).unwrap(),
                }]),
                Content::user(vec![Part::FunctionResponse {
                    name: "read_file".into(),
                    response: json!({"content": "data"}),
                }]),
            ],
            system_prompt: Some("sp".into()),
            ..Default::default()
        };
        let messages = messages_to_json(&params);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_0");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_0");
    }

    #[test]
    fn test_parse_delta_text() {
        let mut calls = ToolCallAccumulator::new();
        let chunk = parse_delta(
            r#"{"choices":[{"delta":{"content":"hey"}}]}"#,
            &mut calls,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.parts, vec![Part::Text("hey".into())]);
    }

    #[test]
    fn test_parse_delta_accumulates_tool_fragments() {
        let mut calls = ToolCallAccumulator::new();
        parse_delta(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"ls","arguments":"{\"pa"}}]}}]}"#,
            &mut calls,
        )
        .unwrap();
        parse_delta(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\".\"}"}}]}}]}"#,
            &mut calls,
        )
        .unwrap();
        let parts = calls.finish();
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            Part::FunctionCall { name, args } => {
                assert_eq!(name, "ls");
                assert_eq!(args["path"], ".");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_request_body_includes_tools() {
        let params = GenerateParams {
            contents: vec![Content::user_text("x")],
            tools: vec![ToolDeclaration {
                name: "shell".into(),
                description: "run".into(),
                parameters: json!({"type":"object"}),
            }],
            ..Default::default()
        };
        let body = OpenAiProvider::request_body("gpt-4o", &params, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
    }
}
