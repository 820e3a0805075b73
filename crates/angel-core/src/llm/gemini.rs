//! Gemini-style provider: native parts, multimodal inline data

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use crate::error::{AngelError, AngelResult};
use crate::llm::provider::{
    known_context_window, Chunk, ChunkStream, Content, GenerateParams, Part, Provider, Role,
    ToolDeclaration, DEFAULT_CONTEXT_WINDOW,
};
use crate::llm::sse::SseDecoder;

pub struct GeminiProvider {
    http: Client,
    base_url: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn request_body(params: &GenerateParams) -> Value {
        let mut body = json!({
            "contents": params.contents.iter().map(content_to_json).collect::<Vec<_>>(),
        });
        if let Some(prompt) = &params.system_prompt {
            body["systemInstruction"] = json!({ "parts": [{ "text": prompt }] });
        }
        if !params.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": params.tools.iter().map(tool_to_json).collect::<Vec<_>>()
            }]);
        }
        let mut generation = serde_json::Map::new();
        if let Some(t) = params.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.top_p {
            generation.insert("topP".into(), json!(p));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        if params.include_thoughts {
            body["thinkingConfig"] = json!({ "includeThoughts": true });
        }
        body
    }
}

#[async_trait::async_trait]
impl Provider for GeminiProvider {
    #[instrument(skip(self, params), level = "debug")]
    async fn send_message_stream(
        &self,
        model: &str,
        params: &GenerateParams,
    ) -> AngelResult<ChunkStream> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&Self::request_body(params))
            .send()
            .await
            .map_err(|e| AngelError::provider(format!("gemini request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AngelError::provider(format!(
                "gemini returned {status}: {detail}"
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<AngelResult<Chunk>>(32);
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            use tokio_stream::StreamExt;
            while let Some(piece) = body.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(err) => {
                        let _ = tx
                            .send(Err(AngelError::provider(format!(
                                "gemini stream broke: {err}"
                            ))))
                            .await;
                        return;
                    }
                };
                for event in decoder.feed(&piece) {
                    match parse_stream_event(&event.data) {
                        Ok(Some(chunk)) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return; // listener dropped the stream
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
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn count_tokens(&self, model: &str, contents: &[Content]) -> AngelResult<u64> {
        let url = format!(
            "{}/v1beta/models/{}:countTokens?key={}",
            self.base_url, model, self.api_key
        );
        let body = json!({
            "contents": contents.iter().map(content_to_json).collect::<Vec<_>>(),
        });
        let response: Value = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AngelError::provider(format!("countTokens failed: {e}")))?
            .json()
            .await?;
        response["totalTokens"]
            .as_u64()
            .ok_or_else(|| AngelError::provider("countTokens response missing totalTokens"))
    }

    async fn max_tokens(&self, model: &str) -> u64 {
        known_context_window(model).unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}

fn content_to_json(content: &Content) -> Value {
    let role = match content.role {
        Role::User => "user",
        Role::Model => "model",
    };
    json!({
        "role": role,
        "parts": content.parts.iter().map(part_to_json).collect::<Vec<_>>(),
    })
}

fn part_to_json(part: &Part) -> Value {
    match part {
        Part::Text(text) => json!({ "text": text }),
        Part::Thought(text) => json!({ "text": text, "thought": true }),
        Part::InlineData { mime_type, data } => json!({
            "inlineData": { "mimeType": mime_type, "data": BASE64.encode(data) }
        }),
        Part::FunctionCall { name, args } => json!({
            "functionCall": { "name": name, "args": Value::Object(args.clone()) }
        }),
        Part::FunctionResponse { name, response } => json!({
            "functionResponse": { "name": name, "response": response }
        }),
        Part::ExecutableCode { language, code } => json!({
            "executableCode": { "language": language, "code": code }
        }),
        Part::CodeExecutionResult { outcome, output } => json!({
            "codeExecutionResult": { "outcome": outcome, "output": output }
        }),
    }
}

fn tool_to_json(tool: &ToolDeclaration) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

/// One SSE `data:` payload → chunk. Prompt-feedback frames carry no
/// candidates and are skipped.
fn parse_stream_event(data: &str) -> AngelResult<Option<Chunk>> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| AngelError::provider(format!("bad gemini frame: {e}")))?;
    if let Some(error) = value.get("error") {
        return Err(AngelError::provider(format!("gemini error frame: {error}")));
    }
    let Some(parts) = value["candidates"][0]["content"]["parts"].as_array() else {
        return Ok(None);
    };
    let mut chunk = Chunk::default();
    for raw in parts {
        if let Some(part) = part_from_json(raw)? {
            chunk.parts.push(part);
        }
    }
    Ok(Some(chunk))
}

fn part_from_json(raw: &Value) -> AngelResult<Option<Part>> {
    if let Some(text) = raw["text"].as_str() {
        if raw["thought"].as_bool().unwrap_or(false) {
            return Ok(Some(Part::Thought(text.to_string())));
        }
        return Ok(Some(Part::Text(text.to_string())));
    }
    if let Some(call) = raw.get("functionCall") {
        let name = call["name"].as_str().unwrap_or_default().to_string();
        let args = call["args"].as_object().cloned().unwrap_or_default();
        return Ok(Some(Part::FunctionCall { name, args }));
    }
    if let Some(inline) = raw.get("inlineData") {
        let mime_type = inline["mimeType"].as_str().unwrap_or_default().to_string();
        let data = BASE64
            .decode(inline["data"].as_str().unwrap_or_default())
            .map_err(|e| AngelError::provider(format!("bad inline data: {e}")))?;
        return Ok(Some(Part::InlineData { mime_type, data }));
    }
    if let Some(code) = raw.get("executableCode") {
        return Ok(Some(Part::ExecutableCode {
            language: code["language"].as_str().unwrap_or_default().to_string(),
            code: code["code"].as_str().unwrap_or_default().to_string(),
        }));
    }
    if let Some(result) = raw.get("codeExecutionResult") {
        return Ok(Some(Part::CodeExecutionResult {
            outcome: result["outcome"].as_str().unwrap_or_default().to_string(),
            output: result["output"].as_str().unwrap_or_default().to_string(),
        }));
    }
    Ok(None)
}
