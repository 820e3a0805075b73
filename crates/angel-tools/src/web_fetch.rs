//! Web fetch tool

use async_trait::async_trait;
use serde_json::{json, Value};

use angel_core::{Tool, ToolContext, ToolFailure, ToolOutcome, ToolParameter, ToolSchema};

use crate::files::required_str;

/// Response bodies are truncated past this size
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct WebFetchTool {
    http: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "web_fetch",
            "Fetch a URL over HTTP(S) and return the response body as text.",
            vec![ToolParameter::string("url", "Address to fetch")],
        )
    }

    async fn run(
        &self,
        ctx: &ToolContext,
        args: &serde_json::Map<String, Value>,
    ) -> Result<ToolOutcome, ToolFailure> {
        let url = required_str(args, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolFailure::new(format!("unsupported URL scheme in {url:?}")));
        }

        let response = tokio::select! {
            response = self.http.get(url).send() => {
                response.map_err(|e| ToolFailure::new(format!("fetch failed: {e}")))?
            }
            _ = ctx.cancel.cancelled() => {
                return Err(ToolFailure::new("fetch cancelled"));
            }
        };
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ToolFailure::new(format!("body read failed: {e}")))?;
        let truncated = body.len() > MAX_BODY_BYTES;
        let body = if truncated {
            body.chars().take(MAX_BODY_BYTES).collect()
        } else {
            body
        };
        Ok(ToolOutcome::success(json!({
            "status": status,
            "content_type": content_type,
            "body": body,
            "truncated": truncated,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tool_context;

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let (_dir, ctx) = tool_context();
        let mut args = serde_json::Map::new();
        args.insert("url".into(), json!("file:///etc/passwd"));
        let err = WebFetchTool::new().run(&ctx, &args).await.unwrap_err();
        assert!(err.message.contains("scheme"));
    }
}
