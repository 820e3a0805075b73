//! Scripted in-process provider double
//!
//! Streams pre-programmed chunks turn by turn and records every request it
//! receives. Used by the engine's own tests instead of network mocks; also
//! handy for driving the server against deterministic output.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{AngelError, AngelResult};
use crate::llm::provider::{
    estimate_tokens, Chunk, ChunkStream, Content, GenerateParams, Part, Provider,
};

#[derive(Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<Chunk>>>,
    one_shots: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<GenerateParams>>,
    context_window: u64,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            context_window: 1_000_000,
            ..Default::default()
        }
    }

    /// Shrink the advertised context window (compression tests)
    pub fn with_context_window(mut self, window: u64) -> Self {
        self.context_window = window;
        self
    }

    /// Queue the chunks of the next streamed turn
    pub fn push_turn(&self, chunks: Vec<Chunk>) {
        self.turns.lock().push_back(chunks);
    }

    /// Queue a turn of single-part chunks
    pub fn push_parts(&self, parts: Vec<Part>) {
        self.push_turn(parts.into_iter().map(|p| Chunk { parts: vec![p] }).collect());
    }

    /// Queue the next `generate_one_shot` response
    pub fn push_one_shot(&self, text: impl Into<String>) {
        self.one_shots.lock().push_back(text.into());
    }

    /// Every request seen so far, in order
    pub fn requests(&self) -> Vec<GenerateParams> {
        self.requests.lock().clone()
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    async fn send_message_stream(
        &self,
        _model: &str,
        params: &GenerateParams,
    ) -> AngelResult<ChunkStream> {
        self.requests.lock().push(params.clone());
        let chunks = self
            .turns
            .lock()
            .pop_front()
            .ok_or_else(|| AngelError::provider("scripted provider ran out of turns"))?;
        Ok(Box::pin(tokio_stream::iter(
            chunks.into_iter().map(Ok).collect::<Vec<_>>(),
        )))
    }

    async fn generate_one_shot(&self, model: &str, params: &GenerateParams) -> AngelResult<String> {
        if let Some(text) = self.one_shots.lock().pop_front() {
            self.requests.lock().push(params.clone());
            return Ok(text);
        }
        let mut stream = self.send_message_stream(model, params).await?;
        use tokio_stream::StreamExt;
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

    async fn count_tokens(&self, _model: &str, contents: &[Content]) -> AngelResult<u64> {
        Ok(estimate_tokens(contents))
    }

    async fn max_tokens(&self, _model: &str) -> u64 {
        self.context_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_turns_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_parts(vec![Part::Text("one".into())]);
        provider.push_parts(vec![Part::Text("two".into())]);

        let first = provider
            .generate_one_shot("m", &GenerateParams::default())
            .await
            .unwrap();
        let second = provider
            .generate_one_shot("m", &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("one", "two"));
        assert!(provider
            .generate_one_shot("m", &GenerateParams::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_records_requests() {
        let provider = ScriptedProvider::new();
        provider.push_parts(vec![Part::Text("ok".into())]);
        let params = GenerateParams {
            contents: vec![Content::user_text("q")],
            ..Default::default()
        };
        provider.send_message_stream("m", &params).await.unwrap();
        assert_eq!(provider.requests().len(), 1);
    }
}
