//! LLM provider abstraction and concrete backends

pub mod gemini;
pub mod openai;
pub mod provider;
pub mod scripted;
pub mod sse;

use std::sync::Arc;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{AngelError, AngelResult};

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use provider::{
    estimate_tokens, known_context_window, Chunk, ChunkStream, Content, GenerateParams, Part,
    Provider, Role, ToolDeclaration, DEFAULT_CONTEXT_WINDOW,
};
pub use scripted::ScriptedProvider;

/// Build a provider from configuration
pub fn build_provider(config: &ProviderConfig) -> AngelResult<Arc<dyn Provider>> {
    let http = reqwest::Client::new();
    match config.kind {
        ProviderKind::Gemini => {
            let api_key = config.resolve_api_key().ok_or_else(|| {
                AngelError::config(format!("provider {} has no API key", config.name))
            })?;
            Ok(Arc::new(GeminiProvider::new(
                http,
                config.base_url.clone(),
                api_key,
            )))
        }
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiProvider::new(
            http,
            config.base_url.clone(),
            config.resolve_api_key(),
        ))),
    }
}
