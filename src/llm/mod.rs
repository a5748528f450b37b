//! LLM 层：文本补全抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、嵌入、分词

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod tokenizer;
pub mod traits;

pub use embedding::{
    cosine_similarity, create_embedder_from_config, EmbeddingProvider, HashingEmbedder,
    OpenAiEmbedder,
};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{Completion, CompletionRequest, LlmClient, LlmError};

use std::sync::Arc;

use crate::config::LlmSection;

/// DeepSeek 的 OpenAI 兼容端点
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// 按 [llm] 段选择后端；provider = mock 或缺少对应 API Key 时使用本地 Mock（echo 计划）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    let openai_key = std::env::var("OPENAI_API_KEY").ok();
    let timeout = cfg.timeouts.request;

    match (provider.as_str(), deepseek_key, openai_key) {
        ("deepseek", Some(key), _) => {
            tracing::info!("Using DeepSeek LLM ({})", cfg.model);
            let base_url = cfg.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            Arc::new(OpenAiClient::new(Some(base_url), &cfg.model, Some(key.as_str()), timeout))
        }
        ("openai", _, Some(key)) => {
            tracing::info!("Using OpenAI LLM ({})", cfg.model);
            Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                Some(key.as_str()),
                timeout,
            ))
        }
        _ => {
            tracing::warn!("No API key for provider {}, using Mock LLM", provider);
            Arc::new(MockLlmClient::echo())
        }
    }
}
