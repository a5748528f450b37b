//! 文本补全服务抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：
//! complete(directive, context, examples) -> 文本 + token 用量。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 文本补全错误；除结构校验外一律视为可重试（transient）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("api error: {0}")]
    ApiError(String),
}

/// 一次补全请求：指令（system）、上下文（user）、可选的历史成功案例（few-shot）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// 调用用途（strategic_planner / routing / synthesis / directive / answer），用于审计与 Mock 路由
    pub purpose: String,
    pub directive: String,
    pub context: String,
    #[serde(default)]
    pub examples: Vec<String>,
}

impl CompletionRequest {
    pub fn new(
        purpose: impl Into<String>,
        directive: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            purpose: purpose.into(),
            directive: directive.into(),
            context: context.into(),
            examples: Vec::new(),
        }
    }

    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }
}

/// 补全结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// LLM 客户端 trait（非流式）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "llm"
    }
}

/// 粗略 token 估算（约 4 字符 / token），用于不返回 usage 的后端
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
