//! 带轨迹记录的文本补全调用
//!
//! 规划、路由、综合与答案汇总共用：每次尝试都记入轨迹（purpose = llm），
//! 超时 / 限流等错误按 max_retries 重试，等待可被取消。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::execution::trace::{ActionMetadata, InvocationPurpose, TraceRecorder};
use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError};

#[derive(Debug, Clone, Copy)]
pub struct CompletionRetry {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for CompletionRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// 调用补全服务；总尝试次数不超过 1 + max_retries
pub async fn complete_traced(
    llm: &dyn LlmClient,
    request: &CompletionRequest,
    trace: &TraceRecorder,
    depth: u32,
    cancel: &CancellationToken,
    retry: CompletionRetry,
) -> Result<Completion, AgentError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let metadata = ActionMetadata::new(depth, InvocationPurpose::Llm).attempt(attempt);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = llm.complete(request) => r,
        };
        match result {
            Ok(completion) => {
                trace.record_llm(request, metadata, Ok(&completion));
                return Ok(completion);
            }
            Err(err) => {
                trace.record_llm(request, metadata, Err(&err.to_string()));
                if attempt > retry.max_retries {
                    return Err(AgentError::Llm(err));
                }
                let delay = match &err {
                    LlmError::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms),
                    _ => retry.backoff * attempt,
                };
                tracing::warn!(purpose = %request.purpose, error = %err, attempt, "completion failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
