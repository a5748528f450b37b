//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按 purpose（以及可选的 context 关键字）匹配预置回复；每条规则的回复队列依次弹出，
//! 只剩最后一条时重复返回。未命中规则时使用 default，或返回 ApiError。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::traits::estimate_tokens;
use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError};

struct MockRule {
    purpose: String,
    context_contains: Option<String>,
    responses: VecDeque<Result<String, LlmError>>,
}

impl MockRule {
    fn matches(&self, request: &CompletionRequest) -> bool {
        if self.purpose != request.purpose {
            return false;
        }
        match &self.context_contains {
            Some(needle) => request.context.contains(needle.as_str()),
            None => true,
        }
    }

    fn next(&mut self) -> Result<String, LlmError> {
        if self.responses.len() > 1 {
            if let Some(r) = self.responses.pop_front() {
                return r;
            }
        }
        self.responses
            .front()
            .cloned()
            .unwrap_or_else(|| Err(LlmError::ApiError("empty mock rule".to_string())))
    }
}

/// 可编排的 Mock 客户端，同时记录收到的所有请求
#[derive(Default)]
pub struct MockLlmClient {
    rules: Mutex<Vec<MockRule>>,
    default_response: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本地运行用：规划时返回单阶段 echo 计划，其余用途回显上下文
    pub fn echo() -> Self {
        Self::new().respond(
            "strategic_planner",
            r#"{"phases": [{"type": "tool_call", "phase_num": 1, "goal": "echo the request", "candidate_tools": ["echo"], "arguments": {"text": "{{request}}"}}]}"#,
        )
        .with_default("OK")
    }

    /// 为某一用途追加一条回复
    pub fn respond(self, purpose: &str, text: &str) -> Self {
        self.push_rule(purpose, None, Ok(text.to_string()))
    }

    /// 仅当 context 包含 needle 时命中（优先于无条件规则）
    pub fn respond_when(self, purpose: &str, needle: &str, text: &str) -> Self {
        self.push_rule(purpose, Some(needle), Ok(text.to_string()))
    }

    /// 为某一用途追加一次失败
    pub fn fail(self, purpose: &str, err: LlmError) -> Self {
        self.push_rule(purpose, None, Err(err))
    }

    pub fn fail_when(self, purpose: &str, needle: &str, err: LlmError) -> Self {
        self.push_rule(purpose, Some(needle), Err(err))
    }

    pub fn with_default(mut self, text: &str) -> Self {
        self.default_response = Some(text.to_string());
        self
    }

    fn push_rule(
        self,
        purpose: &str,
        needle: Option<&str>,
        response: Result<String, LlmError>,
    ) -> Self {
        {
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            let existing = rules.iter_mut().find(|r| {
                r.purpose == purpose && r.context_contains.as_deref() == needle
            });
            match existing {
                Some(rule) => rule.responses.push_back(response),
                None => rules.push(MockRule {
                    purpose: purpose.to_string(),
                    context_contains: needle.map(String::from),
                    responses: VecDeque::from(vec![response]),
                }),
            }
        }
        self
    }

    /// 某一用途被调用的次数
    pub fn calls(&self, purpose: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let scripted = {
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            let idx = rules
                .iter()
                .position(|r| r.context_contains.is_some() && r.matches(request))
                .or_else(|| rules.iter().position(|r| r.matches(request)));
            idx.map(|i| rules[i].next())
        };

        let text = match scripted {
            Some(result) => result?,
            None => match &self.default_response {
                Some(text) => text.clone(),
                None => {
                    return Err(LlmError::ApiError(format!(
                        "no scripted response for '{}'",
                        request.purpose
                    )))
                }
            },
        };

        Ok(Completion {
            input_tokens: estimate_tokens(&request.directive) + estimate_tokens(&request.context),
            output_tokens: estimate_tokens(&text),
            text,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_pop_then_repeat_last() {
        let llm = MockLlmClient::new()
            .respond("routing", "first")
            .respond("routing", "second");
        let req = CompletionRequest::new("routing", "d", "c");
        assert_eq!(llm.complete(&req).await.unwrap().text, "first");
        assert_eq!(llm.complete(&req).await.unwrap().text, "second");
        assert_eq!(llm.complete(&req).await.unwrap().text, "second");
        assert_eq!(llm.calls("routing"), 3);
    }

    #[tokio::test]
    async fn test_context_specific_rule_wins() {
        let llm = MockLlmClient::new()
            .respond("strategic_planner", "generic")
            .respond_when("strategic_planner", "expert_b", "specific");
        let generic = CompletionRequest::new("strategic_planner", "d", "profile expert_a");
        let specific = CompletionRequest::new("strategic_planner", "d", "profile expert_b");
        assert_eq!(llm.complete(&generic).await.unwrap().text, "generic");
        assert_eq!(llm.complete(&specific).await.unwrap().text, "specific");
    }

    #[tokio::test]
    async fn test_unscripted_purpose_errors_without_default() {
        let llm = MockLlmClient::new();
        let req = CompletionRequest::new("synthesis", "d", "c");
        assert!(matches!(llm.complete(&req).await, Err(LlmError::ApiError(_))));
    }
}
