//! 战略规划器：调用文本补全服务生成计划
//!
//! 指令中包含计划 JSON Schema、可用能力描述与最多 N 个冠军案例（few-shot）；
//! 回复按不可信输入严格解析并校验。校验失败时附上错误重新提示一次，仍失败则以 fatal_config 拒绝。
//! 文本补全的暂时性错误（超时、限流）按 max_retries 重试，与校验重提示分开计数。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::execution::completion::{complete_traced, CompletionRetry};
use crate::execution::trace::TraceRecorder;
use crate::llm::{CompletionRequest, LlmClient};
use crate::plan::{parse_plan, validate_plan, Plan, PlanError};
use crate::planning::champion::ChampionCase;
use crate::tools::{plan_schema_json, CapabilityRegistry};

pub const PLANNER_PURPOSE: &str = "strategic_planner";

const PLANNER_DIRECTIVE: &str = r#"You are the strategic planner. Break the user's request into an ordered plan of phases.
Reply with a single JSON object {"phases": [...]} and nothing else.

Rules:
- phase_num starts at 1 and increases by 1.
- "type" is one of "tool_call", "loop", "conditional".
- candidate_tools lists capability names in order of preference; use only the capabilities listed below.
- A phase may instead name an executable_directive from the list below.
- loop_over is the phase_num of an earlier phase whose result set is iterated; use {{item}} or {{item.field}} for the element.
- Use {{phase:N}} to pass the result of an earlier phase, and {{param}} for request parameters.
- A conditional phase has "condition": {"phase": N, "predicate": "succeeded" | "non_empty" | {"contains": "text"}}."#;

/// 一次规划的输入
pub struct PlanningRequest<'a> {
    pub request: &'a str,
    pub profile_id: &'a str,
    pub allowed_tools: &'a [String],
    pub examples: &'a [ChampionCase],
    pub execution_depth: u32,
}

pub struct StrategicPlanner {
    llm: Arc<dyn LlmClient>,
    registry: Arc<CapabilityRegistry>,
    max_examples: usize,
    retry: CompletionRetry,
}

impl StrategicPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            llm,
            registry,
            max_examples: 3,
            retry: CompletionRetry::default(),
        }
    }

    pub fn with_max_examples(mut self, n: usize) -> Self {
        self.max_examples = n;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.retry = CompletionRetry { max_retries, backoff };
        self
    }

    fn directive(&self, allowed_tools: &[String]) -> String {
        let directives: Vec<String> = self
            .registry
            .directive_names()
            .into_iter()
            .map(|name| {
                let text = self.registry.directive(&name).unwrap_or_default();
                format!("- {name}: {text}")
            })
            .collect();
        format!(
            "{PLANNER_DIRECTIVE}\n\nPlan JSON schema:\n{}\n\nAvailable capabilities:\n{}\n\nExecutable directives:\n{}",
            plan_schema_json(),
            self.registry.to_schema_json(allowed_tools),
            if directives.is_empty() {
                "(none)".to_string()
            } else {
                directives.join("\n")
            }
        )
    }

    fn examples(&self, cases: &[ChampionCase]) -> Vec<String> {
        cases
            .iter()
            .take(self.max_examples)
            .map(|case| {
                format!(
                    "Request: {}\nPlan: {}",
                    case.request_text,
                    serde_json::to_string(&case.plan_skeleton).unwrap_or_default()
                )
            })
            .collect()
    }

    /// 生成并校验计划；每次补全调用都记入轨迹（purpose = strategic_planner）
    pub async fn plan(
        &self,
        input: &PlanningRequest<'_>,
        trace: &TraceRecorder,
        cancel: &CancellationToken,
    ) -> Result<Plan, AgentError> {
        let directive = self.directive(input.allowed_tools);
        let examples = self.examples(input.examples);
        let base_context = format!("Profile: {}\nRequest: {}", input.profile_id, input.request);

        let mut rejection: Option<PlanError> = None;
        for round in 0..2 {
            let context = match &rejection {
                Some(err) => format!(
                    "{base_context}\n\nYour previous plan was rejected: {err}\nReturn a corrected plan."
                ),
                None => base_context.clone(),
            };
            let request = CompletionRequest::new(PLANNER_PURPOSE, directive.clone(), context)
                .with_examples(examples.clone());
            let text = complete_traced(
                self.llm.as_ref(),
                &request,
                trace,
                input.execution_depth,
                cancel,
                self.retry,
            )
            .await?
            .text;

            match parse_plan(&text).and_then(|plan| {
                validate_plan(&plan, &self.registry, input.allowed_tools).map(|_| plan)
            }) {
                Ok(plan) => {
                    tracing::info!(phases = plan.len(), round, "plan accepted");
                    return Ok(plan);
                }
                Err(err) => {
                    tracing::warn!(error = %err, round, "plan rejected");
                    rejection = Some(err);
                }
            }
        }
        Err(AgentError::PlanRejected(
            rejection.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}
