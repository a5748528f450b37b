//! 规划器输出解析
//!
//! LLM 的回复视为不可信输入：先提取 JSON（```json 代码块或首尾花括号之间），
//! 再按严格的标签联合反序列化；未知 type、缺失字段、类型不符一律拒绝，不做强制转换。

use schemars::JsonSchema;
use serde::Deserialize;
use thiserror::Error;

use crate::plan::types::{Arguments, Condition, Phase, PhaseKind, Plan};

/// 计划解析 / 校验错误；错误文本会回传给规划器作为重新生成的上下文
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("response contains no JSON object")]
    NoJson,

    #[error("malformed plan: {0}")]
    Malformed(String),

    #[error("plan has no phases")]
    Empty,

    #[error("phase numbers must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },

    #[error("phase {phase}: unknown capability '{name}'")]
    UnknownCapability { phase: u32, name: String },

    #[error("phase {phase}: unknown executable directive '{name}'")]
    UnknownDirective { phase: u32, name: String },

    #[error("phase {phase}: neither candidate_tools nor executable_directive given")]
    NothingToExecute { phase: u32 },

    #[error("phase {phase}: may only reference earlier phases, got {target}")]
    ForwardReference { phase: u32, target: u32 },
}

/// 规划器必须输出的顶层结构 {"phases": [...]}
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RawPlan {
    pub phases: Vec<RawPhase>,
}

/// 单个阶段的原始形态（type 为标签）
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RawPhase {
    ToolCall {
        phase_num: u32,
        goal: String,
        #[serde(default)]
        candidate_tools: Vec<String>,
        #[serde(default)]
        executable_directive: Option<String>,
        #[serde(default)]
        arguments: Arguments,
    },
    Loop {
        phase_num: u32,
        goal: String,
        /// 被迭代结果集所在的更早阶段号
        loop_over: u32,
        #[serde(default)]
        candidate_tools: Vec<String>,
        #[serde(default)]
        executable_directive: Option<String>,
        #[serde(default)]
        arguments: Arguments,
    },
    Conditional {
        phase_num: u32,
        goal: String,
        condition: Condition,
        #[serde(default)]
        candidate_tools: Vec<String>,
        #[serde(default)]
        executable_directive: Option<String>,
        #[serde(default)]
        arguments: Arguments,
    },
}

impl From<RawPhase> for Phase {
    fn from(raw: RawPhase) -> Self {
        let (phase_num, goal, kind, candidate_tools, executable_directive, arguments) = match raw {
            RawPhase::ToolCall {
                phase_num,
                goal,
                candidate_tools,
                executable_directive,
                arguments,
            } => (
                phase_num,
                goal,
                PhaseKind::ToolCall,
                candidate_tools,
                executable_directive,
                arguments,
            ),
            RawPhase::Loop {
                phase_num,
                goal,
                loop_over,
                candidate_tools,
                executable_directive,
                arguments,
            } => (
                phase_num,
                goal,
                PhaseKind::Loop { loop_over },
                candidate_tools,
                executable_directive,
                arguments,
            ),
            RawPhase::Conditional {
                phase_num,
                goal,
                condition,
                candidate_tools,
                executable_directive,
                arguments,
            } => (
                phase_num,
                goal,
                PhaseKind::Conditional { condition },
                candidate_tools,
                executable_directive,
                arguments,
            ),
        };
        Phase {
            phase_num,
            goal,
            kind,
            candidate_tools,
            executable_directive,
            arguments,
        }
    }
}

/// 提取 JSON 文本（```json ... ``` 或首个 '{' 到最后一个 '}'）
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 将 LLM 回复解析为 Plan（只做结构解析，引用校验见 validate_plan）
pub fn parse_plan(output: &str) -> Result<Plan, PlanError> {
    let json = extract_json(output).ok_or(PlanError::NoJson)?;
    let raw: RawPlan =
        serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))?;
    if raw.phases.is_empty() {
        return Err(PlanError::Empty);
    }
    Ok(Plan::new(raw.phases.into_iter().map(Phase::from).collect()))
}
