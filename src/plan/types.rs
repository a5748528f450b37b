//! 计划类型定义
//!
//! Plan 为有序的 Phase 序列，生成后不可变；Phase 的种类是严格的标签联合（tool_call / loop / conditional）。

use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::plan::placeholder::{placeholders_in, PlaceholderRef};

/// 阶段参数（key -> JSON 值，可包含 {{占位符}}）
pub type Arguments = Map<String, Value>;

/// 条件谓词（针对被引用阶段的结果求值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionPredicate {
    /// 被引用阶段成功完成
    Succeeded,
    /// 被引用阶段结果非空（非 null / 空数组 / 空对象 / 空串）
    NonEmpty,
    /// 被引用阶段结果的文本形式包含指定文本
    Contains(String),
}

/// 条件阶段的前置条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Condition {
    pub phase: u32,
    pub predicate: ConditionPredicate,
}

/// 阶段种类
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseKind {
    ToolCall,
    /// 迭代 loop_over 阶段的结果集，每个元素执行一次阶段体
    Loop { loop_over: u32 },
    /// 条件满足时才执行
    Conditional { condition: Condition },
}

impl PhaseKind {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::ToolCall => "tool_call",
            PhaseKind::Loop { .. } => "loop",
            PhaseKind::Conditional { .. } => "conditional",
        }
    }
}

/// 计划中的一个阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// 从 1 开始，计划内唯一且严格递增
    pub phase_num: u32,
    pub goal: String,
    pub kind: PhaseKind,
    /// 有序的候选能力名，执行时取第一个可解析的
    #[serde(default)]
    pub candidate_tools: Vec<String>,
    #[serde(default)]
    pub executable_directive: Option<String>,
    #[serde(default)]
    pub arguments: Arguments,
}

impl Phase {
    pub fn tool_call(phase_num: u32, goal: impl Into<String>, tools: &[&str]) -> Self {
        Self {
            phase_num,
            goal: goal.into(),
            kind: PhaseKind::ToolCall,
            candidate_tools: tools.iter().map(|t| t.to_string()).collect(),
            executable_directive: None,
            arguments: Arguments::new(),
        }
    }

    pub fn with_kind(mut self, kind: PhaseKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_string(), value);
        self
    }

    pub fn with_directive(mut self, directive: &str) -> Self {
        self.executable_directive = Some(directive.to_string());
        self
    }

    pub fn loop_over(&self) -> Option<u32> {
        match &self.kind {
            PhaseKind::Loop { loop_over } => Some(*loop_over),
            _ => None,
        }
    }

    /// 只由提示指令驱动（无候选工具）
    pub fn is_prompt_phase(&self) -> bool {
        self.candidate_tools.is_empty() && self.executable_directive.is_some()
    }

    /// 本阶段依赖的更早阶段：loop_over、condition.phase 以及参数中的 {{phase:N}}
    pub fn dependencies(&self) -> BTreeSet<u32> {
        let mut deps = BTreeSet::new();
        match &self.kind {
            PhaseKind::ToolCall => {}
            PhaseKind::Loop { loop_over } => {
                deps.insert(*loop_over);
            }
            PhaseKind::Conditional { condition } => {
                deps.insert(condition.phase);
            }
        }
        for name in placeholders_in(&Value::Object(self.arguments.clone())) {
            if let PlaceholderRef::PhaseResult(n) = PlaceholderRef::parse(&name) {
                deps.insert(n);
            }
        }
        deps
    }
}

/// 计划结构签名：不含参数值，仅含阶段号、种类、候选工具、指令与参数键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseShape {
    pub phase_num: u32,
    pub kind: &'static str,
    pub candidate_tools: Vec<String>,
    pub executable_directive: Option<String>,
    pub argument_keys: Vec<String>,
    pub dependencies: Vec<u32>,
}

/// 有序阶段序列；由规划器或水合器生成，之后只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    phases: Vec<Phase>,
}

impl Plan {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phase(&self, phase_num: u32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.phase_num == phase_num)
    }

    pub fn shape(&self) -> Vec<PhaseShape> {
        self.phases
            .iter()
            .map(|p| PhaseShape {
                phase_num: p.phase_num,
                kind: p.kind.name(),
                candidate_tools: p.candidate_tools.clone(),
                executable_directive: p.executable_directive.clone(),
                argument_keys: p.arguments.keys().cloned().collect(),
                dependencies: p.dependencies().into_iter().collect(),
            })
            .collect()
    }

    /// 逐阶段变换参数，结构保持不变
    pub fn map_arguments(&self, mut f: impl FnMut(&Phase) -> Arguments) -> Plan {
        Plan {
            phases: self
                .phases
                .iter()
                .map(|p| Phase {
                    arguments: f(p),
                    ..p.clone()
                })
                .collect(),
        }
    }
}
