//! 执行轨迹记录
//!
//! 只追加，不修改已写入的条目；每次调用尝试（含重试）各占一条。
//! 取消或中途崩溃的运行仍留下可检查的前缀，view() 可从任意前缀重建嵌套视图。

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::execution::events::preview;
use crate::llm::{Completion, CompletionRequest};

/// 调用目标的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPurpose {
    Tool,
    /// 自我纠错时的合法名称查询
    Lookup,
    /// 文本补全服务调用（规划 / 提示阶段 / 路由 / 综合）
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub execution_depth: u32,
    pub timestamp: i64,
    pub phase_num: Option<u32>,
    pub attempt: u32,
    pub iteration: Option<usize>,
    pub purpose: InvocationPurpose,
}

impl ActionMetadata {
    pub fn new(execution_depth: u32, purpose: InvocationPurpose) -> Self {
        Self {
            execution_depth,
            timestamp: now_millis(),
            phase_num: None,
            attempt: 1,
            iteration: None,
            purpose,
        }
    }

    pub fn phase(mut self, phase_num: u32) -> Self {
        self.phase_num = Some(phase_num);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn iteration(mut self, iteration: Option<usize>) -> Self {
        self.iteration = iteration;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceAction {
    pub target_name: String,
    pub arguments: Value,
    pub metadata: ActionMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    pub status: ResultStatus,
    pub payload: Value,
    pub metadata: TokenMetadata,
}

/// 一次调用尝试：action + result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTraceEntry {
    pub action: TraceAction,
    pub result: TraceResult,
}

impl ExecutionTraceEntry {
    pub fn new(target_name: impl Into<String>, arguments: Value, metadata: ActionMetadata) -> Self {
        Self {
            action: TraceAction {
                target_name: target_name.into(),
                arguments,
                metadata,
            },
            result: TraceResult {
                status: ResultStatus::Ok,
                payload: Value::Null,
                metadata: TokenMetadata::default(),
            },
        }
    }

    pub fn ok(mut self, payload: Value, input_tokens: u64, output_tokens: u64) -> Self {
        self.result = TraceResult {
            status: ResultStatus::Ok,
            payload,
            metadata: TokenMetadata {
                input_tokens,
                output_tokens,
            },
        };
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.result.status = ResultStatus::Error;
        self.result.payload = Value::String(message.into());
        self
    }

    pub fn cancelled(mut self) -> Self {
        self.result.status = ResultStatus::Cancelled;
        self.result.payload = Value::String("cancelled".to_string());
        self
    }
}

/// 阶段结束时的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEndStatus {
    Completed,
    Skipped,
    Failed,
}

impl PhaseEndStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseEndStatus::Completed => "completed",
            PhaseEndStatus::Skipped => "skipped",
            PhaseEndStatus::Failed => "failed",
        }
    }
}

/// 轨迹条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TraceEntry {
    PhaseStart {
        phase_num: u32,
        total_phases: u32,
        goal: String,
        execution_depth: u32,
        timestamp: i64,
    },
    Invocation(ExecutionTraceEntry),
    PhaseEnd {
        phase_num: u32,
        total_phases: u32,
        status: PhaseEndStatus,
        reason: Option<String>,
        execution_depth: u32,
        timestamp: i64,
    },
    /// 运行被取消
    Cancelled {
        phase_num: Option<u32>,
        execution_depth: u32,
        timestamp: i64,
    },
}

impl TraceEntry {
    pub fn is_cancelled(&self) -> bool {
        match self {
            TraceEntry::Cancelled { .. } => true,
            TraceEntry::Invocation(e) => e.result.status == ResultStatus::Cancelled,
            _ => false,
        }
    }

    pub fn invocation(&self) -> Option<&ExecutionTraceEntry> {
        match self {
            TraceEntry::Invocation(e) => Some(e),
            _ => None,
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 轨迹记录器：一个运行一个，克隆后共享同一条轨迹（循环迭代并发追加）
#[derive(Debug, Clone, Default)]
pub struct TraceRecorder {
    entries: Arc<Mutex<Vec<TraceEntry>>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TraceEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 追加一条；返回追加后的长度（即下一个 cursor）
    pub fn append(&self, entry: TraceEntry) -> usize {
        let mut entries = self.lock();
        entries.push(entry);
        entries.len()
    }

    pub fn record(&self, entry: ExecutionTraceEntry) -> usize {
        self.append(TraceEntry::Invocation(entry))
    }

    /// 记录一次文本补全调用；target_name 为调用用途，便于按用途统计
    pub fn record_llm(
        &self,
        request: &CompletionRequest,
        metadata: ActionMetadata,
        result: Result<&Completion, &str>,
    ) -> usize {
        let arguments = json!({
            "directive": preview(&request.directive, 200),
            "context": preview(&request.context, 500),
            "examples": request.examples.len(),
        });
        let entry = ExecutionTraceEntry::new(request.purpose.clone(), arguments, metadata);
        let entry = match result {
            Ok(c) => entry.ok(Value::String(c.text.clone()), c.input_tokens, c.output_tokens),
            Err(message) => entry.error(message),
        };
        self.record(entry)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<TraceEntry> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<TraceEntry> {
        self.lock().last().cloned()
    }

    /// 累计 token（输入, 输出）
    pub fn token_totals(&self) -> (u64, u64) {
        self.lock()
            .iter()
            .filter_map(TraceEntry::invocation)
            .fold((0, 0), |(i, o), e| {
                (i + e.result.metadata.input_tokens, o + e.result.metadata.output_tokens)
            })
    }

    /// 某阶段的工具调用尝试次数（不含查询与 LLM 调用）
    pub fn attempts_for_phase(&self, phase_num: u32) -> usize {
        self.lock()
            .iter()
            .filter_map(TraceEntry::invocation)
            .filter(|e| {
                e.action.metadata.phase_num == Some(phase_num)
                    && e.action.metadata.purpose == InvocationPurpose::Tool
            })
            .count()
    }

    /// 某一用途（strategic_planner / routing / synthesis ...）的 LLM 调用次数
    pub fn llm_calls(&self, purpose: &str) -> usize {
        self.lock()
            .iter()
            .filter_map(TraceEntry::invocation)
            .filter(|e| {
                e.action.metadata.purpose == InvocationPurpose::Llm && e.action.target_name == purpose
            })
            .count()
    }

    /// 重建嵌套视图
    pub fn view(&self) -> Vec<TraceNode> {
        build_view(&self.snapshot())
    }
}

/// 嵌套视图节点：阶段与循环迭代为可折叠分组，内含有序的 action/result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TraceNode {
    Group {
        label: String,
        phase_num: Option<u32>,
        execution_depth: u32,
        /// None 表示分组未结束（部分轨迹）
        status: Option<PhaseEndStatus>,
        children: Vec<TraceNode>,
    },
    Step {
        entry: ExecutionTraceEntry,
    },
    Marker {
        label: String,
    },
}

struct GroupBuilder {
    label: String,
    phase_num: u32,
    depth: u32,
    children: Vec<GroupChild>,
}

enum GroupChild {
    Step(ExecutionTraceEntry),
    Iteration(usize, u32, Vec<ExecutionTraceEntry>),
}

impl GroupBuilder {
    fn push(&mut self, entry: ExecutionTraceEntry) {
        let Some(index) = entry.action.metadata.iteration else {
            self.children.push(GroupChild::Step(entry));
            return;
        };
        let existing = self.children.iter_mut().find_map(|c| match c {
            GroupChild::Iteration(i, _, steps) if *i == index => Some(steps),
            _ => None,
        });
        match existing {
            Some(steps) => steps.push(entry),
            None => {
                let depth = entry.action.metadata.execution_depth;
                self.children.push(GroupChild::Iteration(index, depth, vec![entry]))
            }
        }
    }

    fn finish(self, status: Option<PhaseEndStatus>) -> TraceNode {
        TraceNode::Group {
            label: self.label,
            phase_num: Some(self.phase_num),
            execution_depth: self.depth,
            status,
            children: self
                .children
                .into_iter()
                .map(|c| match c {
                    GroupChild::Step(entry) => TraceNode::Step { entry },
                    GroupChild::Iteration(i, depth, steps) => TraceNode::Group {
                        label: format!("iteration {i}"),
                        phase_num: Some(self.phase_num),
                        execution_depth: depth,
                        status: None,
                        children: steps.into_iter().map(|entry| TraceNode::Step { entry }).collect(),
                    },
                })
                .collect(),
        }
    }
}

fn build_view(entries: &[TraceEntry]) -> Vec<TraceNode> {
    let mut nodes = Vec::new();
    let mut open: Option<GroupBuilder> = None;
    for entry in entries {
        match entry {
            TraceEntry::PhaseStart {
                phase_num,
                goal,
                execution_depth,
                ..
            } => {
                if let Some(group) = open.take() {
                    nodes.push(group.finish(None));
                }
                open = Some(GroupBuilder {
                    label: format!("phase {phase_num}: {goal}"),
                    phase_num: *phase_num,
                    depth: *execution_depth,
                    children: Vec::new(),
                });
            }
            TraceEntry::Invocation(e) => match open.as_mut() {
                Some(group) if e.action.metadata.phase_num == Some(group.phase_num) => {
                    group.push(e.clone())
                }
                _ => nodes.push(TraceNode::Step { entry: e.clone() }),
            },
            TraceEntry::PhaseEnd {
                phase_num,
                status,
                execution_depth,
                ..
            } => match open.take() {
                Some(group) if group.phase_num == *phase_num => nodes.push(group.finish(Some(*status))),
                other => {
                    if let Some(group) = other {
                        nodes.push(group.finish(None));
                    }
                    // 未开始即跳过的阶段
                    nodes.push(TraceNode::Group {
                        label: format!("phase {phase_num}"),
                        phase_num: Some(*phase_num),
                        execution_depth: *execution_depth,
                        status: Some(*status),
                        children: Vec::new(),
                    });
                }
            },
            TraceEntry::Cancelled { .. } => {
                if let Some(group) = open.take() {
                    nodes.push(group.finish(None));
                }
                nodes.push(TraceNode::Marker {
                    label: "cancelled".to_string(),
                });
            }
        }
    }
    if let Some(group) = open.take() {
        nodes.push(group.finish(None));
    }
    nodes
}
