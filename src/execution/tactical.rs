//! 战术执行器：逐阶段执行计划
//!
//! 每个阶段的状态机：Pending → Running → {Completed | Failed}；Failed 经自我纠错可回到 Running，
//! 最多 max_retries 次，之后为 FailedFinal。前置条件不满足的阶段直接 Pending → Skipped。
//! loop 阶段按元素并发执行阶段体（上限 loop_fan_out），各迭代的轨迹条目共享 phase_num、execution_depth + 1。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ErrorClassification, ErrorKind, RecoveryAction, TaskKind, TaskScheduler};
use crate::execution::correction::SelfCorrectionEngine;
use crate::execution::events::{preview, EventSink, RunEvent};
use crate::execution::trace::{
    now_millis, ActionMetadata, ExecutionTraceEntry, InvocationPurpose, PhaseEndStatus, TraceEntry,
    TraceRecorder,
};
use crate::llm::{CompletionRequest, LlmClient};
use crate::plan::{placeholders_in, substitute, ConditionPredicate, Phase, PhaseKind, PlaceholderRef, Plan};
use crate::planning::hydrator::Parameters;
use crate::tools::{CapabilityRegistry, ToolExecutor};

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Running,
    Completed,
    Failed,
    FailedFinal,
    Skipped,
}

impl PhaseState {
    /// 合法的状态迁移
    pub fn can_transition(self, to: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Running)
                | (Failed, FailedFinal)
        )
    }
}

/// 单个阶段的状态跟踪（只用于日志与断言迁移合法）
struct PhaseTracker {
    phase_num: u32,
    iteration: Option<usize>,
    state: PhaseState,
}

impl PhaseTracker {
    fn new(phase_num: u32, iteration: Option<usize>) -> Self {
        Self {
            phase_num,
            iteration,
            state: PhaseState::Pending,
        }
    }

    fn advance(&mut self, to: PhaseState) {
        if !self.state.can_transition(to) {
            tracing::warn!(phase = self.phase_num, from = ?self.state, ?to, "unexpected phase transition");
        }
        tracing::debug!(phase = self.phase_num, iteration = ?self.iteration, from = ?self.state, ?to, "phase transition");
        self.state = to;
    }
}

/// 阶段被跳过的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    ConditionNotMet,
    DependencyUnmet { phase: u32 },
    Cancelled,
    RunAborted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::ConditionNotMet => write!(f, "condition not met"),
            SkipReason::DependencyUnmet { phase } => write!(f, "phase {phase} did not complete"),
            SkipReason::Cancelled => write!(f, "run cancelled"),
            SkipReason::RunAborted => write!(f, "run aborted"),
        }
    }
}

/// 阶段的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase_num: u32,
    pub state: PhaseState,
    pub result: Option<Value>,
    /// 工具 / 指令调用尝试次数（循环阶段为所有迭代之和）
    pub attempts: u32,
    pub classification: Option<ErrorClassification>,
    pub skip_reason: Option<SkipReason>,
    /// 跳过不影响整体成功（条件不满足，或依赖的阶段本身是良性跳过）
    pub benign_skip: bool,
    pub failed_iterations: usize,
}

impl PhaseOutcome {
    fn completed(phase_num: u32, result: Value, attempts: u32) -> Self {
        Self {
            phase_num,
            state: PhaseState::Completed,
            result: Some(result),
            attempts,
            classification: None,
            skip_reason: None,
            benign_skip: false,
            failed_iterations: 0,
        }
    }

    fn failed(phase_num: u32, classification: ErrorClassification, attempts: u32) -> Self {
        Self {
            phase_num,
            state: PhaseState::FailedFinal,
            result: None,
            attempts,
            classification: Some(classification),
            skip_reason: None,
            benign_skip: false,
            failed_iterations: 0,
        }
    }

    fn cancelled(phase_num: u32, attempts: u32) -> Self {
        Self::failed(phase_num, ErrorClassification::new(ErrorKind::Cancelled, attempts), attempts)
    }

    fn skipped(phase_num: u32, reason: SkipReason, benign: bool) -> Self {
        Self {
            phase_num,
            state: PhaseState::Skipped,
            result: None,
            attempts: 0,
            classification: None,
            skip_reason: Some(reason),
            benign_skip: benign,
            failed_iterations: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == PhaseState::Completed
    }

    pub fn is_benign(&self) -> bool {
        match self.state {
            PhaseState::Completed => self.failed_iterations == 0,
            PhaseState::Skipped => self.benign_skip,
            _ => false,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.classification.as_ref().map(|c| c.kind)
    }
}

/// 执行报告
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub phases: Vec<PhaseOutcome>,
    /// 某阶段最终失败且策略不允许继续
    pub aborted: bool,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn phase(&self, phase_num: u32) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|p| p.phase_num == phase_num)
    }

    /// 所有阶段完成或良性跳过
    pub fn all_succeeded(&self) -> bool {
        !self.aborted && !self.cancelled && self.phases.iter().all(PhaseOutcome::is_benign)
    }

    pub fn any_completed(&self) -> bool {
        self.phases.iter().any(PhaseOutcome::is_completed)
    }

    /// 最后一个完成阶段的结果
    pub fn final_result(&self) -> Option<&Value> {
        self.phases
            .iter()
            .rev()
            .find(|p| p.is_completed())
            .and_then(|p| p.result.as_ref())
    }
}

/// 执行参数（配置默认值，可被 profile 覆盖）
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_retries: u32,
    pub loop_fan_out: usize,
    pub continue_on_phase_failure: bool,
    /// None 使用 ToolExecutor 的默认超时
    pub tool_timeout: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            loop_fan_out: 4,
            continue_on_phase_failure: false,
            tool_timeout: None,
        }
    }
}

/// 一次运行的上下文：取消信号、事件出口、轨迹、请求参数与工具白名单
#[derive(Debug, Clone)]
pub struct RunScope {
    pub cancel: CancellationToken,
    pub events: EventSink,
    pub trace: TraceRecorder,
    pub params: Parameters,
    pub allowed_tools: Vec<String>,
}

impl RunScope {
    pub fn new(cancel: CancellationToken, events: EventSink, params: Parameters) -> Self {
        Self {
            cancel,
            events,
            trace: TraceRecorder::new(),
            params,
            allowed_tools: Vec::new(),
        }
    }

    /// 与规划阶段共用同一份轨迹
    pub fn with_trace(mut self, trace: TraceRecorder) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_allowed_tools(mut self, allowed: Vec<String>) -> Self {
        self.allowed_tools = allowed;
        self
    }

    pub fn depth(&self) -> u32 {
        self.events.depth()
    }

    pub fn emit(&self, event: RunEvent) {
        self.events.emit(self.trace.len(), event);
    }

    fn tool_allowed(&self, name: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == name)
    }
}

/// 单次阶段体执行所需的上下文（循环迭代各持一份）
struct BodyContext<'a> {
    phase: &'a Phase,
    iteration: Option<usize>,
    depth: u32,
    scope: &'a RunScope,
    settings: &'a ExecutorSettings,
    cancel: &'a CancellationToken,
}

impl BodyContext<'_> {
    fn metadata(&self, purpose: InvocationPurpose, attempt: u32) -> ActionMetadata {
        ActionMetadata::new(self.depth, purpose)
            .phase(self.phase.phase_num)
            .attempt(attempt)
            .iteration(self.iteration)
    }

    fn retries_left(&self, attempt: u32) -> u32 {
        (self.settings.max_retries + 1).saturating_sub(attempt)
    }
}

pub struct TacticalExecutor {
    tools: ToolExecutor,
    llm: Arc<dyn LlmClient>,
    correction: SelfCorrectionEngine,
    scheduler: TaskScheduler,
}

impl TacticalExecutor {
    pub fn new(tools: ToolExecutor, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            tools,
            llm,
            correction: SelfCorrectionEngine::default(),
            scheduler: TaskScheduler::default(),
        }
    }

    pub fn with_correction(mut self, correction: SelfCorrectionEngine) -> Self {
        self.correction = correction;
        self
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.tools.registry()
    }

    /// 执行整个计划
    pub async fn execute(&self, plan: &Plan, scope: &RunScope, settings: &ExecutorSettings) -> ExecutionReport {
        let total = plan.len() as u32;
        let mut outcomes: BTreeMap<u32, PhaseOutcome> = BTreeMap::new();
        let mut aborted = false;
        let mut abandoned: Option<u32> = None;

        for phase in plan.phases() {
            let n = phase.phase_num;
            let skip = if scope.cancel.is_cancelled() {
                Some((SkipReason::Cancelled, false))
            } else if aborted {
                Some((SkipReason::RunAborted, false))
            } else {
                precondition(phase, &outcomes)
            };
            if let Some((reason, benign)) = skip {
                tracing::info!(phase = n, %reason, "phase skipped");
                let mut tracker = PhaseTracker::new(n, None);
                tracker.advance(PhaseState::Skipped);
                self.end_phase(scope, n, total, PhaseEndStatus::Skipped, Some(reason.to_string()));
                outcomes.insert(n, PhaseOutcome::skipped(n, reason, benign));
                continue;
            }

            scope.trace.append(TraceEntry::PhaseStart {
                phase_num: n,
                total_phases: total,
                goal: phase.goal.clone(),
                execution_depth: scope.depth(),
                timestamp: now_millis(),
            });
            scope.emit(RunEvent::PhaseStart {
                phase_num: n,
                total_phases: total,
                goal: phase.goal.clone(),
            });
            tracing::info!(phase = n, total, kind = phase.kind.name(), goal = %phase.goal, "phase start");

            let outcome = match phase.loop_over() {
                Some(source) => self.run_loop(phase, source, &outcomes, scope, settings).await,
                None => {
                    let ctx = BodyContext {
                        phase,
                        iteration: None,
                        depth: scope.depth(),
                        scope,
                        settings,
                        cancel: &scope.cancel,
                    };
                    self.run_body(&ctx, None, &outcomes).await
                }
            };

            match (outcome.state, outcome.error_kind()) {
                (PhaseState::Completed, _) => {
                    self.end_phase(scope, n, total, PhaseEndStatus::Completed, None);
                }
                (_, Some(ErrorKind::Cancelled)) if scope.cancel.is_cancelled() => {
                    // 进行中的阶段被放弃，不写 phase_end
                    tracing::info!(phase = n, "phase abandoned on cancellation");
                    abandoned = Some(n);
                }
                (_, kind) => {
                    let reason = kind.map(|k| k.to_string());
                    self.end_phase(scope, n, total, PhaseEndStatus::Failed, reason);
                    if !settings.continue_on_phase_failure {
                        tracing::warn!(phase = n, "phase failed, aborting run");
                        aborted = true;
                    }
                }
            }
            outcomes.insert(n, outcome);
        }

        let cancelled = outcomes.values().any(|o| {
            o.skip_reason == Some(SkipReason::Cancelled) || o.error_kind() == Some(ErrorKind::Cancelled)
        });
        if cancelled {
            scope.trace.append(TraceEntry::Cancelled {
                phase_num: abandoned,
                execution_depth: scope.depth(),
                timestamp: now_millis(),
            });
        }
        ExecutionReport {
            phases: outcomes.into_values().collect(),
            aborted,
            cancelled,
        }
    }

    fn end_phase(&self, scope: &RunScope, n: u32, total: u32, status: PhaseEndStatus, reason: Option<String>) {
        scope.trace.append(TraceEntry::PhaseEnd {
            phase_num: n,
            total_phases: total,
            status,
            reason,
            execution_depth: scope.depth(),
            timestamp: now_millis(),
        });
        scope.emit(RunEvent::PhaseEnd {
            phase_num: n,
            total_phases: total,
            status: status.as_str().to_string(),
        });
    }

    /// loop 阶段：迭代 source 阶段的结果集；fatal_config 的迭代会取消其余兄弟迭代
    async fn run_loop(
        &self,
        phase: &Phase,
        source: u32,
        outcomes: &BTreeMap<u32, PhaseOutcome>,
        scope: &RunScope,
        settings: &ExecutorSettings,
    ) -> PhaseOutcome {
        let n = phase.phase_num;
        let items = loop_items(outcomes.get(&source).and_then(|o| o.result.clone()));
        if items.is_empty() {
            return PhaseOutcome::completed(n, Value::Array(Vec::new()), 0);
        }
        let count = items.len();
        let siblings = scope.cancel.child_token();
        let siblings = &siblings;

        let results: Vec<PhaseOutcome> = stream::iter(items.into_iter().enumerate())
            .map(|(i, item)| async move {
                let _permit = self.scheduler.acquire(TaskKind::LoopIteration).await;
                let ctx = BodyContext {
                    phase,
                    iteration: Some(i),
                    depth: scope.depth() + 1,
                    scope,
                    settings,
                    cancel: siblings,
                };
                let outcome = self.run_body(&ctx, Some(&item), outcomes).await;
                if outcome.error_kind() == Some(ErrorKind::FatalConfig) {
                    tracing::warn!(phase = n, iteration = i, "fatal iteration, cancelling siblings");
                    siblings.cancel();
                }
                outcome
            })
            .buffered(settings.loop_fan_out.max(1))
            .collect()
            .await;

        let attempts = results.iter().map(|r| r.attempts).sum();
        let failed = results.iter().filter(|r| !r.is_completed()).count();
        if scope.cancel.is_cancelled() {
            return PhaseOutcome::cancelled(n, attempts);
        }
        if let Some(fatal) = results
            .iter()
            .find(|r| r.error_kind() == Some(ErrorKind::FatalConfig))
            .and_then(|r| r.classification.clone())
        {
            return PhaseOutcome::failed(n, fatal, attempts);
        }
        if failed == count {
            let last = results
                .iter()
                .rev()
                .find_map(|r| r.classification.clone())
                .unwrap_or_else(|| ErrorClassification::new(ErrorKind::BudgetExceeded, attempts));
            return PhaseOutcome::failed(n, last, attempts);
        }
        if failed > 0 {
            tracing::warn!(phase = n, failed, total = count, "loop finished with failed iterations");
        }
        let payload = results.into_iter().map(|r| r.result.unwrap_or(Value::Null)).collect();
        let mut outcome = PhaseOutcome::completed(n, Value::Array(payload), attempts);
        outcome.failed_iterations = failed;
        outcome
    }

    async fn run_body(
        &self,
        ctx: &BodyContext<'_>,
        item: Option<&Value>,
        outcomes: &BTreeMap<u32, PhaseOutcome>,
    ) -> PhaseOutcome {
        let args = resolve_arguments(ctx.phase, item, outcomes, &ctx.scope.params);
        if ctx.phase.is_prompt_phase() {
            self.run_directive(ctx, args, outcomes).await
        } else {
            self.run_tool(ctx, args).await
        }
    }

    /// 工具阶段：取第一个可解析且被允许的候选工具，带重试与纠错地调用
    async fn run_tool(&self, ctx: &BodyContext<'_>, mut args: Value) -> PhaseOutcome {
        let n = ctx.phase.phase_num;
        let mut tracker = PhaseTracker::new(n, ctx.iteration);
        let registry = self.tools.registry();
        let Some(tool) = ctx
            .phase
            .candidate_tools
            .iter()
            .find(|t| registry.has_tool(t) && ctx.scope.tool_allowed(t))
            .cloned()
        else {
            tracker.advance(PhaseState::Running);
            tracker.advance(PhaseState::Failed);
            tracker.advance(PhaseState::FailedFinal);
            let c = ErrorClassification::new(ErrorKind::FatalConfig, 0).with(
                "message",
                format!("no resolvable capability among {:?}", ctx.phase.candidate_tools),
            );
            return PhaseOutcome::failed(n, c, 0);
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let metadata = ctx.metadata(InvocationPurpose::Tool, attempt);
            if ctx.cancel.is_cancelled() {
                ctx.scope
                    .trace
                    .record(ExecutionTraceEntry::new(&tool, args.clone(), metadata).cancelled());
                return PhaseOutcome::cancelled(n, attempt);
            }
            tracker.advance(PhaseState::Running);
            ctx.scope.emit(RunEvent::ToolInvoked {
                phase_num: n,
                tool: tool.clone(),
                attempt,
                iteration: ctx.iteration,
            });

            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
                r = self.tools.invoke(&tool, args.clone(), ctx.settings.tool_timeout) => r,
            };
            let entry = ExecutionTraceEntry::new(&tool, args.clone(), metadata);
            let err = match result {
                Ok(output) => {
                    ctx.scope.trace.record(entry.ok(
                        output.payload.clone(),
                        output.input_tokens,
                        output.output_tokens,
                    ));
                    ctx.scope.emit(RunEvent::ToolCompleted {
                        phase_num: n,
                        tool: tool.clone(),
                        ok: true,
                        preview: preview(&payload_text(&output.payload), 200),
                    });
                    tracker.advance(PhaseState::Completed);
                    return PhaseOutcome::completed(n, output.payload, attempt);
                }
                Err(AgentError::Cancelled) => {
                    ctx.scope.trace.record(entry.cancelled());
                    return PhaseOutcome::cancelled(n, attempt);
                }
                Err(e) => e,
            };

            ctx.scope.trace.record(entry.error(err.to_string()));
            ctx.scope.emit(RunEvent::ToolCompleted {
                phase_num: n,
                tool: tool.clone(),
                ok: false,
                preview: preview(&err.to_string(), 200),
            });
            tracker.advance(PhaseState::Failed);

            let classification = self.correction.classify(&err, attempt, ctx.retries_left(attempt));
            let action = self.correction.recovery_for(&classification);
            self.emit_recovery(ctx, &classification, &action);
            match action {
                RecoveryAction::Abort => {
                    tracker.advance(PhaseState::FailedFinal);
                    return PhaseOutcome::failed(n, classification, attempt);
                }
                RecoveryAction::RetryAfter(delay) => {
                    sleep_or_cancel(ctx.cancel, delay).await;
                }
                RecoveryAction::LookupAndRetry { lookup_tool } => {
                    if let Some(fixed) = self
                        .lookup_and_correct(ctx, lookup_tool, &classification, &args, attempt)
                        .await
                    {
                        args = fixed;
                    }
                }
            }
        }
    }

    /// 调用查询工具获取合法名称集合，并据此纠正参数
    async fn lookup_and_correct(
        &self,
        ctx: &BodyContext<'_>,
        lookup_tool: Option<String>,
        classification: &ErrorClassification,
        args: &Value,
        attempt: u32,
    ) -> Option<Value> {
        let Some(tool) = lookup_tool.filter(|t| self.tools.registry().has_tool(t)) else {
            tracing::warn!(phase = ctx.phase.phase_num, "lookup capability unavailable, retrying unchanged");
            return None;
        };
        if ctx.cancel.is_cancelled() {
            return None;
        }
        let metadata = ctx.metadata(InvocationPurpose::Lookup, attempt);
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            r = self.tools.invoke(&tool, args.clone(), ctx.settings.tool_timeout) => r,
        };
        let entry = ExecutionTraceEntry::new(&tool, args.clone(), metadata);
        match result {
            Ok(output) => {
                ctx.scope.trace.record(entry.ok(
                    output.payload.clone(),
                    output.input_tokens,
                    output.output_tokens,
                ));
                self.correction
                    .correct_arguments(args, classification, &output.payload)
                    .map(|(fixed, _)| fixed)
            }
            Err(AgentError::Cancelled) => {
                ctx.scope.trace.record(entry.cancelled());
                None
            }
            Err(e) => {
                tracing::warn!(tool = %tool, error = %e, "lookup failed");
                ctx.scope.trace.record(entry.error(e.to_string()));
                None
            }
        }
    }

    /// 提示阶段：把指令文本、目标与参数交给文本补全服务
    async fn run_directive(
        &self,
        ctx: &BodyContext<'_>,
        args: Value,
        outcomes: &BTreeMap<u32, PhaseOutcome>,
    ) -> PhaseOutcome {
        let n = ctx.phase.phase_num;
        let mut tracker = PhaseTracker::new(n, ctx.iteration);
        let name = ctx.phase.executable_directive.clone().unwrap_or_default();
        let Some(template) = self.tools.registry().directive(&name).map(String::from) else {
            tracker.advance(PhaseState::Running);
            tracker.advance(PhaseState::Failed);
            tracker.advance(PhaseState::FailedFinal);
            let c = ErrorClassification::new(ErrorKind::FatalConfig, 0)
                .with("message", format!("unknown executable directive '{name}'"));
            return PhaseOutcome::failed(n, c, 0);
        };
        let prior: Vec<String> = outcomes
            .values()
            .filter_map(|o| {
                o.result
                    .as_ref()
                    .map(|r| format!("Phase {}: {}", o.phase_num, preview(&payload_text(r), 1000)))
            })
            .collect();
        let mut context = format!(
            "Goal: {}\nArguments: {}",
            ctx.phase.goal,
            serde_json::to_string_pretty(&args).unwrap_or_default()
        );
        if !prior.is_empty() {
            context.push_str("\n\nPrior results:\n");
            context.push_str(&prior.join("\n"));
        }
        let request = CompletionRequest::new("directive", template, context);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let metadata = ctx.metadata(InvocationPurpose::Llm, attempt);
            if ctx.cancel.is_cancelled() {
                let entry = ExecutionTraceEntry::new("directive", Value::String(name.clone()), metadata);
                ctx.scope.trace.record(entry.cancelled());
                return PhaseOutcome::cancelled(n, attempt);
            }
            tracker.advance(PhaseState::Running);
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
                r = self.llm.complete(&request) => r.map_err(AgentError::from),
            };
            let err = match result {
                Ok(completion) => {
                    ctx.scope.trace.record_llm(&request, metadata, Ok(&completion));
                    tracker.advance(PhaseState::Completed);
                    return PhaseOutcome::completed(n, Value::String(completion.text), attempt);
                }
                Err(AgentError::Cancelled) => {
                    let entry = ExecutionTraceEntry::new("directive", Value::String(name.clone()), metadata);
                    ctx.scope.trace.record(entry.cancelled());
                    return PhaseOutcome::cancelled(n, attempt);
                }
                Err(e) => e,
            };
            ctx.scope.trace.record_llm(&request, metadata, Err(&err.to_string()));
            tracker.advance(PhaseState::Failed);

            let classification = self.correction.classify(&err, attempt, ctx.retries_left(attempt));
            let action = self.correction.recovery_for(&classification);
            self.emit_recovery(ctx, &classification, &action);
            match self.correction.retry_delay(&action, attempt) {
                Some(delay) => sleep_or_cancel(ctx.cancel, delay).await,
                None => {
                    tracker.advance(PhaseState::FailedFinal);
                    return PhaseOutcome::failed(n, classification, attempt);
                }
            }
        }
    }

    fn emit_recovery(&self, ctx: &BodyContext<'_>, classification: &ErrorClassification, action: &RecoveryAction) {
        let action_name = match action {
            RecoveryAction::LookupAndRetry { .. } => "lookup_and_retry",
            RecoveryAction::RetryAfter(_) => "retry_after",
            RecoveryAction::Abort => "abort",
        };
        tracing::info!(
            phase = ctx.phase.phase_num,
            attempt = classification.attempt_number,
            kind = %classification.kind,
            action = action_name,
            "self-correction"
        );
        ctx.scope.emit(RunEvent::Recovery {
            phase_num: ctx.phase.phase_num,
            kind: classification.kind.as_str().to_string(),
            action: action_name.to_string(),
        });
    }
}

/// 退避等待，可被取消
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

/// 检查前置条件：条件阶段先求值条件，其余依赖必须已完成
fn precondition(phase: &Phase, outcomes: &BTreeMap<u32, PhaseOutcome>) -> Option<(SkipReason, bool)> {
    if let PhaseKind::Conditional { condition } = &phase.kind {
        let met = outcomes
            .get(&condition.phase)
            .map(|o| evaluate(&condition.predicate, o))
            .unwrap_or(false);
        if !met {
            return Some((SkipReason::ConditionNotMet, true));
        }
    }
    phase.dependencies().into_iter().find_map(|dep| match outcomes.get(&dep) {
        Some(o) if o.is_completed() => None,
        Some(o) => Some((SkipReason::DependencyUnmet { phase: dep }, o.state == PhaseState::Skipped && o.benign_skip)),
        None => Some((SkipReason::DependencyUnmet { phase: dep }, false)),
    })
}

/// 条件谓词求值；被引用阶段未完成时一律为 false
pub fn evaluate(predicate: &ConditionPredicate, outcome: &PhaseOutcome) -> bool {
    if !outcome.is_completed() {
        return false;
    }
    let result = outcome.result.as_ref().unwrap_or(&Value::Null);
    match predicate {
        ConditionPredicate::Succeeded => true,
        ConditionPredicate::NonEmpty => !is_empty_value(result),
        ConditionPredicate::Contains(text) => payload_text(result).contains(text.as_str()),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn payload_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 被迭代的结果集：数组直接迭代；只含一个数组字段的对象迭代该数组；null 为空；其它标量视为单元素
pub fn loop_items(source: Option<Value>) -> Vec<Value> {
    match source {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => {
            let arrays: Vec<&Value> = map.values().filter(|v| v.is_array()).collect();
            match arrays.as_slice() {
                [Value::Array(items)] => items.clone(),
                _ => vec![Value::Object(map)],
            }
        }
        Some(other) => vec![other],
    }
}

/// 解析运行期占位符（请求参数、阶段结果、循环元素）；未提及 {{item}} 的循环阶段以 item 键传入元素
fn resolve_arguments(
    phase: &Phase,
    item: Option<&Value>,
    outcomes: &BTreeMap<u32, PhaseOutcome>,
    params: &Parameters,
) -> Value {
    let template = Value::Object(phase.arguments.clone());
    let mentions_item = placeholders_in(&template)
        .iter()
        .any(|name| matches!(PlaceholderRef::parse(name), PlaceholderRef::Item(_)));
    let resolved = substitute(&template, &mut |name: &str| match PlaceholderRef::parse(name) {
        PlaceholderRef::Param(p) => params.get(&p).map(|v| Value::String(v.clone())),
        PlaceholderRef::PhaseResult(n) => outcomes.get(&n).and_then(|o| o.result.clone()),
        PlaceholderRef::Item(None) => item.cloned(),
        PlaceholderRef::Item(Some(path)) => item.and_then(|v| lookup_path(v, &path)).cloned(),
    });
    let mut args = match resolved {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let (Some(item), false) = (item, mentions_item) {
        args.insert("item".to_string(), item.clone());
    }
    Value::Object(args)
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::trace::ResultStatus;
    use crate::llm::MockLlmClient;
    use crate::plan::Condition;
    use crate::tools::{EchoTool, Tool, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 N 次失败后成功
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a few times"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err("connection reset".to_string())
            } else {
                Ok(ToolOutput::new(json!("ok")))
            }
        }
    }

    /// 字符串参数中含 bad 时报错，否则回显参数
    struct Picky;

    #[async_trait]
    impl Tool for Picky {
        fn name(&self) -> &str {
            "picky"
        }
        fn description(&self) -> &str {
            "rejects bad items"
        }
        async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
            if args.to_string().contains("bad") {
                Err("connection reset".to_string())
            } else {
                Ok(ToolOutput::new(args))
            }
        }
    }

    struct Items;

    #[async_trait]
    impl Tool for Items {
        fn name(&self) -> &str {
            "items"
        }
        fn description(&self) -> &str {
            "returns a list"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::new(json!([{"name": "a"}, {"name": "bad"}, {"name": "c"}])))
        }
    }

    /// 名称为 secret 的条目立即因权限失败，其余条目长时间阻塞
    struct Guarded;

    #[async_trait]
    impl Tool for Guarded {
        fn name(&self) -> &str {
            "guarded"
        }
        fn description(&self) -> &str {
            "denies secret items"
        }
        async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
            if args.to_string().contains("secret") {
                return Err("permission denied for item secret".to_string());
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ToolOutput::new(args))
        }
    }

    struct SecretItems;

    #[async_trait]
    impl Tool for SecretItems {
        fn name(&self) -> &str {
            "secret_items"
        }
        fn description(&self) -> &str {
            "returns a list with one forbidden entry"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::new(json!([{"name": "a"}, {"name": "secret"}, {"name": "c"}])))
        }
    }

    fn executor(failures: u32) -> TacticalExecutor {
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoTool);
        registry.register(Items);
        registry.register(Picky);
        registry.register(Guarded);
        registry.register(SecretItems);
        registry.register(Flaky {
            failures,
            calls: AtomicU32::new(0),
        });
        registry.register_directive("summarize", "Summarize the input.");
        let tools = ToolExecutor::new(Arc::new(registry), 5);
        let engine = SelfCorrectionEngine::new(crate::execution::correction::CorrectionPolicy {
            retry_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        });
        TacticalExecutor::new(tools, Arc::new(MockLlmClient::new().with_default("summary")))
            .with_correction(engine)
    }

    fn scope() -> RunScope {
        RunScope::new(CancellationToken::new(), EventSink::disabled(), Parameters::new())
    }

    #[test]
    fn test_state_transitions() {
        assert!(PhaseState::Pending.can_transition(PhaseState::Skipped));
        assert!(PhaseState::Failed.can_transition(PhaseState::Running));
        assert!(!PhaseState::Completed.can_transition(PhaseState::Running));
        assert!(!PhaseState::Skipped.can_transition(PhaseState::Running));
    }

    #[tokio::test]
    async fn test_transient_retries_then_completes() {
        let plan = Plan::new(vec![Phase::tool_call(1, "flaky", &["flaky"])]);
        let scope = scope();
        let report = executor(2).execute(&plan, &scope, &ExecutorSettings::default()).await;
        let phase = report.phase(1).unwrap();
        assert!(phase.is_completed());
        assert_eq!(phase.attempts, 3);
        assert_eq!(scope.trace.attempts_for_phase(1), 3);
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let plan = Plan::new(vec![
            Phase::tool_call(1, "flaky", &["flaky"]),
            Phase::tool_call(2, "after", &["echo"]),
        ]);
        let scope = scope();
        let settings = ExecutorSettings {
            max_retries: 2,
            ..Default::default()
        };
        let report = executor(100).execute(&plan, &scope, &settings).await;
        let phase = report.phase(1).unwrap();
        assert_eq!(phase.state, PhaseState::FailedFinal);
        assert_eq!(phase.error_kind(), Some(ErrorKind::BudgetExceeded));
        // 首次尝试 + max_retries 次重试
        assert_eq!(scope.trace.attempts_for_phase(1), 3);
        assert!(report.aborted);
        assert_eq!(report.phase(2).unwrap().skip_reason, Some(SkipReason::RunAborted));
    }

    #[tokio::test]
    async fn test_loop_partial_failure_keeps_siblings() {
        let plan = Plan::new(vec![
            Phase::tool_call(1, "list", &["items"]),
            Phase::tool_call(2, "each", &["picky"])
                .with_kind(PhaseKind::Loop { loop_over: 1 })
                .with_arg("name", json!("{{item.name}}")),
        ]);
        let scope = scope();
        let settings = ExecutorSettings {
            max_retries: 1,
            ..Default::default()
        };
        let report = executor(0).execute(&plan, &scope, &settings).await;
        let phase = report.phase(2).unwrap();
        assert!(phase.is_completed());
        assert_eq!(phase.failed_iterations, 1);
        assert_eq!(
            phase.result,
            Some(json!([{"name": "a"}, null, {"name": "c"}]))
        );
        assert!(!report.all_succeeded());

        let depths: Vec<u32> = scope
            .trace
            .snapshot()
            .iter()
            .filter_map(TraceEntry::invocation)
            .filter(|e| e.action.metadata.phase_num == Some(2))
            .map(|e| e.action.metadata.execution_depth)
            .collect();
        assert!(depths.iter().all(|d| *d == 1));
    }

    #[tokio::test]
    async fn test_fatal_iteration_cancels_siblings() {
        let plan = Plan::new(vec![
            Phase::tool_call(1, "list", &["secret_items"]),
            Phase::tool_call(2, "each", &["guarded"])
                .with_kind(PhaseKind::Loop { loop_over: 1 })
                .with_arg("name", json!("{{item.name}}")),
            Phase::tool_call(3, "after", &["echo"]),
        ]);
        let scope = scope();
        let started = std::time::Instant::now();
        let report = executor(0).execute(&plan, &scope, &ExecutorSettings::default()).await;
        assert!(started.elapsed() < Duration::from_secs(10));

        let phase = report.phase(2).unwrap();
        assert_eq!(phase.state, PhaseState::FailedFinal);
        assert_eq!(phase.error_kind(), Some(ErrorKind::FatalConfig));
        // 只有 secret 迭代失败一次，兄弟迭代被取消而非完成
        let phase2: Vec<_> = scope
            .trace
            .snapshot()
            .iter()
            .filter_map(TraceEntry::invocation)
            .filter(|e| e.action.metadata.phase_num == Some(2))
            .map(|e| e.result.status)
            .collect();
        assert_eq!(phase2.iter().filter(|s| **s == ResultStatus::Error).count(), 1);
        assert_eq!(phase2.iter().filter(|s| **s == ResultStatus::Cancelled).count(), 2);
        assert!(!phase2.contains(&ResultStatus::Ok));

        // 只取消兄弟迭代，运行本身未被取消
        assert!(!scope.cancel.is_cancelled());
        assert!(!report.cancelled);
        assert!(report.aborted);
        assert_eq!(report.phase(3).unwrap().skip_reason, Some(SkipReason::RunAborted));
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_independent_phases() {
        let plan = Plan::new(vec![
            Phase::tool_call(1, "flaky", &["flaky"]),
            Phase::tool_call(2, "independent", &["echo"]).with_arg("text", json!("hi")),
            Phase::tool_call(3, "uses 1", &["echo"]).with_arg("text", json!("{{phase:1}}")),
        ]);
        let scope = scope();
        let settings = ExecutorSettings {
            max_retries: 1,
            continue_on_phase_failure: true,
            ..Default::default()
        };
        let report = executor(100).execute(&plan, &scope, &settings).await;
        assert!(!report.aborted);
        assert_eq!(report.phase(1).unwrap().state, PhaseState::FailedFinal);
        assert!(report.phase(2).unwrap().is_completed());
        assert_eq!(
            report.phase(3).unwrap().skip_reason,
            Some(SkipReason::DependencyUnmet { phase: 1 })
        );
        assert!(report.any_completed());
        assert!(!report.all_succeeded());
    }

    #[tokio::test]
    async fn test_directive_retries_after_backoff() {
        let llm = MockLlmClient::new()
            .fail("directive", crate::llm::LlmError::ApiError("overloaded".into()))
            .respond("directive", "summary");
        let mut registry = CapabilityRegistry::new();
        registry.register_directive("summarize", "Summarize the input.");
        let engine = SelfCorrectionEngine::new(crate::execution::correction::CorrectionPolicy {
            retry_backoff: Duration::from_millis(40),
            max_backoff: Duration::from_millis(40),
            ..Default::default()
        });
        let executor = TacticalExecutor::new(ToolExecutor::new(Arc::new(registry), 5), Arc::new(llm))
            .with_correction(engine);

        let plan = Plan::new(vec![Phase::tool_call(1, "summary", &[]).with_directive("summarize")]);
        let scope = scope();
        let started = std::time::Instant::now();
        let report = executor.execute(&plan, &scope, &ExecutorSettings::default()).await;
        assert!(started.elapsed() >= Duration::from_millis(40));
        let phase = report.phase(1).unwrap();
        assert_eq!(phase.result, Some(json!("summary")));
        assert_eq!(phase.attempts, 2);
        assert_eq!(scope.trace.llm_calls("directive"), 2);
    }

    #[tokio::test]
    async fn test_condition_and_dependencies() {
        let plan = Plan::new(vec![
            Phase::tool_call(1, "greet", &["echo"]).with_arg("text", json!("hello")),
            Phase::tool_call(2, "only if bye", &["echo"]).with_kind(PhaseKind::Conditional {
                condition: Condition {
                    phase: 1,
                    predicate: ConditionPredicate::Contains("bye".into()),
                },
            }),
            Phase::tool_call(3, "uses 2", &["echo"]).with_arg("text", json!("{{phase:2}}")),
            Phase::tool_call(4, "summary", &[]).with_directive("summarize"),
        ]);
        let scope = scope();
        let report = executor(0).execute(&plan, &scope, &ExecutorSettings::default()).await;
        assert_eq!(report.phase(2).unwrap().skip_reason, Some(SkipReason::ConditionNotMet));
        assert_eq!(
            report.phase(3).unwrap().skip_reason,
            Some(SkipReason::DependencyUnmet { phase: 2 })
        );
        assert_eq!(report.phase(4).unwrap().result, Some(json!("summary")));
        assert!(report.all_succeeded());
        assert_eq!(scope.trace.llm_calls("directive"), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_tool_is_fatal() {
        let plan = Plan::new(vec![Phase::tool_call(1, "x", &["missing"])]);
        let report = executor(0).execute(&plan, &scope(), &ExecutorSettings::default()).await;
        assert_eq!(report.phase(1).unwrap().error_kind(), Some(ErrorKind::FatalConfig));
        assert!(report.aborted);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let plan = Plan::new(vec![
            Phase::tool_call(1, "a", &["echo"]),
            Phase::tool_call(2, "b", &["echo"]),
        ]);
        let scope = scope();
        scope.cancel.cancel();
        let report = executor(0).execute(&plan, &scope, &ExecutorSettings::default()).await;
        assert!(report.cancelled);
        assert!(report.phases.iter().all(|p| p.state == PhaseState::Skipped));
        assert!(scope.trace.last().unwrap().is_cancelled());
        assert!(!scope
            .trace
            .snapshot()
            .iter()
            .filter_map(TraceEntry::invocation)
            .any(|e| e.result.status == ResultStatus::Ok));
    }

    #[test]
    fn test_loop_items_shapes() {
        assert_eq!(loop_items(Some(json!({"tables": ["a", "b"]}))), vec![json!("a"), json!("b")]);
        assert!(loop_items(Some(Value::Null)).is_empty());
        assert_eq!(loop_items(Some(json!("x"))), vec![json!("x")]);
    }
}
