//! 无头 Agent 运行时：一次请求的端到端流水线
//!
//! 单机配置：指纹匹配 → 计划水合（快速路径）或战略规划 → 战术执行 → 答案 → 冠军案例入库。
//! 协调者配置交给 Genie，由它路由到专家子会话后综合。
//! 任何阶段失败都折叠进 RunOutcome.status，调用方总能拿到状态与完整轨迹。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, ErrorKind, SessionSupervisor, TaskScheduler};
use crate::execution::trace::now_millis;
use crate::execution::{
    complete_traced, CompletionRetry, CorrectionPolicy, EventSender, EventSink, ExecutionReport,
    ExecutorSettings, PhaseOutcome, RunEvent, RunScope, SelfCorrectionEngine, TacticalExecutor,
    TraceEntry, TraceRecorder,
};
use crate::genie::{
    Genie, InMemoryLinkStore, LinkStore, RoutingDecision, SessionLink, SessionLinkRegistry,
    SqliteLinkStore,
};
use crate::llm::{create_embedder_from_config, CompletionRequest, EmbeddingProvider, LlmClient};
use crate::plan::Plan;
use crate::planning::{
    extract_parameters, mask_parameters, parameterize, ChampionCase, ChampionStore, FingerprintMatcher,
    HydrationDecision, InMemoryChampionStore, Parameters, PlanHydrator, PlanningRequest,
    StrategicPlanner,
};
use crate::profile::{Profile, ProfileService};
use crate::tools::{CapabilityRegistry, Tool, ToolExecutor};

const ANSWER_DIRECTIVE: &str = "Answer the user's request using only the phase results provided. \
Be concise and mention any phase that failed or was skipped.";

/// 一次请求
#[derive(Debug, Clone, Default, Serialize)]
pub struct Request {
    pub text: String,
    /// None 使用配置中的 default_profile
    pub profile_id: Option<String>,
    /// 调用方提供的参数，覆盖从文本中抽取的同名参数
    pub parameters: Parameters,
}

impl Request {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_profile(mut self, profile_id: &str) -> Self {
        self.profile_id = Some(profile_id.to_string());
        self
    }

    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    /// 派发给专家的子请求
    pub(crate) fn for_profile(&self, profile_id: &str) -> Self {
        Self {
            text: self.text.clone(),
            profile_id: Some(profile_id.to_string()),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    /// 中止或取消为 failed；全部完成（或良性跳过）为 success；至少一个阶段完成为 partial
    pub fn from_report(report: &ExecutionReport) -> Self {
        if report.cancelled || report.aborted {
            RunStatus::Failed
        } else if report.all_succeeded() {
            RunStatus::Success
        } else if report.any_completed() {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }
}

/// 协调者派发的一个子会话的结果
#[derive(Debug, Clone, Serialize)]
pub struct ChildOutcome {
    pub profile_id: String,
    /// 未能登记（循环委派、超出嵌套深度）时为 None
    pub link: Option<SessionLink>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub outcome: Option<Box<RunOutcome>>,
}

impl ChildOutcome {
    pub(crate) fn rejected(profile_id: &str, reason: String) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            link: None,
            status: RunStatus::Failed,
            error: Some(reason),
            outcome: None,
        }
    }

    pub fn answer(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(|o| o.answer.as_deref())
    }
}

/// 一次运行的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub profile_id: String,
    pub status: RunStatus,
    pub answer: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// 计划来自冠军案例水合
    pub fast_path: bool,
    /// 水合所用的案例
    pub source_case_id: Option<String>,
    /// 本次成功运行写入的案例
    pub champion_case_id: Option<String>,
    pub plan: Option<Plan>,
    pub phases: Vec<PhaseOutcome>,
    pub routing: Option<RoutingDecision>,
    pub children: Vec<ChildOutcome>,
    pub trace: Vec<TraceEntry>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RunOutcome {
    pub(crate) fn new(session_id: &str, profile_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            profile_id: profile_id.to_string(),
            status: RunStatus::Failed,
            answer: None,
            error: None,
            error_kind: None,
            fast_path: false,
            source_case_id: None,
            champion_case_id: None,
            plan: None,
            phases: Vec::new(),
            routing: None,
            children: Vec::new(),
            trace: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// 写入轨迹快照与 token 统计，发出 run_complete
    pub(crate) fn seal(mut self, ctx: &SessionContext, trace: &TraceRecorder) -> Self {
        let (input, output) = trace.token_totals();
        self.input_tokens += input;
        self.output_tokens += output;
        self.trace = trace.snapshot();
        ctx.emit(
            trace,
            RunEvent::RunComplete {
                status: self.status.as_str().to_string(),
                fast_path: self.fast_path,
            },
        );
        tracing::info!(
            session = %self.session_id,
            profile = %self.profile_id,
            status = self.status.as_str(),
            fast_path = self.fast_path,
            tokens = self.input_tokens + self.output_tokens,
            "run complete"
        );
        self
    }
}

/// 一个执行会话的上下文：取消、事件出口与委派链
#[derive(Debug, Clone)]
pub struct SessionContext {
    supervisor: SessionSupervisor,
    events: EventSink,
    /// 从根会话到当前会话的 profile id
    delegation_chain: Vec<String>,
    /// 当前会话作为子会话的嵌套层级；根会话为 None
    nesting_level: Option<u32>,
}

impl SessionContext {
    pub fn root(supervisor: SessionSupervisor, events: Option<EventSender>, profile_id: &str) -> Self {
        let events = EventSink::new(supervisor.session_id(), events);
        Self {
            supervisor,
            events,
            delegation_chain: vec![profile_id.to_string()],
            nesting_level: None,
        }
    }

    pub fn child(&self, child_session_id: &str, profile_id: &str, nesting_level: u32) -> Self {
        let mut delegation_chain = self.delegation_chain.clone();
        delegation_chain.push(profile_id.to_string());
        Self {
            supervisor: self.supervisor.child(child_session_id),
            events: self.events.nested(child_session_id),
            delegation_chain,
            nesting_level: Some(nesting_level),
        }
    }

    pub fn session_id(&self) -> &str {
        self.supervisor.session_id()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.supervisor.cancel_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.supervisor.is_cancelled()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn depth(&self) -> u32 {
        self.events.depth()
    }

    pub fn delegation_chain(&self) -> &[String] {
        &self.delegation_chain
    }

    pub fn nesting_level(&self) -> Option<u32> {
        self.nesting_level
    }

    pub fn emit(&self, trace: &TraceRecorder, event: RunEvent) {
        self.events.emit(trace.len(), event);
    }
}

/// 运行参数（配置默认值；profile 可覆盖部分字段）
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub default_profile: String,
    pub relevance_threshold: f32,
    pub executor: ExecutorSettings,
    pub retry: CompletionRetry,
    pub summarize_answer: bool,
    pub max_parallel_children: usize,
    pub max_nesting_depth: u32,
}

impl AgentSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            default_profile: cfg.app.default_profile.clone(),
            relevance_threshold: cfg.planner.relevance_threshold,
            executor: ExecutorSettings {
                max_retries: cfg.executor.max_retries,
                loop_fan_out: cfg.executor.loop_fan_out,
                continue_on_phase_failure: cfg.executor.continue_on_phase_failure,
                tool_timeout: Some(Duration::from_secs(cfg.executor.tool_timeout_secs)),
            },
            retry: CompletionRetry {
                max_retries: cfg.executor.max_retries,
                backoff: Duration::from_millis(cfg.executor.retry_backoff_ms),
            },
            summarize_answer: cfg.executor.summarize_answer,
            max_parallel_children: cfg.genie.max_parallel_children,
            max_nesting_depth: cfg.genie.max_nesting_depth,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct Agent {
    profiles: Arc<dyn ProfileService>,
    store: Arc<dyn ChampionStore>,
    matcher: FingerprintMatcher,
    hydrator: PlanHydrator,
    planner: StrategicPlanner,
    executor: TacticalExecutor,
    genie: Genie,
    llm: Arc<dyn LlmClient>,
    correction: SelfCorrectionEngine,
    settings: AgentSettings,
}

impl Agent {
    pub fn builder(llm: Arc<dyn LlmClient>, profiles: Arc<dyn ProfileService>) -> AgentBuilder {
        AgentBuilder::new(llm, profiles)
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn profiles(&self) -> &Arc<dyn ProfileService> {
        &self.profiles
    }

    pub fn champion_store(&self) -> &Arc<dyn ChampionStore> {
        &self.store
    }

    pub fn links(&self) -> &Arc<SessionLinkRegistry> {
        self.genie.links()
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.executor.registry()
    }

    /// 处理一次顶层请求；cancel 由调用方触发（Ctrl+C 等），events 为可选的事件通道
    pub async fn run(
        &self,
        request: Request,
        cancel: CancellationToken,
        events: Option<EventSender>,
    ) -> Result<RunOutcome, AgentError> {
        let profile_id = request
            .profile_id
            .clone()
            .unwrap_or_else(|| self.settings.default_profile.clone());
        let supervisor = SessionSupervisor::with_token(uuid::Uuid::new_v4().to_string(), cancel);
        let ctx = SessionContext::root(supervisor, events, &profile_id);
        tracing::info!(session = ctx.session_id(), profile = %profile_id, "run start");
        let request = Request {
            profile_id: Some(profile_id),
            ..request
        };
        self.run_session(&request, ctx).await
    }

    /// 在给定会话中运行请求；协调者的子会话经此递归（返回装箱 future）
    pub fn run_session<'a>(
        &'a self,
        request: &'a Request,
        ctx: SessionContext,
    ) -> BoxFuture<'a, Result<RunOutcome, AgentError>> {
        Box::pin(async move {
            let profile_id = request
                .profile_id
                .as_deref()
                .unwrap_or(&self.settings.default_profile);
            let profile = self
                .profiles
                .get(profile_id)
                .await?
                .ok_or_else(|| AgentError::ConfigError(format!("unknown profile: {profile_id}")))?;

            if profile.is_coordinator() {
                self.genie.coordinate(self, request, &profile, &ctx).await
            } else {
                Ok(self
                    .run_standalone(request, &profile, &ctx, TraceRecorder::new())
                    .await)
            }
        })
    }

    /// 单机流水线；协调者零专家回退时也走这里（沿用协调者的轨迹）
    pub(crate) async fn run_standalone(
        &self,
        request: &Request,
        profile: &Profile,
        ctx: &SessionContext,
        trace: TraceRecorder,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::new(ctx.session_id(), &profile.id);
        let mut params = extract_parameters(&request.text);
        // 指纹只看意图：文本中抽出的参数值先替换为占位符
        let intent = mask_parameters(&request.text, &params);
        params.extend(request.parameters.clone());

        let threshold = profile
            .relevance_threshold
            .unwrap_or(self.settings.relevance_threshold);
        let cancel = ctx.cancel_token();
        let matched = self
            .matcher
            .find(&intent, &profile.id, Some(threshold), &cancel)
            .await;
        if cancel.is_cancelled() {
            return self.fail_run(outcome, ctx, &trace, AgentError::Cancelled);
        }
        let decision = self.hydrator.decide(
            &matched.candidates,
            &params,
            self.executor.registry(),
            &profile.allowed_tools,
        );

        let plan = match decision {
            HydrationDecision::FastPath { plan, case_id, .. } => {
                outcome.fast_path = true;
                outcome.source_case_id = Some(case_id);
                plan
            }
            HydrationDecision::FullPlanning { reason } => {
                tracing::debug!(session = ctx.session_id(), %reason, "full planning");
                let examples: Vec<ChampionCase> =
                    matched.candidates.iter().map(|c| c.case.clone()).collect();
                let input = PlanningRequest {
                    request: &request.text,
                    profile_id: &profile.id,
                    allowed_tools: &profile.allowed_tools,
                    examples: &examples,
                    execution_depth: ctx.depth(),
                };
                match self.planner.plan(&input, &trace, &cancel).await {
                    Ok(plan) => plan,
                    Err(err) => return self.fail_run(outcome, ctx, &trace, err),
                }
            }
        };

        let scope = RunScope::new(ctx.cancel_token(), ctx.events().clone(), params.clone())
            .with_trace(trace.clone())
            .with_allowed_tools(profile.allowed_tools.clone());
        let report = self
            .executor
            .execute(&plan, &scope, &self.executor_settings(profile))
            .await;

        outcome.status = RunStatus::from_report(&report);
        if outcome.status == RunStatus::Failed {
            let (error, kind) = failure_summary(&report);
            outcome.error = Some(error);
            outcome.error_kind = kind;
        } else {
            outcome.answer = Some(self.answer(request, &report, &trace, ctx).await);
        }
        if outcome.status == RunStatus::Success {
            outcome.champion_case_id = self
                .remember(profile, request, matched.fingerprint, &plan, &params, &trace, outcome.fast_path)
                .await;
        }
        outcome.phases = report.phases;
        outcome.plan = Some(plan);
        outcome.seal(ctx, &trace)
    }

    /// 运行在执行前失败（规划被拒、补全服务不可用、取消）
    pub(crate) fn fail_run(
        &self,
        mut outcome: RunOutcome,
        ctx: &SessionContext,
        trace: &TraceRecorder,
        err: AgentError,
    ) -> RunOutcome {
        let kind = self.correction.classify(&err, 1, 0).kind;
        if kind == ErrorKind::Cancelled {
            trace.append(TraceEntry::Cancelled {
                phase_num: None,
                execution_depth: ctx.depth(),
                timestamp: now_millis(),
            });
        }
        tracing::warn!(session = ctx.session_id(), error = %err, %kind, "run failed");
        outcome.status = RunStatus::Failed;
        outcome.error = Some(err.to_string());
        outcome.error_kind = Some(kind);
        outcome.seal(ctx, trace)
    }

    fn executor_settings(&self, profile: &Profile) -> ExecutorSettings {
        let mut settings = self.settings.executor.clone();
        if let Some(n) = profile.max_retries {
            settings.max_retries = n;
        }
        if let Some(flag) = profile.continue_on_phase_failure {
            settings.continue_on_phase_failure = flag;
        }
        settings
    }

    /// 默认直接取最后一个完成阶段的结果；开启 summarize_answer 时再经一次补全汇总
    async fn answer(
        &self,
        request: &Request,
        report: &ExecutionReport,
        trace: &TraceRecorder,
        ctx: &SessionContext,
    ) -> String {
        let direct = report.final_result().map(value_text).unwrap_or_default();
        if !self.settings.summarize_answer {
            return direct;
        }
        let results: Vec<String> = report
            .phases
            .iter()
            .map(|p| match &p.result {
                Some(v) => format!("Phase {} ({:?}): {}", p.phase_num, p.state, value_text(v)),
                None => format!("Phase {} ({:?})", p.phase_num, p.state),
            })
            .collect();
        let completion = CompletionRequest::new(
            "answer",
            ANSWER_DIRECTIVE,
            format!("Request: {}\n\nPhase results:\n{}", request.text, results.join("\n")),
        );
        match complete_traced(
            self.llm.as_ref(),
            &completion,
            trace,
            ctx.depth(),
            &ctx.cancel_token(),
            self.settings.retry,
        )
        .await
        {
            Ok(c) => c.text,
            Err(e) => {
                tracing::warn!(error = %e, "answer summarization failed, using last phase result");
                direct
            }
        }
    }

    /// 成功运行写入冠军案例；嵌入不可用或存储失败时跳过
    #[allow(clippy::too_many_arguments)]
    async fn remember(
        &self,
        profile: &Profile,
        request: &Request,
        fingerprint: Vec<f32>,
        plan: &Plan,
        params: &Parameters,
        trace: &TraceRecorder,
        hydrated: bool,
    ) -> Option<String> {
        if fingerprint.is_empty() {
            tracing::warn!("no request fingerprint, champion case not stored");
            return None;
        }
        let (input, output) = trace.token_totals();
        let case = ChampionCase::new(
            &profile.id,
            &request.text,
            fingerprint,
            parameterize(plan, params),
            input + output,
            hydrated,
        );
        let case_id = case.case_id.clone();
        match self.store.upsert(case).await {
            Ok(()) => {
                tracing::info!(case_id = %case_id, hydrated, cost = input + output, "champion case stored");
                Some(case_id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "champion store unavailable, case not stored");
                None
            }
        }
    }

    /// 用户对某次运行的反馈（-1 / 0 / 1）
    pub async fn record_feedback(&self, case_id: &str, score: i8) -> Result<(), AgentError> {
        self.store.update_feedback(case_id, score).await
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn failure_summary(report: &ExecutionReport) -> (String, Option<ErrorKind>) {
    if report.cancelled {
        return ("run cancelled".to_string(), Some(ErrorKind::Cancelled));
    }
    match report.phases.iter().find(|p| p.classification.is_some()) {
        Some(p) => {
            let kind = p.error_kind();
            let detail = p
                .classification
                .as_ref()
                .and_then(|c| c.message())
                .unwrap_or_default();
            (
                format!(
                    "phase {} failed ({}): {detail}",
                    p.phase_num,
                    kind.map(|k| k.as_str()).unwrap_or("unknown")
                ),
                kind,
            )
        }
        None => ("no phase completed".to_string(), None),
    }
}

/// Agent 构建器：按配置组装各组件
pub struct AgentBuilder {
    llm: Arc<dyn LlmClient>,
    profiles: Arc<dyn ProfileService>,
    registry: CapabilityRegistry,
    config: AppConfig,
    store: Option<Arc<dyn ChampionStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    link_store: Option<Arc<dyn LinkStore>>,
}

impl AgentBuilder {
    pub fn new(llm: Arc<dyn LlmClient>, profiles: Arc<dyn ProfileService>) -> Self {
        Self {
            llm,
            profiles,
            registry: CapabilityRegistry::new(),
            config: AppConfig::default(),
            store: None,
            embedder: None,
            link_store: None,
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.registry.register(tool);
        self
    }

    pub fn with_directive(mut self, name: &str, template: &str) -> Self {
        self.registry.register_directive(name, template);
        self
    }

    pub fn with_champion_store(mut self, store: Arc<dyn ChampionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_link_store(mut self, store: Arc<dyn LinkStore>) -> Self {
        self.link_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let cfg = &self.config;
        let settings = AgentSettings::from_config(cfg);
        let registry = Arc::new(self.registry);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryChampionStore::new()));
        let embedder = self.embedder.unwrap_or_else(|| {
            create_embedder_from_config(
                &cfg.embedding.provider,
                cfg.embedding.base_url.as_deref(),
                &cfg.embedding.model,
                cfg.embedding.dimensions,
            )
        });
        let link_store: Arc<dyn LinkStore> = match (self.link_store, &cfg.links.sqlite_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteLinkStore::open(path)?),
            (None, None) => Arc::new(InMemoryLinkStore::new()),
        };

        let matcher = FingerprintMatcher::new(embedder, store.clone())
            .with_relevance_threshold(cfg.planner.relevance_threshold)
            .with_top_k(cfg.planner.top_k)
            .with_store_timeout(Duration::from_millis(cfg.planner.store_timeout_ms));
        let hydrator = PlanHydrator::new(cfg.planner.hydration_threshold, cfg.planner.tie_break);
        let planner = StrategicPlanner::new(self.llm.clone(), registry.clone())
            .with_max_examples(cfg.planner.max_champion_examples)
            .with_retries(settings.retry.max_retries, settings.retry.backoff);

        let correction = SelfCorrectionEngine::new(CorrectionPolicy {
            column_lookup_tool: cfg.executor.column_lookup_tool.clone(),
            table_lookup_tool: cfg.executor.table_lookup_tool.clone(),
            retry_backoff: Duration::from_millis(cfg.executor.retry_backoff_ms),
            max_backoff: Duration::from_millis(cfg.executor.max_backoff_ms),
        });
        let tools = ToolExecutor::new(registry, cfg.executor.tool_timeout_secs);
        let executor = TacticalExecutor::new(tools, self.llm.clone())
            .with_correction(correction.clone())
            .with_scheduler(TaskScheduler::new(
                cfg.executor.loop_fan_out,
                cfg.genie.max_parallel_children,
            ));
        let genie = Genie::new(self.llm.clone(), Arc::new(SessionLinkRegistry::new(link_store)))
            .with_limits(settings.max_parallel_children, settings.max_nesting_depth)
            .with_retry(settings.retry);

        tracing::info!(
            llm = self.llm.name(),
            tools = executor.registry().tool_names().len(),
            "agent built"
        );
        Ok(Agent {
            profiles: self.profiles,
            store,
            matcher,
            hydrator,
            planner,
            executor,
            genie,
            llm: self.llm,
            correction,
            settings,
        })
    }
}
