//! 协调者（Genie）：把请求路由给专家配置，派生子会话并综合结果
//!
//! 流程：routing（一次补全，选出专家子集与理由）→ 逐个登记会话链接 → 运行子会话
//! （默认顺序；专家声明相互独立时并发，上限 max_parallel_children）→ synthesis（一次补全）。
//! 零专家时协调者自己走单机流水线。子会话失败不影响兄弟会话，作为失败上下文交给综合。

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, ChildOutcome, Request, RunOutcome, RunStatus, SessionContext};
use crate::core::{AgentError, TaskKind, TaskScheduler};
use crate::execution::{complete_traced, CompletionRetry, RunEvent, TraceRecorder};
use crate::genie::links::{LinkStatus, SessionLink, SessionLinkRegistry};
use crate::llm::{CompletionRequest, LlmClient};
use crate::plan::extract_json;
use crate::profile::Profile;

pub const ROUTING_PURPOSE: &str = "routing";
pub const SYNTHESIS_PURPOSE: &str = "synthesis";

const ROUTING_DIRECTIVE: &str = r#"You are a coordinator. Decide which experts should handle the user's request.
Reply with a single JSON object and nothing else:
{"experts": ["<expert id>", ...], "rationale": "<why>", "independent": <true if no expert needs another's output>}
Select no experts if you can answer the request yourself."#;

const SYNTHESIS_DIRECTIVE: &str = "Combine the expert results below into one answer to the user's request. \
If an expert failed, say what could not be answered and why.";

/// 路由决策
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub experts: Vec<String>,
    pub rationale: String,
    /// 专家之间没有输出依赖，可并发
    pub independent: bool,
}

impl RoutingDecision {
    fn none(rationale: impl Into<String>) -> Self {
        Self {
            experts: Vec::new(),
            rationale: rationale.into(),
            independent: false,
        }
    }
}

#[derive(Deserialize)]
struct RawRouting {
    #[serde(default)]
    experts: Vec<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    independent: bool,
}

/// 解析路由回复；不认识的专家 id 丢弃，重复的只保留第一次。无法解析时返回 None
pub fn parse_routing(text: &str, candidates: &[String]) -> Option<RoutingDecision> {
    let raw: RawRouting = serde_json::from_str(extract_json(text)?).ok()?;
    let mut experts: Vec<String> = Vec::new();
    for id in raw.experts {
        if !candidates.contains(&id) {
            tracing::debug!(expert = %id, "routing named unknown expert, dropped");
        } else if !experts.contains(&id) {
            experts.push(id);
        }
    }
    Some(RoutingDecision {
        experts,
        rationale: raw.rationale,
        independent: raw.independent,
    })
}

/// 已登记（或被拒绝登记）的一个派发
struct Dispatch {
    profile_id: String,
    link: Result<SessionLink, String>,
}

pub struct Genie {
    llm: Arc<dyn LlmClient>,
    links: Arc<SessionLinkRegistry>,
    max_parallel_children: usize,
    max_nesting_depth: u32,
    retry: CompletionRetry,
}

impl Genie {
    pub fn new(llm: Arc<dyn LlmClient>, links: Arc<SessionLinkRegistry>) -> Self {
        Self {
            llm,
            links,
            max_parallel_children: 2,
            max_nesting_depth: 4,
            retry: CompletionRetry::default(),
        }
    }

    pub fn with_limits(mut self, max_parallel_children: usize, max_nesting_depth: u32) -> Self {
        self.max_parallel_children = max_parallel_children.max(1);
        self.max_nesting_depth = max_nesting_depth;
        self
    }

    pub fn with_retry(mut self, retry: CompletionRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn links(&self) -> &Arc<SessionLinkRegistry> {
        &self.links
    }

    /// 处理协调者配置下的一次请求
    pub async fn coordinate(
        &self,
        agent: &Agent,
        request: &Request,
        profile: &Profile,
        ctx: &SessionContext,
    ) -> Result<RunOutcome, AgentError> {
        let trace = TraceRecorder::new();
        let mut candidates = Vec::new();
        for id in &profile.experts {
            match agent.profiles().get(id).await? {
                Some(expert) => candidates.push(expert),
                None => tracing::warn!(expert = %id, "expert profile not found, not offered to routing"),
            }
        }

        let routing = match self.route(request, profile, &candidates, &trace, ctx).await {
            Ok(routing) => routing,
            Err(AgentError::Cancelled) => {
                let outcome = RunOutcome::new(ctx.session_id(), &profile.id);
                return Ok(agent.fail_run(outcome, ctx, &trace, AgentError::Cancelled));
            }
            Err(e) => {
                tracing::warn!(error = %e, "routing unavailable, handling request directly");
                RoutingDecision::none(format!("routing unavailable: {e}"))
            }
        };
        ctx.emit(
            &trace,
            RunEvent::RoutingDecision {
                experts: routing.experts.clone(),
                rationale: routing.rationale.clone(),
            },
        );
        tracing::info!(
            session = ctx.session_id(),
            experts = ?routing.experts,
            independent = routing.independent,
            "routing decision"
        );

        if routing.experts.is_empty() {
            let mut outcome = agent.run_standalone(request, profile, ctx, trace).await;
            outcome.routing = Some(routing);
            return Ok(outcome);
        }

        // 链接在任何子会话开始前按路由顺序登记，execution_order 即调用顺序
        let nesting_level = ctx.nesting_level().map_or(0, |level| level + 1);
        let mut dispatches = Vec::with_capacity(routing.experts.len());
        for expert in &routing.experts {
            dispatches.push(self.dispatch(expert, ctx, nesting_level).await);
        }

        let limit = profile
            .max_parallel_children
            .unwrap_or(self.max_parallel_children)
            .max(1);
        let children = if routing.independent && limit > 1 {
            let scheduler = TaskScheduler::new(1, limit);
            let scheduler = &scheduler;
            let trace = &trace;
            join_all(dispatches.into_iter().map(|d| async move {
                let _permit = scheduler.acquire(TaskKind::ChildSession).await;
                self.run_child(agent, request, ctx, trace, d).await
            }))
            .await
        } else {
            let mut children = Vec::with_capacity(dispatches.len());
            for d in dispatches {
                children.push(self.run_child(agent, request, ctx, &trace, d).await);
            }
            children
        };

        let mut outcome = RunOutcome::new(ctx.session_id(), &profile.id);
        outcome.routing = Some(routing);
        for child in children.iter().filter_map(|c| c.outcome.as_ref()) {
            outcome.input_tokens += child.input_tokens;
            outcome.output_tokens += child.output_tokens;
        }

        if ctx.is_cancelled() {
            outcome.children = children;
            return Ok(agent.fail_run(outcome, ctx, &trace, AgentError::Cancelled));
        }

        ctx.emit(&trace, RunEvent::SynthesisStart { children: children.len() });
        match self.synthesize(request, &children, &trace, ctx).await {
            Ok(answer) => {
                outcome.status = if children.iter().all(|c| c.status == RunStatus::Success) {
                    RunStatus::Success
                } else {
                    RunStatus::Partial
                };
                outcome.answer = Some(answer);
                outcome.children = children;
                Ok(outcome.seal(ctx, &trace))
            }
            Err(e) => {
                outcome.children = children;
                let err = match e {
                    AgentError::Cancelled => AgentError::Cancelled,
                    other => AgentError::Synthesis(other.to_string()),
                };
                Ok(agent.fail_run(outcome, ctx, &trace, err))
            }
        }
    }

    async fn route(
        &self,
        request: &Request,
        profile: &Profile,
        candidates: &[Profile],
        trace: &TraceRecorder,
        ctx: &SessionContext,
    ) -> Result<RoutingDecision, AgentError> {
        if candidates.is_empty() {
            return Ok(RoutingDecision::none("no experts configured"));
        }
        let experts: Vec<String> = candidates
            .iter()
            .map(|p| format!("- {}: {}", p.id, p.description))
            .collect();
        let completion = CompletionRequest::new(
            ROUTING_PURPOSE,
            format!("{ROUTING_DIRECTIVE}\n\nExperts:\n{}", experts.join("\n")),
            format!("Coordinator: {}\nRequest: {}", profile.id, request.text),
        );
        let reply = complete_traced(
            self.llm.as_ref(),
            &completion,
            trace,
            ctx.depth(),
            &ctx.cancel_token(),
            self.retry,
        )
        .await?;

        let ids: Vec<String> = candidates.iter().map(|p| p.id.clone()).collect();
        Ok(parse_routing(&reply.text, &ids).unwrap_or_else(|| {
            tracing::warn!("unparsable routing response, falling back to direct execution");
            RoutingDecision::none("unparsable routing response")
        }))
    }

    /// 检查委派链与嵌套深度后登记链接
    async fn dispatch(&self, expert: &str, ctx: &SessionContext, nesting_level: u32) -> Dispatch {
        let link = if ctx.delegation_chain().iter().any(|p| p == expert) {
            Err(format!("profile {expert} is already in the delegation chain"))
        } else if nesting_level > self.max_nesting_depth {
            Err(format!(
                "nesting level {nesting_level} exceeds max_nesting_depth {}",
                self.max_nesting_depth
            ))
        } else {
            let child_session_id = uuid::Uuid::new_v4().to_string();
            self.links
                .register(ctx.session_id(), &child_session_id, expert)
                .await
                .map_err(|e| e.to_string())
        };
        if let Err(reason) = &link {
            tracing::warn!(expert, %reason, "expert not dispatched");
        }
        Dispatch {
            profile_id: expert.to_string(),
            link,
        }
    }

    async fn run_child(
        &self,
        agent: &Agent,
        request: &Request,
        ctx: &SessionContext,
        trace: &TraceRecorder,
        dispatch: Dispatch,
    ) -> ChildOutcome {
        let link = match dispatch.link {
            Ok(link) => link,
            Err(reason) => return ChildOutcome::rejected(&dispatch.profile_id, reason),
        };
        ctx.emit(
            trace,
            RunEvent::ChildInvoked {
                child_session_id: link.child_session_id.clone(),
                profile_id: link.child_profile_id.clone(),
                execution_order: link.execution_order,
            },
        );

        let result = if ctx.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            let child_ctx = ctx.child(&link.child_session_id, &link.child_profile_id, link.nesting_level);
            let child_request = request.for_profile(&link.child_profile_id);
            agent.run_session(&child_request, child_ctx).await
        };
        let (status, error, outcome) = match result {
            Ok(outcome) => (outcome.status, outcome.error.clone(), Some(Box::new(outcome))),
            Err(e) => (RunStatus::Failed, Some(e.to_string()), None),
        };

        let link_status = match status {
            RunStatus::Failed => LinkStatus::Failed,
            _ => LinkStatus::Completed,
        };
        if let Err(e) = self.links.finish(&link.child_session_id, link_status).await {
            tracing::warn!(child = %link.child_session_id, error = %e, "failed to update session link");
        }
        ctx.emit(
            trace,
            RunEvent::ChildCompleted {
                child_session_id: link.child_session_id.clone(),
                profile_id: link.child_profile_id.clone(),
                status: status.as_str().to_string(),
            },
        );
        ChildOutcome {
            profile_id: dispatch.profile_id,
            link: Some(SessionLink {
                status: link_status,
                ..link
            }),
            status,
            error,
            outcome,
        }
    }

    async fn synthesize(
        &self,
        request: &Request,
        children: &[ChildOutcome],
        trace: &TraceRecorder,
        ctx: &SessionContext,
    ) -> Result<String, AgentError> {
        let results: Vec<String> = children
            .iter()
            .map(|child| {
                let order = child
                    .link
                    .as_ref()
                    .map(|l| l.execution_order.to_string())
                    .unwrap_or_else(|| "-".to_string());
                match child.status {
                    RunStatus::Failed => format!(
                        "[{order}] {} (failed): {}",
                        child.profile_id,
                        child.error.as_deref().unwrap_or("unknown error")
                    ),
                    status => format!(
                        "[{order}] {} ({}): {}",
                        child.profile_id,
                        status.as_str(),
                        child.answer().unwrap_or_default()
                    ),
                }
            })
            .collect();
        let completion = CompletionRequest::new(
            SYNTHESIS_PURPOSE,
            SYNTHESIS_DIRECTIVE,
            format!("Request: {}\n\nExpert results:\n{}", request.text, results.join("\n")),
        );
        let reply = complete_traced(
            self.llm.as_ref(),
            &completion,
            trace,
            ctx.depth(),
            &ctx.cancel_token(),
            self.retry,
        )
        .await?;
        Ok(reply.text)
    }
}
