//! 协调者场景：并发专家部分失败、零专家回退、嵌套委派、链接归档与 SQLite 持久化

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use hive::config::AppConfig;
use hive::execution::{event_channel, InvocationPurpose, RunEvent, TraceEntry};
use hive::genie::{LinkStatus, SessionLinkRegistry, SqliteLinkStore, ROUTING_PURPOSE, SYNTHESIS_PURPOSE};
use hive::llm::{LlmError, MockLlmClient};
use hive::profile::{Profile, StaticProfileService};
use hive::tools::{Tool, ToolOutput};
use hive::{Agent, Request, RunStatus};

const LIST_TABLES_PLAN: &str = r#"{"phases": [{"type": "tool_call", "phase_num": 1, "goal": "list tables", "candidate_tools": ["list_tables"], "arguments": {"database": "X"}}]}"#;

const REQUEST: &str = "list tables in database X and explain them";

struct ListTables;

#[async_trait]
impl Tool for ListTables {
    fn name(&self) -> &str {
        "list_tables"
    }
    fn description(&self) -> &str {
        "List tables of a database."
    }
    async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
        Ok(ToolOutput::new(json!(["users", "orders"])))
    }
}

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.executor.retry_backoff_ms = 1;
    cfg.executor.max_backoff_ms = 2;
    cfg
}

fn build_with(llm: Arc<MockLlmClient>, profiles: Vec<Profile>, cfg: AppConfig) -> Agent {
    Agent::builder(llm, Arc::new(StaticProfileService::new(profiles)))
        .with_config(cfg)
        .with_tool(ListTables)
        .build()
        .unwrap()
}

fn analyst_profiles() -> Vec<Profile> {
    vec![
        Profile::coordinator("analyst", &["sql", "docs"]).with_description("routes data questions"),
        Profile::standalone("sql").with_description("answers with SQL"),
        Profile::standalone("docs").with_description("answers from documentation"),
    ]
}

fn two_expert_llm() -> Arc<MockLlmClient> {
    Arc::new(
        MockLlmClient::new()
            .respond(
                ROUTING_PURPOSE,
                r#"{"experts": ["sql", "docs"], "rationale": "needs data and docs", "independent": true}"#,
            )
            .respond("strategic_planner", LIST_TABLES_PLAN)
            .respond_when("strategic_planner", "Profile: docs", "no plan for this")
            .respond(SYNTHESIS_PURPOSE, "combined answer"),
    )
}

fn llm_calls(trace: &[TraceEntry], purpose: &str) -> usize {
    trace
        .iter()
        .filter_map(TraceEntry::invocation)
        .filter(|e| {
            e.action.metadata.purpose == InvocationPurpose::Llm && e.action.target_name == purpose
        })
        .count()
}

#[tokio::test]
async fn failing_expert_yields_partial_synthesis() {
    let llm = two_expert_llm();
    let agent = build_with(llm.clone(), analyst_profiles(), config());

    let outcome = agent
        .run(Request::new(REQUEST).with_profile("analyst"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Partial);
    assert_eq!(outcome.answer.as_deref(), Some("combined answer"));
    assert!(outcome.champion_case_id.is_none());
    assert_eq!(outcome.children.len(), 2);

    let sql = &outcome.children[0];
    assert_eq!(sql.profile_id, "sql");
    assert_eq!(sql.status, RunStatus::Success);
    let sql_link = sql.link.as_ref().unwrap();
    assert_eq!(sql_link.execution_order, 1);
    assert_eq!(sql_link.nesting_level, 0);
    assert_eq!(sql_link.status, LinkStatus::Completed);
    assert_eq!(
        sql.outcome.as_ref().unwrap().session_id,
        sql_link.child_session_id
    );

    let docs = &outcome.children[1];
    assert_eq!(docs.profile_id, "docs");
    assert_eq!(docs.status, RunStatus::Failed);
    assert!(docs.error.is_some());
    let docs_link = docs.link.as_ref().unwrap();
    assert_eq!(docs_link.execution_order, 2);
    assert_eq!(docs_link.status, LinkStatus::Failed);

    let synthesis = llm
        .requests()
        .into_iter()
        .find(|r| r.purpose == SYNTHESIS_PURPOSE)
        .unwrap();
    assert!(synthesis.context.contains("docs (failed)"));
    assert!(synthesis.context.contains("sql (success)"));

    assert_eq!(llm_calls(&outcome.trace, ROUTING_PURPOSE), 1);
    assert_eq!(llm_calls(&outcome.trace, SYNTHESIS_PURPOSE), 1);
    let child_tokens: u64 = outcome
        .children
        .iter()
        .filter_map(|c| c.outcome.as_ref())
        .map(|o| o.input_tokens)
        .sum();
    assert!(outcome.input_tokens > child_tokens);

    let stored = agent.links().list_children(&outcome.session_id).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].child_profile_id, "sql");
    assert_eq!(stored[1].status, LinkStatus::Failed);
}

#[tokio::test]
async fn archived_expert_is_hidden_but_kept() {
    let agent = build_with(two_expert_llm(), analyst_profiles(), config());
    let outcome = agent
        .run(Request::new(REQUEST).with_profile("analyst"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(agent.links().archive_profile("docs").await.unwrap(), 1);
    assert_eq!(agent.links().archive_profile("docs").await.unwrap(), 0);

    let visible = agent.links().visible_children(&outcome.session_id).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].child_profile_id, "sql");

    let all = agent.links().list_children(&outcome.session_id).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|l| l.child_profile_id == "docs" && l.archived));
}

#[tokio::test]
async fn zero_experts_falls_back_to_standalone() {
    let llm = Arc::new(
        MockLlmClient::new()
            .respond(ROUTING_PURPOSE, r#"{"experts": [], "rationale": "simple enough"}"#)
            .respond("strategic_planner", LIST_TABLES_PLAN),
    );
    let agent = build_with(llm.clone(), analyst_profiles(), config());
    let (tx, mut rx) = event_channel();

    let outcome = agent
        .run(Request::new(REQUEST).with_profile("analyst"), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    assert!(outcome.children.is_empty());
    let routing = outcome.routing.as_ref().unwrap();
    assert!(routing.experts.is_empty());
    assert_eq!(routing.rationale, "simple enough");
    assert!(outcome.plan.is_some());
    assert_eq!(llm.calls(SYNTHESIS_PURPOSE), 0);
    assert_eq!(llm_calls(&outcome.trace, ROUTING_PURPOSE), 1);
    assert!(agent.links().list_children(&outcome.session_id).await.unwrap().is_empty());

    let mut events = Vec::new();
    while let Some(envelope) = rx.recv().await {
        events.push(envelope.event);
    }
    assert_eq!(
        events.first(),
        Some(&RunEvent::RoutingDecision {
            experts: Vec::new(),
            rationale: "simple enough".to_string()
        })
    );
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunComplete { status, .. }) if status == "success"
    ));
}

#[tokio::test]
async fn unparsable_routing_falls_back() {
    let llm = Arc::new(
        MockLlmClient::new()
            .respond(ROUTING_PURPOSE, "I would ask the sql expert")
            .respond("strategic_planner", LIST_TABLES_PLAN),
    );
    let agent = build_with(llm, analyst_profiles(), config());

    let outcome = agent
        .run(Request::new(REQUEST).with_profile("analyst"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    assert!(outcome.children.is_empty());
    assert_eq!(
        outcome.routing.unwrap().rationale,
        "unparsable routing response"
    );
}

#[tokio::test]
async fn routing_failure_retries_then_falls_back() {
    let llm = Arc::new(
        MockLlmClient::new()
            .fail(ROUTING_PURPOSE, LlmError::Timeout)
            .respond("strategic_planner", LIST_TABLES_PLAN),
    );
    let agent = build_with(llm.clone(), analyst_profiles(), config());

    let outcome = agent
        .run(Request::new(REQUEST).with_profile("analyst"), CancellationToken::new(), None)
        .await
        .unwrap();

    // 默认 max_retries = 3
    assert_eq!(llm.calls(ROUTING_PURPOSE), 4);
    assert_eq!(llm_calls(&outcome.trace, ROUTING_PURPOSE), 4);
    assert_eq!(outcome.status, RunStatus::Success);
    assert!(outcome.routing.unwrap().experts.is_empty());
}

fn nested_profiles() -> Vec<Profile> {
    vec![
        Profile::coordinator("lead", &["analyst"]),
        Profile::coordinator("analyst", &["sql", "lead"]),
        Profile::standalone("sql"),
    ]
}

fn nested_llm() -> Arc<MockLlmClient> {
    Arc::new(
        MockLlmClient::new()
            .respond_when(ROUTING_PURPOSE, "Coordinator: lead", r#"{"experts": ["analyst"], "rationale": "delegate"}"#)
            .respond_when(
                ROUTING_PURPOSE,
                "Coordinator: analyst",
                r#"{"experts": ["sql", "lead"], "rationale": "data then review"}"#,
            )
            .respond("strategic_planner", LIST_TABLES_PLAN)
            .respond(SYNTHESIS_PURPOSE, "merged"),
    )
}

#[tokio::test]
async fn nested_coordinator_rejects_cycles() {
    let agent = build_with(nested_llm(), nested_profiles(), config());
    let (tx, mut rx) = event_channel();

    let outcome = agent
        .run(Request::new(REQUEST).with_profile("lead"), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    assert_eq!(outcome.children.len(), 1);
    let analyst = &outcome.children[0];
    assert_eq!(analyst.profile_id, "analyst");
    assert_eq!(analyst.link.as_ref().unwrap().nesting_level, 0);
    // 子协调者有一个专家被拒绝，因此为 partial，链接仍算 completed
    assert_eq!(analyst.status, RunStatus::Partial);
    assert_eq!(analyst.link.as_ref().unwrap().status, LinkStatus::Completed);
    assert_eq!(outcome.status, RunStatus::Partial);

    let inner = analyst.outcome.as_ref().unwrap();
    assert_eq!(inner.children.len(), 2);
    let sql = &inner.children[0];
    assert_eq!(sql.status, RunStatus::Success);
    assert_eq!(sql.link.as_ref().unwrap().nesting_level, 1);
    assert_eq!(sql.link.as_ref().unwrap().execution_order, 1);

    let lead = &inner.children[1];
    assert!(lead.link.is_none());
    assert_eq!(lead.status, RunStatus::Failed);
    assert!(lead.error.as_deref().unwrap().contains("delegation chain"));

    let analyst_session = &analyst.link.as_ref().unwrap().child_session_id;
    let ancestors = agent
        .links()
        .ancestors(&sql.link.as_ref().unwrap().child_session_id)
        .await
        .unwrap();
    assert_eq!(ancestors, vec![analyst_session.clone(), outcome.session_id.clone()]);

    let sql_tool_depths: Vec<u32> = sql
        .outcome
        .as_ref()
        .unwrap()
        .trace
        .iter()
        .filter_map(TraceEntry::invocation)
        .filter(|e| e.action.metadata.purpose == InvocationPurpose::Tool)
        .map(|e| e.action.metadata.execution_depth)
        .collect();
    assert_eq!(sql_tool_depths, vec![2]);

    let mut max_depth = 0;
    while let Some(envelope) = rx.recv().await {
        if matches!(envelope.event, RunEvent::PhaseStart { .. }) {
            max_depth = max_depth.max(envelope.execution_depth);
        }
    }
    assert_eq!(max_depth, 2);
}

#[tokio::test]
async fn nesting_beyond_limit_is_rejected() {
    let mut cfg = config();
    cfg.genie.max_nesting_depth = 0;
    let agent = build_with(nested_llm(), nested_profiles(), cfg);

    let outcome = agent
        .run(Request::new(REQUEST).with_profile("lead"), CancellationToken::new(), None)
        .await
        .unwrap();

    let inner = outcome.children[0].outcome.as_ref().unwrap();
    assert!(inner.children.iter().all(|c| c.link.is_none()));
    assert!(inner.children[0]
        .error
        .as_deref()
        .unwrap()
        .contains("max_nesting_depth"));
    assert_eq!(outcome.children[0].status, RunStatus::Partial);
}

#[tokio::test]
async fn links_persist_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("links.db");
    let mut cfg = config();
    cfg.links.sqlite_path = Some(path.clone());
    let agent = build_with(two_expert_llm(), analyst_profiles(), cfg);

    let outcome = agent
        .run(Request::new(REQUEST).with_profile("analyst"), CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Partial);

    let reopened = SessionLinkRegistry::new(Arc::new(SqliteLinkStore::open(&path).unwrap()));
    let links = reopened.list_children(&outcome.session_id).await.unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].execution_order, 1);
    assert_eq!(links[0].status, LinkStatus::Completed);
    assert_eq!(links[1].child_profile_id, "docs");
    assert_eq!(links[1].status, LinkStatus::Failed);
}
