//! 单机流水线场景：首次规划、快速路径复用、列名纠错、重试上限、失败后继续、取消

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use hive::config::AppConfig;
use hive::core::ErrorKind;
use hive::execution::{
    event_channel, InvocationPurpose, PhaseEndStatus, PhaseState, RunEvent, SkipReason, TraceEntry,
};
use hive::llm::MockLlmClient;
use hive::profile::{Profile, StaticProfileService};
use hive::tools::{Tool, ToolOutput};
use hive::{Agent, Request, RunStatus};

const LIST_TABLES_PLAN: &str = r#"{"phases": [{"type": "tool_call", "phase_num": 1, "goal": "list tables", "candidate_tools": ["list_tables"], "arguments": {"database": "X"}}]}"#;

const QUERY_PLAN: &str = r#"{"phases": [{"type": "tool_call", "phase_num": 1, "goal": "select the column", "candidate_tools": ["run_query"], "arguments": {"sql": "SELECT foo FROM users"}}]}"#;

const FLAKY_PLAN: &str = r#"{"phases": [{"type": "tool_call", "phase_num": 1, "goal": "call the flaky service", "candidate_tools": ["always_down"], "arguments": {}}]}"#;

const SLOW_PLAN: &str = r#"{"phases": [
  {"type": "tool_call", "phase_num": 1, "goal": "wait", "candidate_tools": ["slow"], "arguments": {}},
  {"type": "tool_call", "phase_num": 2, "goal": "list", "candidate_tools": ["list_tables"], "arguments": {"database": "X"}},
  {"type": "tool_call", "phase_num": 3, "goal": "list again", "candidate_tools": ["list_tables"], "arguments": {"database": "Y"}}
]}"#;

const DEPENDENT_PLAN: &str = r#"{"phases": [
  {"type": "tool_call", "phase_num": 1, "goal": "call the flaky service", "candidate_tools": ["always_down"], "arguments": {}},
  {"type": "tool_call", "phase_num": 2, "goal": "list", "candidate_tools": ["list_tables"], "arguments": {"database": "X"}},
  {"type": "tool_call", "phase_num": 3, "goal": "use the service result", "candidate_tools": ["list_tables"], "arguments": {"database": "{{phase:1}}"}}
]}"#;

struct ListTables;

#[async_trait]
impl Tool for ListTables {
    fn name(&self) -> &str {
        "list_tables"
    }
    fn description(&self) -> &str {
        "List tables of a database. Args: {\"database\": \"name\"}"
    }
    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let db = args.get("database").and_then(Value::as_str).unwrap_or("default");
        Ok(ToolOutput::new(json!({ "database": db, "tables": ["users", "orders"] })))
    }
}

struct ListColumns;

#[async_trait]
impl Tool for ListColumns {
    fn name(&self) -> &str {
        "list_columns"
    }
    fn description(&self) -> &str {
        "List columns of a table."
    }
    async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
        Ok(ToolOutput::new(json!(["id", "email", "food"])))
    }
}

struct RunQuery;

#[async_trait]
impl Tool for RunQuery {
    fn name(&self) -> &str {
        "run_query"
    }
    fn description(&self) -> &str {
        "Run a SQL query. Args: {\"sql\": \"...\"}"
    }
    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let sql = args.get("sql").and_then(Value::as_str).unwrap_or_default();
        if sql.split_whitespace().any(|w| w == "foo") {
            return Err("ERROR 1054: unknown column 'foo' in 'field list'".to_string());
        }
        Ok(ToolOutput::new(json!([{ "food": "apple" }])).with_tokens(3, 5))
    }
}

struct AlwaysDown;

#[async_trait]
impl Tool for AlwaysDown {
    fn name(&self) -> &str {
        "always_down"
    }
    fn description(&self) -> &str {
        "Never succeeds."
    }
    async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
        Err("connection reset by peer".to_string())
    }
}

struct Slow;

#[async_trait]
impl Tool for Slow {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Takes a long time."
    }
    async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(ToolOutput::new(json!("done")))
    }
}

fn fast_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.executor.retry_backoff_ms = 1;
    cfg.executor.max_backoff_ms = 2;
    cfg
}

fn build(llm: Arc<MockLlmClient>, profiles: Vec<Profile>) -> Agent {
    Agent::builder(llm, Arc::new(StaticProfileService::new(profiles)))
        .with_config(fast_config())
        .with_tool(ListTables)
        .with_tool(ListColumns)
        .with_tool(RunQuery)
        .with_tool(AlwaysDown)
        .with_tool(Slow)
        .build()
        .unwrap()
}

fn planner_calls(trace: &[TraceEntry]) -> usize {
    trace
        .iter()
        .filter_map(TraceEntry::invocation)
        .filter(|e| {
            e.action.metadata.purpose == InvocationPurpose::Llm
                && e.action.target_name == "strategic_planner"
        })
        .count()
}

fn tool_attempts(trace: &[TraceEntry], phase_num: u32) -> usize {
    trace
        .iter()
        .filter_map(TraceEntry::invocation)
        .filter(|e| {
            e.action.metadata.purpose == InvocationPurpose::Tool
                && e.action.metadata.phase_num == Some(phase_num)
        })
        .count()
}

fn assert_contiguous(outcome: &hive::RunOutcome) {
    let plan = outcome.plan.as_ref().expect("plan");
    let nums: Vec<u32> = plan.phases().iter().map(|p| p.phase_num).collect();
    let expected: Vec<u32> = (1..=plan.len() as u32).collect();
    assert_eq!(nums, expected);
}

#[tokio::test]
async fn fresh_request_is_planned_and_stored() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", LIST_TABLES_PLAN));
    let agent = build(llm.clone(), vec![Profile::standalone("default")]);

    let outcome = agent
        .run(Request::new("list tables in database X"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    assert!(!outcome.fast_path);
    assert_contiguous(&outcome);
    let plan = outcome.plan.as_ref().unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.phases()[0].candidate_tools, vec!["list_tables"]);
    assert_eq!(planner_calls(&outcome.trace), 1);
    assert!(outcome.answer.unwrap().contains("users"));

    let case_id = outcome.champion_case_id.expect("case stored");
    let case = agent.champion_store().get(&case_id).await.unwrap().unwrap();
    assert!(!case.efficiency_flag);
    assert!(!case.hydrated);
    assert!(case.token_cost > 0);
    assert_eq!(
        case.plan_skeleton.phases()[0].arguments["database"],
        json!("{{database}}")
    );
}

#[tokio::test]
async fn identical_request_takes_fast_path() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", LIST_TABLES_PLAN));
    let agent = build(llm.clone(), vec![Profile::standalone("default")]);
    let request = Request::new("list tables in database X");

    let first = agent
        .run(request.clone(), CancellationToken::new(), None)
        .await
        .unwrap();
    let second = agent
        .run(request.clone(), CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(second.fast_path);
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.source_case_id, first.champion_case_id);
    assert_eq!(planner_calls(&second.trace), 0);
    assert_eq!(llm.calls("strategic_planner"), 1);
    assert_contiguous(&second);

    // 水合幂等：同一请求再次水合，计划结构一致
    let third = agent.run(request, CancellationToken::new(), None).await.unwrap();
    assert!(third.fast_path);
    assert_eq!(
        second.plan.as_ref().unwrap().shape(),
        third.plan.as_ref().unwrap().shape()
    );
    assert_eq!(first.plan.unwrap().shape(), third.plan.unwrap().shape());

    // 快速路径更省 token，因此被标为高效
    let hydrated_case = agent
        .champion_store()
        .get(second.champion_case_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(hydrated_case.hydrated);
    assert!(hydrated_case.efficiency_flag);
}

#[tokio::test]
async fn fast_path_hydrates_new_parameters() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", LIST_TABLES_PLAN));
    let agent = build(llm.clone(), vec![Profile::standalone("default")]);
    agent
        .run(Request::new("list tables in database X"), CancellationToken::new(), None)
        .await
        .unwrap();

    let request = Request::new("list tables in database X").with_parameter("database", "Z");
    let outcome = agent
        .run(request, CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(outcome.fast_path);
    assert_eq!(
        outcome.plan.unwrap().phases()[0].arguments["database"],
        json!("Z")
    );
}

#[tokio::test]
async fn changed_parameter_value_takes_fast_path() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", LIST_TABLES_PLAN));
    let agent = build(llm.clone(), vec![Profile::standalone("default")]);

    let first = agent
        .run(Request::new("list tables in database X"), CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(!first.fast_path);

    let second = agent
        .run(Request::new("list tables in database Y"), CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(second.fast_path);
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.source_case_id, first.champion_case_id);
    assert_eq!(llm.calls("strategic_planner"), 1);
    assert_eq!(
        second.plan.as_ref().unwrap().phases()[0].arguments["database"],
        json!("Y")
    );
    assert!(second.answer.unwrap().contains("\"Y\""));
}

#[tokio::test]
async fn unknown_column_is_corrected_via_lookup() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", QUERY_PLAN));
    let agent = build(llm, vec![Profile::standalone("default")]);
    let (tx, mut rx) = event_channel();

    let outcome = agent
        .run(Request::new("show the foo column of users"), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    let phase = &outcome.phases[0];
    assert_eq!(phase.state, PhaseState::Completed);
    assert_eq!(phase.attempts, 2);
    assert_eq!(tool_attempts(&outcome.trace, 1), 2);

    let lookups: Vec<_> = outcome
        .trace
        .iter()
        .filter_map(TraceEntry::invocation)
        .filter(|e| e.action.metadata.purpose == InvocationPurpose::Lookup)
        .collect();
    assert_eq!(lookups.len(), 1);
    assert_eq!(lookups[0].action.target_name, "list_columns");

    let last_tool = outcome
        .trace
        .iter()
        .filter_map(TraceEntry::invocation)
        .filter(|e| e.action.metadata.purpose == InvocationPurpose::Tool)
        .last()
        .unwrap();
    assert_eq!(last_tool.action.arguments["sql"], json!("SELECT food FROM users"));

    let mut recoveries = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if let RunEvent::Recovery { kind, action, .. } = envelope.event {
            recoveries.push((kind, action));
        }
    }
    assert_eq!(
        recoveries,
        vec![("schema_mismatch_column".to_string(), "lookup_and_retry".to_string())]
    );
}

#[tokio::test]
async fn retries_never_exceed_budget() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", FLAKY_PLAN));
    let agent = build(
        llm,
        vec![Profile::standalone("default").with_max_retries(2)],
    );

    let outcome = agent
        .run(Request::new("ping the service"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error_kind, Some(ErrorKind::BudgetExceeded));
    assert_eq!(tool_attempts(&outcome.trace, 1), 3);
    let classification = outcome.phases[0].classification.as_ref().unwrap();
    assert_eq!(classification.kind, ErrorKind::BudgetExceeded);
    assert_eq!(
        classification.context.get("last_kind").map(String::as_str),
        Some("transient")
    );
    assert!(outcome.champion_case_id.is_none());
}

#[tokio::test]
async fn continue_on_failure_yields_partial() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", DEPENDENT_PLAN));
    let agent = build(
        llm,
        vec![Profile::standalone("default")
            .with_max_retries(1)
            .with_continue_on_phase_failure(true)],
    );

    let outcome = agent
        .run(Request::new("ping the service then list tables"), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Partial);
    let states: Vec<(u32, PhaseState, Option<SkipReason>)> = outcome
        .phases
        .iter()
        .map(|p| (p.phase_num, p.state, p.skip_reason.clone()))
        .collect();
    assert_eq!(
        states,
        vec![
            (1, PhaseState::FailedFinal, None),
            (2, PhaseState::Completed, None),
            (3, PhaseState::Skipped, Some(SkipReason::DependencyUnmet { phase: 1 })),
        ]
    );
    assert_eq!(tool_attempts(&outcome.trace, 1), 2);
    assert_eq!(tool_attempts(&outcome.trace, 3), 0);

    let ends: Vec<(u32, PhaseEndStatus)> = outcome
        .trace
        .iter()
        .filter_map(|e| match e {
            TraceEntry::PhaseEnd { phase_num, status, .. } => Some((*phase_num, *status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        ends,
        vec![
            (1, PhaseEndStatus::Failed),
            (2, PhaseEndStatus::Completed),
            (3, PhaseEndStatus::Skipped),
        ]
    );
    assert!(outcome.answer.unwrap().contains("users"));
    assert!(outcome.champion_case_id.is_none());
}

#[tokio::test]
async fn cancellation_skips_remaining_phases() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", SLOW_PLAN));
    let agent = build(llm, vec![Profile::standalone("default")]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = agent
        .run(Request::new("wait then list tables"), cancel, None)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(outcome.phases[0].error_kind(), Some(ErrorKind::Cancelled));
    for phase in &outcome.phases[1..] {
        assert_eq!(phase.state, PhaseState::Skipped);
        assert_eq!(phase.skip_reason, Some(SkipReason::Cancelled));
    }
    assert!(outcome.trace.last().unwrap().is_cancelled());
    assert!(outcome.champion_case_id.is_none());
}

#[tokio::test]
async fn run_complete_event_carries_status() {
    let llm = Arc::new(MockLlmClient::new().respond("strategic_planner", LIST_TABLES_PLAN));
    let agent = build(llm, vec![Profile::standalone("default")]);
    let (tx, mut rx) = event_channel();

    let outcome = agent
        .run(Request::new("list tables in database X"), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(envelope) = rx.recv().await {
        assert_eq!(envelope.session_id, outcome.session_id);
        assert_eq!(envelope.execution_depth, 0);
        events.push(envelope);
    }
    assert!(matches!(events.first().unwrap().event, RunEvent::PhaseStart { phase_num: 1, .. }));
    assert_eq!(
        events.last().unwrap().event,
        RunEvent::RunComplete {
            status: "success".to_string(),
            fast_path: false
        }
    );
    assert!(events.windows(2).all(|w| w[0].cursor <= w[1].cursor));
}
