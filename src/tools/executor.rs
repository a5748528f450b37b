//! 工具执行器
//!
//! 持有 CapabilityRegistry 与默认超时；invoke(name, args, timeout) 在超时内调用工具，
//! 未注册 / 超时 / 失败分别转为 AgentError（ToolNotFound / ToolTimeout / ToolExecutionFailed）；
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{CapabilityRegistry, ToolOutput};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<CapabilityRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// invoke(name, arguments, timeout)；timeout 为 None 时使用默认值
    pub async fn invoke(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        limit: Option<Duration>,
    ) -> Result<ToolOutput, AgentError> {
        let tool = self
            .registry
            .resolve(tool_name)
            .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(limit.unwrap_or(self.timeout), tool.execute(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e)),
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ToolOutput::new(json!("late")))
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = CapabilityRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool);
        ToolExecutor::new(Arc::new(registry), 5)
    }

    #[tokio::test]
    async fn test_invoke_ok() {
        let out = executor()
            .invoke("echo", json!({"text": "hi"}), None)
            .await
            .unwrap();
        assert_eq!(out.payload, json!("hi"));
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let err = executor().invoke("nope", json!({}), None).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        let err = executor()
            .invoke("slow", json!({}), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout(_)));
    }
}
