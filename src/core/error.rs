//! 错误类型、错误分类与恢复动作
//!
//! AgentError 为运行期错误；SelfCorrectionEngine 将其归类为 ErrorKind，并给出 RecoveryAction。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 运行过程中可能出现的错误（工具、计划、LLM、会话链接、存储等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Session link rejected: {0}")]
    LinkRejected(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 错误分类（决定恢复策略）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 未知字段名
    SchemaMismatchColumn,
    /// 未知表 / 集合名
    SchemaMismatchTable,
    /// 可重试
    Transient,
    /// 配置或计划错误，不重试
    FatalConfig,
    /// 用户 / 系统取消，不重试
    Cancelled,
    /// 超时或重试预算耗尽
    BudgetExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaMismatchColumn => "schema_mismatch_column",
            ErrorKind::SchemaMismatchTable => "schema_mismatch_table",
            ErrorKind::Transient => "transient",
            ErrorKind::FatalConfig => "fatal_config",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BudgetExceeded => "budget_exceeded",
        }
    }

    /// 是否允许进入重试子循环
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::SchemaMismatchColumn | ErrorKind::SchemaMismatchTable | ErrorKind::Transient
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次失败的结构化分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    /// 结构化上下文，如 identifier（出错的列名 / 表名）、message
    pub context: BTreeMap<String, String>,
    pub attempt_number: u32,
}

impl ErrorClassification {
    pub fn new(kind: ErrorKind, attempt_number: u32) -> Self {
        Self {
            kind,
            context: BTreeMap::new(),
            attempt_number,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn identifier(&self) -> Option<&str> {
        self.context.get("identifier").map(String::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.context.get("message").map(String::as_str)
    }
}

/// 自我纠错引擎根据分类给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 调用查询工具获取合法名称集合后，用修正后的参数重试
    LookupAndRetry { lookup_tool: Option<String> },
    /// 退避后原样重试
    RetryAfter(Duration),
    /// 不再重试，阶段进入最终失败
    Abort,
}
