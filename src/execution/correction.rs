//! 自我纠错引擎
//!
//! 阶段失败时：按已知的 schema 错误形态归类（未知字段 → schema_mismatch_column，
//! 未知表 / 集合 → schema_mismatch_table；权限 / 凭据被拒 → fatal_config），其余默认为 transient；
//! 再按类别给出恢复动作。重试预算按阶段全局共享，不区分错误类别。

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::core::{AgentError, ErrorClassification, ErrorKind, RecoveryAction};
use crate::llm::LlmError;

/// 纠正标识符时要求的最低 Jaro-Winkler 相似度
const MIN_NAME_SIMILARITY: f64 = 0.5;

fn column_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r#"(?i)unknown column\s+['"`]?([\w.]+)['"`]?"#,
            r#"(?i)no such column:?\s+['"`]?([\w.]+)"#,
            r#"(?i)column\s+['"`]([\w.]+)['"`]\s+does not exist"#,
            r#"(?i)unknown (?:field|attribute)\s+['"`]?([\w.]+)"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn table_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r#"(?i)unknown (?:table|collection)\s+['"`]?([\w.]+)"#,
            r#"(?i)no such (?:table|collection):?\s+['"`]?([\w.]+)"#,
            r#"(?i)(?:relation|table|collection)\s+['"`]([\w.]+)['"`]\s+(?:does not exist|doesn't exist|not found)"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 权限或凭据错误：重试不会改变结果
fn access_denied_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)permission denied|access denied|unauthori[sz]ed|forbidden|authentication failed|invalid (?:api )?key")
            .expect("valid access pattern")
    })
}

fn match_identifier(patterns: &[Regex], message: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures(message).map(|cap| {
            // db.table / alias.column 只保留最后一段
            let raw = &cap[1];
            raw.rsplit('.').next().unwrap_or(raw).to_string()
        })
    })
}

/// 纠错引擎配置
#[derive(Debug, Clone)]
pub struct CorrectionPolicy {
    pub column_lookup_tool: String,
    pub table_lookup_tool: String,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CorrectionPolicy {
    fn default() -> Self {
        Self {
            column_lookup_tool: "list_columns".to_string(),
            table_lookup_tool: "list_tables".to_string(),
            retry_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelfCorrectionEngine {
    policy: CorrectionPolicy,
}

impl SelfCorrectionEngine {
    pub fn new(policy: CorrectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CorrectionPolicy {
        &self.policy
    }

    /// 归类一次失败。可重试类别在预算耗尽（retries_left == 0）时转为 budget_exceeded，
    /// 原类别记录在 context.last_kind。
    pub fn classify(&self, error: &AgentError, attempt: u32, retries_left: u32) -> ErrorClassification {
        let message = error.to_string();
        let base = match error {
            AgentError::Cancelled => ErrorClassification::new(ErrorKind::Cancelled, attempt),
            AgentError::ToolNotFound(_)
            | AgentError::PlanRejected(_)
            | AgentError::ConfigError(_)
            | AgentError::LinkRejected(_) => ErrorClassification::new(ErrorKind::FatalConfig, attempt),
            AgentError::ToolTimeout(_) | AgentError::Llm(LlmError::Timeout) => {
                ErrorClassification::new(ErrorKind::Transient, attempt).with("timeout", "true")
            }
            AgentError::ToolExecutionFailed(msg) if access_denied_pattern().is_match(msg) => {
                ErrorClassification::new(ErrorKind::FatalConfig, attempt)
            }
            AgentError::ToolExecutionFailed(msg) => {
                if let Some(id) = match_identifier(column_patterns(), msg) {
                    ErrorClassification::new(ErrorKind::SchemaMismatchColumn, attempt).with("identifier", id)
                } else if let Some(id) = match_identifier(table_patterns(), msg) {
                    ErrorClassification::new(ErrorKind::SchemaMismatchTable, attempt).with("identifier", id)
                } else {
                    ErrorClassification::new(ErrorKind::Transient, attempt)
                }
            }
            AgentError::Llm(_) | AgentError::Store(_) | AgentError::Synthesis(_) => {
                ErrorClassification::new(ErrorKind::Transient, attempt)
            }
        }
        .with("message", message);

        if base.kind.is_retryable() && retries_left == 0 {
            let mut exhausted = ErrorClassification::new(ErrorKind::BudgetExceeded, attempt)
                .with("last_kind", base.kind.as_str());
            exhausted.context.extend(base.context);
            return exhausted;
        }
        base
    }

    /// 恢复动作
    pub fn recovery_for(&self, classification: &ErrorClassification) -> RecoveryAction {
        match classification.kind {
            ErrorKind::SchemaMismatchColumn => RecoveryAction::LookupAndRetry {
                lookup_tool: Some(self.policy.column_lookup_tool.clone()),
            },
            ErrorKind::SchemaMismatchTable => RecoveryAction::LookupAndRetry {
                lookup_tool: Some(self.policy.table_lookup_tool.clone()),
            },
            ErrorKind::Transient => RecoveryAction::RetryAfter(self.backoff(classification.attempt_number)),
            ErrorKind::FatalConfig | ErrorKind::Cancelled | ErrorKind::BudgetExceeded => {
                RecoveryAction::Abort
            }
        }
    }

    /// 指数退避：base * 2^(attempt-1)，上限 max_backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.policy.retry_backoff.saturating_mul(1u32 << shift);
        delay.min(self.policy.max_backoff)
    }

    /// 不做查询时重试前的等待；Abort 返回 None。
    /// 纠错动作在没有查询能力的调用方（补全服务）处退化为普通退避
    pub fn retry_delay(&self, action: &RecoveryAction, attempt: u32) -> Option<Duration> {
        match action {
            RecoveryAction::RetryAfter(delay) => Some(*delay),
            RecoveryAction::LookupAndRetry { .. } => Some(self.backoff(attempt)),
            RecoveryAction::Abort => None,
        }
    }

    /// 用查询结果纠正参数：选出与出错标识符最接近的合法名称，整词替换所有字符串参数。
    /// 找不到更合适的名称时返回 None。
    pub fn correct_arguments(
        &self,
        arguments: &Value,
        classification: &ErrorClassification,
        lookup_payload: &Value,
    ) -> Option<(Value, String)> {
        let identifier = classification.identifier()?;
        let names = valid_names(lookup_payload);
        let replacement = closest_name(identifier, &names)?;
        if replacement == identifier {
            return None;
        }
        let re = Regex::new(&format!(r"\b{}\b", regex::escape(identifier))).ok()?;
        let corrected = replace_identifier(arguments, &re, &replacement);
        if &corrected == arguments {
            return None;
        }
        tracing::info!(from = identifier, to = %replacement, "identifier corrected");
        Some((corrected, replacement))
    }
}

/// 从查询工具的输出中取出名称集合：字符串数组、带 name 字段的对象数组、
/// {"columns"|"tables"|"names": [...]}，或逗号 / 换行分隔的文本
pub fn valid_names(payload: &Value) -> Vec<String> {
    match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => ["name", "column_name", "table_name"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(String::from),
                _ => None,
            })
            .collect(),
        Value::Object(map) => ["columns", "tables", "collections", "names"]
            .iter()
            .find_map(|k| map.get(*k))
            .map(valid_names)
            .unwrap_or_default(),
        Value::String(text) => text
            .split(|c: char| c == ',' || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// 最接近的名称：忽略大小写的精确匹配优先，否则取 Jaro-Winkler 最高者
pub fn closest_name(identifier: &str, names: &[String]) -> Option<String> {
    if let Some(exact) = names.iter().find(|n| n.eq_ignore_ascii_case(identifier)) {
        return Some(exact.clone());
    }
    let needle = identifier.to_lowercase();
    names
        .iter()
        .map(|n| (n, strsim::jaro_winkler(&needle, &n.to_lowercase())))
        .filter(|(_, score)| *score >= MIN_NAME_SIMILARITY)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(n, _)| n.clone())
}

fn replace_identifier(value: &Value, re: &Regex, replacement: &str) -> Value {
    match value {
        Value::String(s) => Value::String(re.replace_all(s, regex::NoExpand(replacement)).into_owned()),
        Value::Array(items) => Value::Array(items.iter().map(|v| replace_identifier(v, re, replacement)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), replace_identifier(v, re, replacement)))
                .collect(),
        ),
        other => other.clone(),
    }
}
