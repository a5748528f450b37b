//! 计划 JSON Schema 生成（schemars）
//!
//! 将「合法计划」的 JSON 结构注入规划指令，减少 LLM 输出格式错误。

use schemars::schema_for;

use crate::plan::parse::RawPlan;

/// 返回计划格式的 JSON Schema 字符串，可拼入 system prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(RawPlan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
