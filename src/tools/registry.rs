//! 能力注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 CapabilityRegistry 按名注册与解析；
//! 同时登记可复用的提示指令（executable directive）。注册完成后只读，可被多次运行并发读取。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// 工具输出：负载与 token 用量（不消耗 token 的工具保持 0）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub payload: Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ToolOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }
}

/// 工具 trait：名称、描述（供规划器理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 能力描述（写入规划指令）
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 能力注册表：工具与提示指令
#[derive(Default)]
pub struct CapabilityRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    directives: HashMap<String, String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// 登记可复用的提示指令（模板文本）
    pub fn register_directive(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.directives.insert(name.into(), template.into());
    }

    /// resolve(name) -> invocable | not_found
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn directive(&self, name: &str) -> Option<&str> {
        self.directives.get(name).map(String::as_str)
    }

    pub fn has_directive(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    /// 排序后的工具名（保证规划指令稳定）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn directive_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.directives.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具描述列表；allowed 非空时只返回白名单内的工具
    pub fn descriptors(&self, allowed: &[String]) -> Vec<CapabilityDescriptor> {
        self.tool_names()
            .into_iter()
            .filter(|n| allowed.is_empty() || allowed.contains(n))
            .filter_map(|n| {
                self.tools.get(&n).map(|tool| CapabilityDescriptor {
                    name: n.clone(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                })
            })
            .collect()
    }

    /// 工具 schema JSON，拼入规划指令
    pub fn to_schema_json(&self, allowed: &[String]) -> String {
        serde_json::to_string_pretty(&self.descriptors(allowed)).unwrap_or_else(|_| "[]".to_string())
    }
}
