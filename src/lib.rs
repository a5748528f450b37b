//! Hive - 计划复用、自我纠错与多专家协同的智能体核心
//!
//! 模块划分：
//! - **agent**: 端到端流水线（匹配 → 水合 / 规划 → 执行 → 入库）与 AgentBuilder
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、会话监管（取消）、任务调度（并发上限）
//! - **execution**: 事件、执行轨迹、自我纠错、战术执行器
//! - **genie**: 协调者、会话链接登记与持久化
//! - **llm**: 文本补全抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、嵌入、分词
//! - **plan**: 计划类型、严格解析与校验、参数占位符
//! - **planning**: 冠军案例、指纹匹配、计划水合、战略规划器
//! - **profile**: 配置档服务
//! - **tools**: 能力注册表与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod execution;
pub mod genie;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod planning;
pub mod profile;
pub mod tools;

pub use agent::{Agent, AgentBuilder, ChildOutcome, Request, RunOutcome, RunStatus};
