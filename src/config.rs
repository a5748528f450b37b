//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__PLANNER__TOP_K=3`）。
//! 各段缺省时取 Default 实现中的值。

use std::path::PathBuf;

use serde::Deserialize;

use crate::planning::TieBreak;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub planner: PlannerSection,
    pub executor: ExecutorSection,
    pub genie: GenieSection,
    pub links: LinksSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 配置档 TOML；未设置时依次查找 config/profiles.toml、../config/profiles.toml
    pub profiles_path: Option<PathBuf>,
    /// 请求未指定 profile 时使用
    pub default_profile: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            profiles_path: None,
            default_profile: "default".to_string(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// deepseek / openai / mock；无 API Key 时退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次补全超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [embedding] 段：请求指纹的嵌入后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    /// hashing（本地）/ openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub dimensions: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: None,
            dimensions: 256,
        }
    }
}

/// [planner] 段：指纹匹配、计划水合与规划
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 召回冠军案例的最低相似度
    pub relevance_threshold: f32,
    /// 走快速路径的最低相似度
    pub hydration_threshold: f32,
    pub top_k: usize,
    /// 规划指令中最多附带的 few-shot 案例
    pub max_champion_examples: usize,
    pub store_timeout_ms: u64,
    /// 相似度、效率标记、token 成本都相同时的最终排序
    pub tie_break: TieBreak,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.75,
            hydration_threshold: 0.92,
            top_k: 5,
            max_champion_examples: 3,
            store_timeout_ms: 2000,
            tie_break: TieBreak::default(),
        }
    }
}

/// [executor] 段：重试、超时与纠错
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_retries: u32,
    pub tool_timeout_secs: u64,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub loop_fan_out: usize,
    pub continue_on_phase_failure: bool,
    pub column_lookup_tool: String,
    pub table_lookup_tool: String,
    /// 最终答案是否再经一次补全汇总；否则直接取最后一个完成阶段的结果
    pub summarize_answer: bool,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            tool_timeout_secs: 30,
            retry_backoff_ms: 250,
            max_backoff_ms: 5000,
            loop_fan_out: 4,
            continue_on_phase_failure: false,
            column_lookup_tool: "list_columns".to_string(),
            table_lookup_tool: "list_tables".to_string(),
            summarize_answer: false,
        }
    }
}

/// [genie] 段：协调者
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenieSection {
    pub max_parallel_children: usize,
    pub max_nesting_depth: u32,
}

impl Default for GenieSection {
    fn default() -> Self {
        Self {
            max_parallel_children: 2,
            max_nesting_depth: 4,
        }
    }
}

/// [links] 段：会话链接持久化；未设置 sqlite_path 时仅保存在内存
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinksSection {
    pub sqlite_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 配置档文件位置：显式配置优先，否则查找默认位置
pub fn resolve_profiles_path(cfg: &AppConfig) -> Option<PathBuf> {
    if let Some(path) = &cfg.app.profiles_path {
        return Some(path.clone());
    }
    ["config/profiles.toml", "../config/profiles.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}
