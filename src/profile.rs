//! 配置档（Profile）服务：每个请求的运行角色、专家列表与策略覆盖
//!
//! 核心只读；档案文件为 TOML，格式：
//!
//! ```toml
//! [[profiles]]
//! id = "analyst"
//! role = "coordinator"
//! experts = ["sql", "docs"]
//! max_parallel_children = 2
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileRole {
    #[default]
    Standalone,
    Coordinator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: ProfileRole,
    /// 协调者的候选专家（profile id）
    #[serde(default)]
    pub experts: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub max_parallel_children: Option<usize>,
    #[serde(default)]
    pub relevance_threshold: Option<f32>,
    #[serde(default)]
    pub continue_on_phase_failure: Option<bool>,
    /// 为空表示不限制
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

impl Profile {
    pub fn standalone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            role: ProfileRole::Standalone,
            experts: Vec::new(),
            max_retries: None,
            max_parallel_children: None,
            relevance_threshold: None,
            continue_on_phase_failure: None,
            allowed_tools: Vec::new(),
        }
    }

    pub fn coordinator(id: impl Into<String>, experts: &[&str]) -> Self {
        Self {
            role: ProfileRole::Coordinator,
            experts: experts.iter().map(|e| e.to_string()).collect(),
            ..Self::standalone(id)
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_allowed_tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn with_continue_on_phase_failure(mut self, flag: bool) -> Self {
        self.continue_on_phase_failure = Some(flag);
        self
    }

    pub fn with_max_parallel_children(mut self, n: usize) -> Self {
        self.max_parallel_children = Some(n);
        self
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == ProfileRole::Coordinator
    }
}

/// 配置档来源
#[async_trait]
pub trait ProfileService: Send + Sync {
    async fn get(&self, profile_id: &str) -> Result<Option<Profile>, AgentError>;

    async fn list(&self) -> Result<Vec<Profile>, AgentError>;
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// 进程内配置档表（TOML 文件或代码构造）
#[derive(Default)]
pub struct StaticProfileService {
    profiles: RwLock<HashMap<String, Profile>>,
}

impl StaticProfileService {
    pub fn new(profiles: impl IntoIterator<Item = Profile>) -> Self {
        Self {
            profiles: RwLock::new(profiles.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, AgentError> {
        let file: ProfileFile =
            toml::from_str(text).map_err(|e| AgentError::ConfigError(format!("invalid profiles: {e}")))?;
        let mut seen = std::collections::HashSet::new();
        for profile in &file.profiles {
            if !seen.insert(profile.id.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "duplicate profile id: {}",
                    profile.id
                )));
            }
        }
        Ok(Self::new(file.profiles))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::ConfigError(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub async fn insert(&self, profile: Profile) {
        self.profiles.write().await.insert(profile.id.clone(), profile);
    }

    /// 移除配置档；调用方负责归档指向它的会话链接
    pub async fn remove(&self, profile_id: &str) -> Option<Profile> {
        self.profiles.write().await.remove(profile_id)
    }
}

#[async_trait]
impl ProfileService for StaticProfileService {
    async fn get(&self, profile_id: &str) -> Result<Option<Profile>, AgentError> {
        Ok(self.profiles.read().await.get(profile_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Profile>, AgentError> {
        let mut all: Vec<Profile> = self.profiles.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}
