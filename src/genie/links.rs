//! 会话链接登记：父会话委派子会话的审计记录
//!
//! 链接在派生子会话时创建，之后只发生状态迁移（active → completed | failed）；
//! 从不删除，专家配置被移除后软归档（archived），保留审计但不再展示。
//! 登记时做祖先检查：会话不能成为自己的祖先。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Completed,
    Failed,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Completed => "completed",
            LinkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LinkStatus::Active),
            "completed" => Some(LinkStatus::Completed),
            "failed" => Some(LinkStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLink {
    pub parent_session_id: String,
    pub child_session_id: String,
    pub child_profile_id: String,
    /// 同一父会话下从 1 开始单调递增
    pub execution_order: u32,
    /// 0 表示直接子会话
    pub nesting_level: u32,
    pub status: LinkStatus,
    pub archived: bool,
    pub created_at: i64,
}

/// 会话链接持久化接口
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// (parent, child) 重复时返回 LinkRejected
    async fn create_link(&self, link: SessionLink) -> Result<(), AgentError>;

    async fn update_status(&self, child_session_id: &str, status: LinkStatus) -> Result<(), AgentError>;

    async fn mark_archived(&self, child_session_id: &str) -> Result<(), AgentError>;

    /// 按 execution_order 升序
    async fn list_children(&self, parent_session_id: &str) -> Result<Vec<SessionLink>, AgentError>;

    /// 以 child_session_id 为子会话的链接
    async fn find_by_child(&self, child_session_id: &str) -> Result<Option<SessionLink>, AgentError>;

    async fn list_by_child_profile(&self, profile_id: &str) -> Result<Vec<SessionLink>, AgentError>;
}

/// 进程内实现
#[derive(Default)]
pub struct InMemoryLinkStore {
    links: RwLock<Vec<SessionLink>>,
}

impl InMemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LinkStore for InMemoryLinkStore {
    async fn create_link(&self, link: SessionLink) -> Result<(), AgentError> {
        let mut links = self.links.write().await;
        if links.iter().any(|l| {
            l.parent_session_id == link.parent_session_id && l.child_session_id == link.child_session_id
        }) {
            return Err(AgentError::LinkRejected(format!(
                "link {} -> {} already exists",
                link.parent_session_id, link.child_session_id
            )));
        }
        links.push(link);
        Ok(())
    }

    async fn update_status(&self, child_session_id: &str, status: LinkStatus) -> Result<(), AgentError> {
        let mut links = self.links.write().await;
        let link = links
            .iter_mut()
            .find(|l| l.child_session_id == child_session_id)
            .ok_or_else(|| AgentError::Store(format!("unknown child session: {child_session_id}")))?;
        link.status = status;
        Ok(())
    }

    async fn mark_archived(&self, child_session_id: &str) -> Result<(), AgentError> {
        let mut links = self.links.write().await;
        let link = links
            .iter_mut()
            .find(|l| l.child_session_id == child_session_id)
            .ok_or_else(|| AgentError::Store(format!("unknown child session: {child_session_id}")))?;
        link.archived = true;
        Ok(())
    }

    async fn list_children(&self, parent_session_id: &str) -> Result<Vec<SessionLink>, AgentError> {
        let mut children: Vec<SessionLink> = self
            .links
            .read()
            .await
            .iter()
            .filter(|l| l.parent_session_id == parent_session_id)
            .cloned()
            .collect();
        children.sort_by_key(|l| l.execution_order);
        Ok(children)
    }

    async fn find_by_child(&self, child_session_id: &str) -> Result<Option<SessionLink>, AgentError> {
        Ok(self
            .links
            .read()
            .await
            .iter()
            .find(|l| l.child_session_id == child_session_id)
            .cloned())
    }

    async fn list_by_child_profile(&self, profile_id: &str) -> Result<Vec<SessionLink>, AgentError> {
        Ok(self
            .links
            .read()
            .await
            .iter()
            .filter(|l| l.child_profile_id == profile_id)
            .cloned()
            .collect())
    }
}

/// 会话链接登记处：校验并分配 execution_order / nesting_level
pub struct SessionLinkRegistry {
    store: Arc<dyn LinkStore>,
    // 串行化登记，保证 execution_order 单调且祖先检查与写入之间没有竞争
    register_lock: Mutex<()>,
}

impl SessionLinkRegistry {
    pub fn new(store: Arc<dyn LinkStore>) -> Self {
        Self {
            store,
            register_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLinkStore::new()))
    }

    /// 会话的祖先链（父、祖父……），不含自身
    pub async fn ancestors(&self, session_id: &str) -> Result<Vec<String>, AgentError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = session_id.to_string();
        while let Some(link) = self.store.find_by_child(&current).await? {
            if !seen.insert(link.parent_session_id.clone()) {
                break;
            }
            chain.push(link.parent_session_id.clone());
            current = link.parent_session_id;
        }
        Ok(chain)
    }

    /// 登记父 → 子委派；子会话已出现在父会话的祖先链中（或就是父会话）时拒绝
    pub async fn register(
        &self,
        parent_session_id: &str,
        child_session_id: &str,
        child_profile_id: &str,
    ) -> Result<SessionLink, AgentError> {
        let _guard = self.register_lock.lock().await;

        if parent_session_id == child_session_id {
            return Err(AgentError::LinkRejected(format!(
                "session {child_session_id} cannot delegate to itself"
            )));
        }
        if self
            .ancestors(parent_session_id)
            .await?
            .iter()
            .any(|a| a == child_session_id)
        {
            return Err(AgentError::LinkRejected(format!(
                "session {child_session_id} is already an ancestor of {parent_session_id}"
            )));
        }
        if self.store.find_by_child(child_session_id).await?.is_some() {
            return Err(AgentError::LinkRejected(format!(
                "session {child_session_id} already has a parent"
            )));
        }

        let nesting_level = match self.store.find_by_child(parent_session_id).await? {
            Some(parent_link) => parent_link.nesting_level + 1,
            None => 0,
        };
        let execution_order = self
            .store
            .list_children(parent_session_id)
            .await?
            .iter()
            .map(|l| l.execution_order)
            .max()
            .unwrap_or(0)
            + 1;

        let link = SessionLink {
            parent_session_id: parent_session_id.to_string(),
            child_session_id: child_session_id.to_string(),
            child_profile_id: child_profile_id.to_string(),
            execution_order,
            nesting_level,
            status: LinkStatus::Active,
            archived: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.store.create_link(link.clone()).await?;
        tracing::info!(
            parent = parent_session_id,
            child = child_session_id,
            profile = child_profile_id,
            execution_order,
            nesting_level,
            "session link registered"
        );
        Ok(link)
    }

    /// 只允许 active → completed | failed
    pub async fn finish(&self, child_session_id: &str, status: LinkStatus) -> Result<(), AgentError> {
        let link = self
            .store
            .find_by_child(child_session_id)
            .await?
            .ok_or_else(|| AgentError::Store(format!("unknown child session: {child_session_id}")))?;
        if link.status != LinkStatus::Active || status == LinkStatus::Active {
            return Err(AgentError::LinkRejected(format!(
                "invalid link transition {} -> {}",
                link.status.as_str(),
                status.as_str()
            )));
        }
        self.store.update_status(child_session_id, status).await
    }

    /// 专家配置被移除：软归档所有指向该配置的链接，返回归档数量
    pub async fn archive_profile(&self, profile_id: &str) -> Result<usize, AgentError> {
        let links = self.store.list_by_child_profile(profile_id).await?;
        let mut archived = 0;
        for link in links.iter().filter(|l| !l.archived) {
            self.store.mark_archived(&link.child_session_id).await?;
            archived += 1;
        }
        Ok(archived)
    }

    /// 全部子链接（含已归档，用于审计）
    pub async fn list_children(&self, parent_session_id: &str) -> Result<Vec<SessionLink>, AgentError> {
        self.store.list_children(parent_session_id).await
    }

    /// 用于展示的子链接（隐藏已归档）
    pub async fn visible_children(&self, parent_session_id: &str) -> Result<Vec<SessionLink>, AgentError> {
        Ok(self
            .store
            .list_children(parent_session_id)
            .await?
            .into_iter()
            .filter(|l| !l.archived)
            .collect())
    }

    pub async fn link_of(&self, child_session_id: &str) -> Result<Option<SessionLink>, AgentError> {
        self.store.find_by_child(child_session_id).await
    }
}
