//! 冠军案例（成功运行的计划骨架）与其存储
//!
//! 存储为读多写少：外层 RwLock 只保护索引，每个案例自带锁，
//! 反馈分更新只锁定单个案例，不阻塞其他案例的读取。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::llm::cosine_similarity;
use crate::llm::tokenizer::normalize_request;
use crate::plan::Plan;

/// 一次成功运行沉淀下来的可复用计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionCase {
    pub case_id: String,
    pub profile_id: String,
    pub request_text: String,
    pub request_fingerprint: Vec<f32>,
    /// 参数已替换为 {{param}} 的计划
    pub plan_skeleton: Plan,
    /// 比同类未水合运行更省 token
    pub efficiency_flag: bool,
    /// -1 / 0 / 1，由外部反馈更新
    pub feedback_score: i8,
    pub token_cost: u64,
    /// 是否来自快速路径（水合）运行
    pub hydrated: bool,
    pub created_at: i64,
}

impl ChampionCase {
    pub fn new(
        profile_id: impl Into<String>,
        request_text: impl Into<String>,
        request_fingerprint: Vec<f32>,
        plan_skeleton: Plan,
        token_cost: u64,
        hydrated: bool,
    ) -> Self {
        Self {
            case_id: uuid::Uuid::new_v4().to_string(),
            profile_id: profile_id.into(),
            request_text: request_text.into(),
            request_fingerprint,
            plan_skeleton,
            efficiency_flag: false,
            feedback_score: 0,
            token_cost,
            hydrated,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 等价键：同一配置 + 归一化后的请求文本
    fn equivalence_key(&self) -> (String, String) {
        (self.profile_id.clone(), normalize_request(&self.request_text))
    }
}

/// 近邻查询结果
#[derive(Debug, Clone)]
pub struct ScoredCase {
    pub case: ChampionCase,
    pub similarity: f32,
}

/// 冠军案例存储接口
#[async_trait]
pub trait ChampionStore: Send + Sync {
    /// 相似度 ≥ threshold 的近邻，按相似度降序，最多 limit 条；feedback_score 为 -1 的案例不参与匹配
    async fn find_nearest(
        &self,
        profile_id: &str,
        fingerprint: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredCase>, AgentError>;

    async fn upsert(&self, case: ChampionCase) -> Result<(), AgentError>;

    async fn update_feedback(&self, case_id: &str, score: i8) -> Result<(), AgentError>;

    async fn get(&self, case_id: &str) -> Result<Option<ChampionCase>, AgentError>;
}

/// 进程内存储
#[derive(Default)]
pub struct InMemoryChampionStore {
    cases: RwLock<HashMap<String, Arc<RwLock<ChampionCase>>>>,
}

impl InMemoryChampionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.cases.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cases.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<ChampionCase> {
        let handles: Vec<_> = self.cases.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.read().await.clone());
        }
        out.sort_by_key(|c| c.created_at);
        out
    }

    /// 重新计算等价案例的 efficiency_flag：
    /// 水合运行且比最便宜的非水合等价运行更省才为 true
    async fn recompute_efficiency(&self, key: &(String, String)) {
        let handles: Vec<_> = self.cases.read().await.values().cloned().collect();
        let mut equivalents = Vec::new();
        for handle in handles {
            let case = handle.read().await;
            if &case.equivalence_key() == key {
                equivalents.push((handle.clone(), case.hydrated, case.token_cost));
            }
        }
        let baseline = equivalents
            .iter()
            .filter(|(_, hydrated, _)| !hydrated)
            .map(|(_, _, cost)| *cost)
            .min();
        for (handle, hydrated, cost) in equivalents {
            let efficient = hydrated && baseline.map(|b| cost < b).unwrap_or(false);
            let mut case = handle.write().await;
            if case.efficiency_flag != efficient {
                tracing::debug!(case_id = %case.case_id, efficient, "efficiency flag recomputed");
                case.efficiency_flag = efficient;
            }
        }
    }
}

#[async_trait]
impl ChampionStore for InMemoryChampionStore {
    async fn find_nearest(
        &self,
        profile_id: &str,
        fingerprint: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredCase>, AgentError> {
        let handles: Vec<_> = self.cases.read().await.values().cloned().collect();
        let mut scored = Vec::new();
        for handle in handles {
            let case = handle.read().await;
            if case.profile_id != profile_id || case.feedback_score < 0 {
                continue;
            }
            let similarity = cosine_similarity(fingerprint, &case.request_fingerprint);
            if similarity >= threshold {
                scored.push(ScoredCase {
                    case: case.clone(),
                    similarity,
                });
            }
        }
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(limit.max(1));
        Ok(scored)
    }

    async fn upsert(&self, case: ChampionCase) -> Result<(), AgentError> {
        let key = case.equivalence_key();
        {
            let mut cases = self.cases.write().await;
            match cases.get(&case.case_id) {
                Some(existing) => *existing.write().await = case,
                None => {
                    cases.insert(case.case_id.clone(), Arc::new(RwLock::new(case)));
                }
            }
        }
        self.recompute_efficiency(&key).await;
        Ok(())
    }

    async fn update_feedback(&self, case_id: &str, score: i8) -> Result<(), AgentError> {
        if !(-1..=1).contains(&score) {
            return Err(AgentError::Store(format!(
                "feedback score must be -1, 0 or 1, got {score}"
            )));
        }
        let handle = self
            .cases
            .read()
            .await
            .get(case_id)
            .cloned()
            .ok_or_else(|| AgentError::Store(format!("unknown champion case: {case_id}")))?;
        handle.write().await.feedback_score = score;
        Ok(())
    }

    async fn get(&self, case_id: &str) -> Result<Option<ChampionCase>, AgentError> {
        let handle = self.cases.read().await.get(case_id).cloned();
        match handle {
            Some(h) => Ok(Some(h.read().await.clone())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Phase;

    fn case(request: &str, cost: u64, hydrated: bool) -> ChampionCase {
        ChampionCase::new(
            "default",
            request,
            vec![1.0, 0.0],
            Plan::new(vec![Phase::tool_call(1, "g", &["echo"])]),
            cost,
            hydrated,
        )
    }

    #[tokio::test]
    async fn test_first_case_is_not_efficient() {
        let store = InMemoryChampionStore::new();
        let first = case("list tables in database X", 100, false);
        let id = first.case_id.clone();
        store.upsert(first).await.unwrap();
        assert!(!store.get(&id).await.unwrap().unwrap().efficiency_flag);
    }

    #[tokio::test]
    async fn test_cheaper_hydrated_run_is_efficient() {
        let store = InMemoryChampionStore::new();
        store.upsert(case("list tables in database X", 100, false)).await.unwrap();
        let hydrated = case("List tables in database X", 20, true);
        let id = hydrated.case_id.clone();
        store.upsert(hydrated).await.unwrap();
        assert!(store.get(&id).await.unwrap().unwrap().efficiency_flag);

        let pricier = case("list tables in database X", 500, true);
        let pricier_id = pricier.case_id.clone();
        store.upsert(pricier).await.unwrap();
        assert!(!store.get(&pricier_id).await.unwrap().unwrap().efficiency_flag);
    }

    #[tokio::test]
    async fn test_feedback_bounds_and_exclusion() {
        let store = InMemoryChampionStore::new();
        let c = case("q", 10, false);
        let id = c.case_id.clone();
        store.upsert(c).await.unwrap();

        assert!(store.update_feedback(&id, 2).await.is_err());
        assert!(store.update_feedback("missing", 1).await.is_err());

        let hits = store.find_nearest("default", &[1.0, 0.0], 0.5, 5).await.unwrap();
        assert_eq!(hits.len(), 1);

        store.update_feedback(&id, -1).await.unwrap();
        let hits = store.find_nearest("default", &[1.0, 0.0], 0.5, 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_find_nearest_filters_profile_and_threshold() {
        let store = InMemoryChampionStore::new();
        store.upsert(case("q", 10, false)).await.unwrap();
        assert!(store.find_nearest("other", &[1.0, 0.0], 0.5, 5).await.unwrap().is_empty());
        assert!(store.find_nearest("default", &[0.0, 1.0], 0.5, 5).await.unwrap().is_empty());
    }
}
