//! 指纹匹配：请求 → 向量 → 冠军案例近邻
//!
//! 无副作用；嵌入失败、存储失败、超时或取消都降级为「无匹配」，不阻塞流水线。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::llm::EmbeddingProvider;
use crate::planning::champion::{ChampionStore, ScoredCase};

/// 匹配结果：请求指纹（供之后写入新案例）与阈值以上的候选
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub fingerprint: Vec<f32>,
    pub candidates: Vec<ScoredCase>,
}

impl MatchOutcome {
    pub fn best(&self) -> Option<&ScoredCase> {
        self.candidates.first()
    }
}

pub struct FingerprintMatcher {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn ChampionStore>,
    relevance_threshold: f32,
    top_k: usize,
    store_timeout: Duration,
}

impl FingerprintMatcher {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn ChampionStore>) -> Self {
        Self {
            embedder,
            store,
            relevance_threshold: 0.75,
            top_k: 5,
            store_timeout: Duration::from_millis(2000),
        }
    }

    pub fn with_relevance_threshold(mut self, threshold: f32) -> Self {
        self.relevance_threshold = threshold;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_store_timeout(mut self, limit: Duration) -> Self {
        self.store_timeout = limit;
        self
    }

    pub fn relevance_threshold(&self) -> f32 {
        self.relevance_threshold
    }

    pub async fn fingerprint(&self, request: &str) -> Option<Vec<f32>> {
        match timeout(self.store_timeout, self.embedder.embed(request)).await {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "embedding failed, treating as no match");
                None
            }
            Err(_) => {
                tracing::warn!("embedding timed out, treating as no match");
                None
            }
        }
    }

    /// 查询近邻；threshold 为 None 时使用默认相关度阈值（配置可按 profile 覆盖）。
    /// cancel 触发后不再调用嵌入或存储，直接返回空结果
    pub async fn find(
        &self,
        request: &str,
        profile_id: &str,
        threshold: Option<f32>,
        cancel: &CancellationToken,
    ) -> MatchOutcome {
        if cancel.is_cancelled() {
            return MatchOutcome::default();
        }
        let fingerprint = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            fp = self.fingerprint(request) => fp,
        };
        let Some(fingerprint) = fingerprint else {
            return MatchOutcome::default();
        };
        let threshold = threshold.unwrap_or(self.relevance_threshold);
        let lookup = self
            .store
            .find_nearest(profile_id, &fingerprint, threshold, self.top_k);
        let candidates = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(profile = profile_id, "fingerprint lookup cancelled");
                return MatchOutcome::default();
            }
            looked_up = timeout(self.store_timeout, lookup) => match looked_up {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "champion store unavailable, treating as no match");
                    Vec::new()
                }
                Err(_) => {
                    tracing::warn!("champion store timed out, treating as no match");
                    Vec::new()
                }
            },
        };
        tracing::debug!(
            profile = profile_id,
            matches = candidates.len(),
            best = candidates.first().map(|c| c.similarity),
            "fingerprint lookup"
        );
        MatchOutcome {
            fingerprint,
            candidates,
        }
    }
}
