//! 计划水合：复用冠军案例的计划骨架（快速路径）或回退到完整规划
//!
//! 相似度 ≥ hydration_threshold 且骨架中的所有请求参数占位符都能由当前请求解析时，
//! 直接产出水合后的计划；同分时依次比较 efficiency_flag、token_cost 与可配置的 TieBreak。

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{
    placeholder, placeholders_in, substitute, validate_plan, Arguments, PlaceholderRef, Plan,
};
use crate::planning::champion::ScoredCase;
use crate::tools::CapabilityRegistry;

/// 请求参数（名称 → 值）
pub type Parameters = BTreeMap<String, String>;

/// 相似度、效率、成本都相同时的最终排序规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// 反馈分高者优先，其次较新者
    #[default]
    Feedback,
    Newest,
    Oldest,
}

/// 水合决策
#[derive(Debug, Clone)]
pub enum HydrationDecision {
    FastPath {
        plan: Plan,
        case_id: String,
        similarity: f32,
    },
    FullPlanning {
        reason: String,
    },
}

impl HydrationDecision {
    pub fn is_fast_path(&self) -> bool {
        matches!(self, HydrationDecision::FastPath { .. })
    }
}

pub struct PlanHydrator {
    hydration_threshold: f32,
    tie_break: TieBreak,
}

impl PlanHydrator {
    pub fn new(hydration_threshold: f32, tie_break: TieBreak) -> Self {
        Self {
            hydration_threshold,
            tie_break,
        }
    }

    pub fn hydration_threshold(&self) -> f32 {
        self.hydration_threshold
    }

    /// 候选排序：相似度（保留 4 位小数）降序 → efficiency_flag → token_cost 升序 → TieBreak
    pub fn rank(&self, candidates: &[ScoredCase]) -> Vec<ScoredCase> {
        let mut ranked = candidates.to_vec();
        ranked.sort_by(|a, b| self.compare(a, b));
        ranked
    }

    fn compare(&self, a: &ScoredCase, b: &ScoredCase) -> Ordering {
        let sim = |c: &ScoredCase| (c.similarity * 10_000.0).round() as i64;
        sim(b)
            .cmp(&sim(a))
            .then(b.case.efficiency_flag.cmp(&a.case.efficiency_flag))
            .then(a.case.token_cost.cmp(&b.case.token_cost))
            .then_with(|| match self.tie_break {
                TieBreak::Feedback => b
                    .case
                    .feedback_score
                    .cmp(&a.case.feedback_score)
                    .then(b.case.created_at.cmp(&a.case.created_at)),
                TieBreak::Newest => b.case.created_at.cmp(&a.case.created_at),
                TieBreak::Oldest => a.case.created_at.cmp(&b.case.created_at),
            })
    }

    /// 决定快速路径或完整规划
    pub fn decide(
        &self,
        candidates: &[ScoredCase],
        params: &Parameters,
        registry: &CapabilityRegistry,
        allowed_tools: &[String],
    ) -> HydrationDecision {
        let ranked = self.rank(candidates);
        let eligible: Vec<&ScoredCase> = ranked
            .iter()
            .filter(|c| c.similarity >= self.hydration_threshold)
            .collect();
        if eligible.is_empty() {
            return HydrationDecision::FullPlanning {
                reason: match ranked.first() {
                    Some(best) => format!(
                        "best similarity {:.3} below hydration threshold {:.3}",
                        best.similarity, self.hydration_threshold
                    ),
                    None => "no champion case matched".to_string(),
                },
            };
        }

        let mut last_reason = String::new();
        for candidate in eligible {
            match hydrate(&candidate.case.plan_skeleton, params) {
                Ok(plan) => match validate_plan(&plan, registry, allowed_tools) {
                    Ok(()) => {
                        tracing::info!(
                            case_id = %candidate.case.case_id,
                            similarity = candidate.similarity,
                            "plan hydrated from champion case"
                        );
                        return HydrationDecision::FastPath {
                            plan,
                            case_id: candidate.case.case_id.clone(),
                            similarity: candidate.similarity,
                        };
                    }
                    Err(e) => {
                        last_reason = format!("case {} no longer valid: {e}", candidate.case.case_id)
                    }
                },
                Err(missing) => {
                    last_reason = format!(
                        "case {} needs unresolved parameters: {}",
                        candidate.case.case_id,
                        missing.join(", ")
                    )
                }
            }
            tracing::debug!(reason = %last_reason, "hydration candidate rejected");
        }
        HydrationDecision::FullPlanning {
            reason: last_reason,
        }
    }
}

/// 用请求参数填充骨架；返回无法解析的参数名列表作为错误
pub fn hydrate(skeleton: &Plan, params: &Parameters) -> Result<Plan, Vec<String>> {
    let mut missing = Vec::new();
    for phase in skeleton.phases() {
        for name in placeholders_in(&Value::Object(phase.arguments.clone())) {
            if let PlaceholderRef::Param(param) = PlaceholderRef::parse(&name) {
                if !params.contains_key(&param) && !missing.contains(&param) {
                    missing.push(param);
                }
            }
        }
    }
    if !missing.is_empty() {
        return Err(missing);
    }
    Ok(skeleton.map_arguments(|phase| {
        let args = Value::Object(phase.arguments.clone());
        let filled = substitute(&args, &mut |name: &str| match PlaceholderRef::parse(name) {
            PlaceholderRef::Param(p) => params.get(&p).map(|v| Value::String(v.clone())),
            _ => None,
        });
        match filled {
            Value::Object(map) => map,
            _ => Arguments::new(),
        }
    }))
}

/// 由成功的计划生成骨架：等于某个请求参数值的字符串参数替换为 {{param}}（长值优先）
pub fn parameterize(plan: &Plan, params: &Parameters) -> Plan {
    let mut by_length: Vec<(&String, &String)> =
        params.iter().filter(|(_, v)| !v.trim().is_empty()).collect();
    by_length.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(b.0)));
    plan.map_arguments(|phase| {
        phase
            .arguments
            .iter()
            .map(|(k, v)| (k.clone(), parameterize_value(v, &by_length)))
            .collect()
    })
}

fn parameterize_value(value: &Value, params: &[(&String, &String)]) -> Value {
    match value {
        Value::String(s) => params
            .iter()
            .find(|(_, v)| v.as_str() == s)
            .map(|(name, _)| Value::String(placeholder(name)))
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| parameterize_value(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), parameterize_value(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn kv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b([A-Za-z_][A-Za-z0-9_]*)\s*[=:]\s*(?:"([^"]*)"|'([^']*)'|([^\s,;"']+))"#)
            .expect("valid key/value regex")
    })
}

fn noun_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(database|schema|table|collection)\s+([A-Za-z0-9_][A-Za-z0-9_.\-]*)")
            .expect("valid noun regex")
    })
}

/// 从请求文本抽取参数：key=value、key: value、「database|schema|table|collection 名称」短语；
/// 整个请求文本总是以 request 提供
pub fn extract_parameters(text: &str) -> Parameters {
    let mut params = Parameters::new();
    for cap in noun_regex().captures_iter(text) {
        params.insert(cap[1].to_lowercase(), cap[2].to_string());
    }
    for cap in kv_regex().captures_iter(text) {
        let value = cap
            .get(2)
            .or_else(|| cap.get(3))
            .or_else(|| cap.get(4))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        params.insert(cap[1].to_string(), value);
    }
    params.insert("request".to_string(), text.to_string());
    params
}

/// 把请求中抽取到的参数值替换为占位符，得到用于指纹的意图文本；
/// 只有参数值不同的两个请求会得到同一个意图文本
pub fn mask_parameters(text: &str, params: &Parameters) -> String {
    let mut values: Vec<(&String, &String)> = params
        .iter()
        .filter(|(name, value)| name.as_str() != "request" && !value.is_empty())
        .collect();
    values.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    let mut masked = text.to_string();
    for (name, value) in values {
        let pattern = format!(r"(^|[^\w{{]){}($|[^\w}}])", regex::escape(value));
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        let replacement = format!("${{1}}{}${{2}}", placeholder(name));
        masked = re.replace_all(&masked, replacement.as_str()).into_owned();
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Phase;
    use crate::planning::champion::ChampionCase;
    use crate::tools::EchoTool;
    use serde_json::json;

    fn registry() -> CapabilityRegistry {
        let mut r = CapabilityRegistry::new();
        r.register(EchoTool);
        r
    }

    fn skeleton() -> Plan {
        Plan::new(vec![
            Phase::tool_call(1, "list", &["echo"]).with_arg("text", json!("{{database}}")),
            Phase::tool_call(2, "show", &["echo"]).with_arg("text", json!("{{phase:1}}")),
        ])
    }

    fn scored(similarity: f32, efficient: bool, cost: u64, created_at: i64) -> ScoredCase {
        let mut case = ChampionCase::new("default", "q", vec![], skeleton(), cost, false);
        case.efficiency_flag = efficient;
        case.created_at = created_at;
        ScoredCase { case, similarity }
    }

    #[test]
    fn test_extract_parameters() {
        let p = extract_parameters("list tables in database X where limit=10 and owner: \"ann lee\"");
        assert_eq!(p.get("database").map(String::as_str), Some("X"));
        assert_eq!(p.get("limit").map(String::as_str), Some("10"));
        assert_eq!(p.get("owner").map(String::as_str), Some("ann lee"));
        assert!(p.contains_key("request"));
        assert!(!p.contains_key("table"));
    }

    #[test]
    fn test_mask_parameters_ignores_values() {
        let x = "list tables in database X";
        let y = "list tables in database sales_db";
        assert_eq!(mask_parameters(x, &extract_parameters(x)), "list tables in database {{database}}");
        assert_eq!(
            mask_parameters(x, &extract_parameters(x)),
            mask_parameters(y, &extract_parameters(y))
        );

        let kv = "show rows where limit=10";
        assert_eq!(mask_parameters(kv, &extract_parameters(kv)), "show rows where limit={{limit}}");
        // 只替换完整的词
        let text = "list Xavier tables in database X";
        assert_eq!(
            mask_parameters(text, &extract_parameters(text)),
            "list Xavier tables in database {{database}}"
        );
    }

    #[test]
    fn test_parameterize_then_hydrate() {
        let plan = Plan::new(vec![Phase::tool_call(1, "list", &["echo"]).with_arg("text", json!("X"))]);
        let params = extract_parameters("list tables in database X");
        let skeleton = parameterize(&plan, &params);
        assert_eq!(skeleton.phases()[0].arguments["text"], json!("{{database}}"));

        let other = extract_parameters("list tables in database Y");
        let hydrated = hydrate(&skeleton, &other).unwrap();
        assert_eq!(hydrated.phases()[0].arguments["text"], json!("Y"));
    }

    #[test]
    fn test_hydration_is_structurally_idempotent() {
        let hydrator = PlanHydrator::new(0.9, TieBreak::Feedback);
        let candidates = vec![scored(0.97, false, 10, 1)];
        let a = hydrator.decide(&candidates, &extract_parameters("database A"), &registry(), &[]);
        let b = hydrator.decide(&candidates, &extract_parameters("database B"), &registry(), &[]);
        match (a, b) {
            (
                HydrationDecision::FastPath { plan: pa, .. },
                HydrationDecision::FastPath { plan: pb, .. },
            ) => {
                assert_ne!(pa, pb);
                assert_eq!(pa.shape(), pb.shape());
                assert_eq!(pa.phases()[1].arguments["text"], json!("{{phase:1}}"));
            }
            other => panic!("expected fast path twice, got {other:?}"),
        }
    }

    #[test]
    fn test_unresolved_parameter_forces_full_planning() {
        let hydrator = PlanHydrator::new(0.9, TieBreak::Feedback);
        let decision = hydrator.decide(&[scored(0.99, false, 10, 1)], &extract_parameters("hello"), &registry(), &[]);
        match decision {
            HydrationDecision::FullPlanning { reason } => assert!(reason.contains("database")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_below_threshold_forces_full_planning() {
        let hydrator = PlanHydrator::new(0.9, TieBreak::Feedback);
        let decision = hydrator.decide(&[scored(0.8, true, 1, 1)], &extract_parameters("database A"), &registry(), &[]);
        assert!(!decision.is_fast_path());
    }

    #[test]
    fn test_tie_break_order() {
        let hydrator = PlanHydrator::new(0.9, TieBreak::Feedback);
        let ranked = hydrator.rank(&[
            scored(0.95, false, 5, 1),
            scored(0.95, true, 50, 2),
            scored(0.95, true, 10, 3),
        ]);
        assert_eq!(ranked[0].case.token_cost, 10);
        assert_eq!(ranked[1].case.token_cost, 50);

        let oldest = PlanHydrator::new(0.9, TieBreak::Oldest);
        let ranked = oldest.rank(&[scored(0.95, true, 10, 9), scored(0.95, true, 10, 3)]);
        assert_eq!(ranked[0].case.created_at, 3);
    }
}
