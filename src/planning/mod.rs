//! 规划：冠军案例存储、指纹匹配、计划水合与战略规划

pub mod champion;
pub mod fingerprint;
pub mod hydrator;
pub mod strategic;

pub use champion::{ChampionCase, ChampionStore, InMemoryChampionStore, ScoredCase};
pub use fingerprint::{FingerprintMatcher, MatchOutcome};
pub use hydrator::{
    extract_parameters, hydrate, mask_parameters, parameterize, HydrationDecision, Parameters, PlanHydrator, TieBreak,
};
pub use strategic::{PlanningRequest, StrategicPlanner, PLANNER_PURPOSE};
