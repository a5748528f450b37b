//! 计划：类型、严格解析、校验与参数占位符

pub mod parse;
pub mod placeholder;
pub mod types;
pub mod validate;

pub use parse::{extract_json, parse_plan, PlanError, RawPlan};
pub use placeholder::{placeholder, placeholders_in, substitute, PlaceholderRef};
pub use types::{Arguments, Condition, ConditionPredicate, Phase, PhaseKind, PhaseShape, Plan};
pub use validate::validate_plan;
