//! 计划校验：新生成与水合得到的计划在执行前都必须通过

use crate::plan::parse::PlanError;
use crate::plan::types::Plan;
use crate::tools::CapabilityRegistry;

/// 校验计划：
/// - 阶段号从 1 开始连续递增
/// - 每个阶段至少给出候选工具或提示指令
/// - 候选工具与指令都能在注册表中解析（allowed 非空时还需在白名单内）
/// - loop_over / condition / {{phase:N}} 只引用更早的阶段
pub fn validate_plan(
    plan: &Plan,
    registry: &CapabilityRegistry,
    allowed_tools: &[String],
) -> Result<(), PlanError> {
    if plan.is_empty() {
        return Err(PlanError::Empty);
    }
    for (idx, phase) in plan.phases().iter().enumerate() {
        let expected = idx as u32 + 1;
        if phase.phase_num != expected {
            return Err(PlanError::NonContiguous {
                expected,
                found: phase.phase_num,
            });
        }
        if phase.candidate_tools.is_empty() && phase.executable_directive.is_none() {
            return Err(PlanError::NothingToExecute {
                phase: phase.phase_num,
            });
        }
        for tool in &phase.candidate_tools {
            let allowed = allowed_tools.is_empty() || allowed_tools.contains(tool);
            if !allowed || !registry.has_tool(tool) {
                return Err(PlanError::UnknownCapability {
                    phase: phase.phase_num,
                    name: tool.clone(),
                });
            }
        }
        if let Some(directive) = &phase.executable_directive {
            if !registry.has_directive(directive) {
                return Err(PlanError::UnknownDirective {
                    phase: phase.phase_num,
                    name: directive.clone(),
                });
            }
        }
        if let Some(target) = phase
            .dependencies()
            .into_iter()
            .find(|dep| *dep == 0 || *dep >= phase.phase_num)
        {
            return Err(PlanError::ForwardReference {
                phase: phase.phase_num,
                target,
            });
        }
    }
    Ok(())
}
