//! Phase-shifting transformer flow control: the continuous shift solution
//! is frozen to the nearest tap, then moved whole taps toward the active
//! flow target on the shifter's own branch.

use super::discrete::{
    quantize_steps, sensitivity_of_equation_value, DiscreteControlState,
};
use super::{loop_data, OuterLoop, OuterLoopContext, OuterLoopInitContext, OuterLoopStatus};
use crate::model::ControlKind;
use lf_core::{BranchId, LfResult, PhaseControl};
use std::any::Any;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Default)]
struct PhaseData {
    per_branch: HashMap<BranchId, DiscreteControlState>,
    total_steps: usize,
}

pub struct PhaseShifterControl {
    pub max_direction_changes: usize,
    /// Taps one check may move a shifter.
    pub max_steps_per_iteration: i64,
}

impl Default for PhaseShifterControl {
    fn default() -> Self {
        Self {
            max_direction_changes: 2,
            max_steps_per_iteration: 3,
        }
    }
}

fn nearest_shift(alpha: f64, pc: &PhaseControl) -> f64 {
    if pc.step_size_rad <= 0.0 {
        return alpha;
    }
    let steps = ((alpha - pc.min_shift_rad) / pc.step_size_rad).round();
    (pc.min_shift_rad + steps * pc.step_size_rad).clamp(pc.min_shift_rad, pc.max_shift_rad)
}

impl PhaseShifterControl {
    fn controlled_branches(ctx: &OuterLoopContext<'_>) -> Vec<(BranchId, PhaseControl)> {
        ctx.network
            .branches()
            .filter_map(|b| b.phase_control.clone().map(|pc| (b.id, pc)))
            .filter(|(id, _)| {
                ctx.model
                    .control_var(ControlKind::PhaseShifterFlow(*id))
                    .is_some()
            })
            .collect()
    }
}

impl OuterLoop for PhaseShifterControl {
    fn name(&self) -> &'static str {
        "phase shifter control"
    }

    fn initialize(&self, _ctx: &mut OuterLoopInitContext<'_>) -> Box<dyn Any> {
        Box::new(PhaseData::default())
    }

    fn check(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<OuterLoopStatus> {
        let branches = Self::controlled_branches(ctx);
        if branches.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let mut froze = false;
        for (id, pc) in &branches {
            let kind = ControlKind::PhaseShifterFlow(*id);
            if ctx.model.control_frozen(kind) {
                continue;
            }
            let Some(var) = ctx.model.control_var(kind) else {
                continue;
            };
            let continuous = ctx.state.get(var);
            ctx.model.freeze_control(kind, ctx.system, ctx.state);
            if let Some(freeze_eq) = ctx.model.freeze_eq(kind) {
                ctx.system.set_target(freeze_eq, nearest_shift(continuous, pc));
            }
            debug!(branch = id.value(), continuous, "phase shift frozen");
            froze = true;
        }
        if froze {
            return Ok(OuterLoopStatus::Unstable);
        }

        let mut stepped = false;
        for (id, pc) in &branches {
            let kind = ControlKind::PhaseShifterFlow(*id);
            let Some(freeze_eq) = ctx.model.freeze_eq(kind) else {
                continue;
            };
            // The retired flow-target equation still evaluates the flow.
            let Some(flow_eq) = ctx.model.continuous_eq(kind) else {
                continue;
            };
            let alpha = ctx.system.target(freeze_eq);
            let flow = ctx.system.eval_equation(flow_eq, ctx.state);
            let error = pc.target_p_pu - flow;
            let sens = sensitivity_of_equation_value(ctx, freeze_eq, flow_eq)?;
            if sens.abs() < 1e-9 {
                continue;
            }
            let steps = quantize_steps(
                error / sens,
                pc.step_size_rad,
                alpha,
                pc.min_shift_rad,
                pc.max_shift_rad,
                self.max_steps_per_iteration,
            );
            let data = loop_data::<PhaseData>(ctx.data)?;
            let steps = data
                .per_branch
                .entry(*id)
                .or_default()
                .filter_steps(steps, self.max_direction_changes);
            if steps != 0 {
                let new_alpha = alpha + steps as f64 * pc.step_size_rad;
                debug!(branch = id.value(), steps, new_alpha, "phase shifter stepped");
                ctx.system.set_target(freeze_eq, new_alpha);
                data.total_steps += steps.unsigned_abs() as usize;
                stepped = true;
            }
        }

        Ok(if stepped {
            OuterLoopStatus::Unstable
        } else {
            OuterLoopStatus::Stable
        })
    }

    fn cleanup(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<()> {
        let finals: Vec<(BranchId, f64)> = Self::controlled_branches(ctx)
            .iter()
            .filter_map(|(id, _)| {
                let kind = ControlKind::PhaseShifterFlow(*id);
                ctx.model.control_var(kind).map(|v| (*id, ctx.state.get(v)))
            })
            .collect();
        for edge in ctx.network.graph.edge_weights_mut() {
            let lf_core::Edge::Branch(branch) = edge;
            if let Some(&(_, alpha)) = finals.iter().find(|(id, _)| *id == branch.id) {
                branch.phase_shift_rad = alpha;
            }
        }
        let data = loop_data::<PhaseData>(ctx.data)?;
        if data.total_steps > 0 {
            info!(steps = data.total_steps, "phase shifter movements");
        }
        Ok(())
    }
}
