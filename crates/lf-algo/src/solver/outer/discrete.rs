//! Shared machinery for discrete device controls (tap changers, switched
//! shunts, phase shifters).
//!
//! These controls run in two phases. During the initial solve the device
//! variable is continuous, driven by a target equation on the controlled
//! quantity. The owning outer loop then freezes the variable at its
//! solved value and walks it in whole device steps, using a sensitivity
//! from the frozen system to pick the step count. Oscillation is damped
//! by a direction budget: once a control has reversed direction too often
//! it may only keep moving the way it last went.

use super::OuterLoopContext;
use crate::equations::EqId;
use lf_core::{LfError, LfResult};

/// Which way a discrete control may still move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedDirection {
    Both,
    OnlyIncrease,
    OnlyDecrease,
}

impl AllowedDirection {
    fn permits(&self, increase: bool) -> bool {
        match self {
            AllowedDirection::Both => true,
            AllowedDirection::OnlyIncrease => increase,
            AllowedDirection::OnlyDecrease => !increase,
        }
    }
}

/// Per-device stepping state across outer-loop iterations.
#[derive(Debug, Clone)]
pub struct DiscreteControlState {
    pub allowed: AllowedDirection,
    direction_changes: usize,
    last_increase: Option<bool>,
}

impl Default for DiscreteControlState {
    fn default() -> Self {
        Self {
            allowed: AllowedDirection::Both,
            direction_changes: 0,
            last_increase: None,
        }
    }
}

impl DiscreteControlState {
    /// Apply the direction budget to a proposed step count. Returns the
    /// permitted count, possibly zero.
    pub fn filter_steps(&mut self, steps: i64, max_direction_changes: usize) -> i64 {
        if steps == 0 {
            return 0;
        }
        let increase = steps > 0;
        if !self.allowed.permits(increase) {
            return 0;
        }
        if let Some(last) = self.last_increase {
            if last != increase {
                self.direction_changes += 1;
                if self.direction_changes >= max_direction_changes {
                    // Lock in the old direction; this reversal is refused.
                    self.allowed = if last {
                        AllowedDirection::OnlyIncrease
                    } else {
                        AllowedDirection::OnlyDecrease
                    };
                    return 0;
                }
            }
        }
        self.last_increase = Some(increase);
        steps
    }
}

/// Sensitivity of variable `var` to the target of `freeze_eq` in the
/// current frozen system: one column of the inverse Jacobian, obtained
/// with a single transposed solve.
pub(crate) fn sensitivity_to_variable(
    ctx: &mut OuterLoopContext<'_>,
    freeze_eq: EqId,
    var: crate::equations::VarId,
) -> LfResult<f64> {
    ctx.system.ensure_index();
    let n = ctx.system.active_rows().len();
    let col = ctx
        .system
        .variable_ref(var)
        .column()
        .ok_or_else(|| LfError::Solver("sensitivity variable is out of the active set".into()))?;
    let row = ctx
        .system
        .equation_ref(freeze_eq)
        .row()
        .ok_or_else(|| LfError::Solver("freeze equation is not active".into()))?;

    let mut rhs = vec![0.0; n];
    rhs[col] = 1.0;
    ctx.jacobian
        .solve_transposed(ctx.system, ctx.state, &mut rhs)
        .map_err(|e| LfError::Solver(e.to_string()))?;
    Ok(rhs[row])
}

/// Sensitivity of an equation's value (the sum of its active terms, e.g.
/// a branch flow) to the target of `freeze_eq`: the state response to the
/// target is chained with the term gradients.
pub(crate) fn sensitivity_of_equation_value(
    ctx: &mut OuterLoopContext<'_>,
    freeze_eq: EqId,
    value_eq: EqId,
) -> LfResult<f64> {
    ctx.system.ensure_index();
    let n = ctx.system.active_rows().len();
    let row = ctx
        .system
        .equation_ref(freeze_eq)
        .row()
        .ok_or_else(|| LfError::Solver("freeze equation is not active".into()))?;

    let mut dx = vec![0.0; n];
    dx[row] = 1.0;
    ctx.jacobian
        .solve(ctx.system, ctx.state, &mut dx)
        .map_err(|e| LfError::Solver(e.to_string()))?;

    let mut sensitivity = 0.0;
    for slot in ctx.system.equation_ref(value_eq).terms() {
        if !slot.is_active() {
            continue;
        }
        for &var in slot.term().variables() {
            if let Some(col) = ctx.system.variable_ref(var).column() {
                sensitivity += slot.term().der(var, ctx.state) * dx[col];
            }
        }
    }
    Ok(sensitivity)
}

/// Round a continuous adjustment to whole device steps, bounded by the
/// device range and by `max_per_iteration` moves at a time. The
/// sensitivity behind `desired_delta` is only local, so one check never
/// commits a large excursion in a single move.
pub(crate) fn quantize_steps(
    desired_delta: f64,
    step_size: f64,
    current: f64,
    min: f64,
    max: f64,
    max_per_iteration: i64,
) -> i64 {
    if step_size <= 0.0 || max_per_iteration <= 0 {
        return 0;
    }
    let steps = (desired_delta / step_size).round() as i64;
    let max_up = ((max - current) / step_size).floor() as i64;
    let max_down = ((min - current) / step_size).ceil() as i64;
    steps
        .clamp(max_down, max_up)
        .clamp(-max_per_iteration, max_per_iteration)
}
