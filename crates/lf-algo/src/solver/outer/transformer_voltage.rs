//! On-load tap changer control.
//!
//! First check freezes every controlled ratio at the discrete tap nearest
//! its continuous solution. Later checks nudge taps whole steps toward the
//! voltage target, using the frozen-system sensitivity of the controlled
//! bus voltage to the ratio.

use super::discrete::{quantize_steps, sensitivity_to_variable, DiscreteControlState};
use super::{loop_data, OuterLoop, OuterLoopContext, OuterLoopInitContext, OuterLoopStatus};
use crate::model::ControlKind;
use lf_core::{BranchId, LfResult, TapChanger};
use std::any::Any;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Default)]
struct TapData {
    per_branch: HashMap<BranchId, DiscreteControlState>,
    total_steps: usize,
}

pub struct TransformerVoltageControl {
    pub max_direction_changes: usize,
    /// Tap positions one check may move a changer.
    pub max_steps_per_iteration: i64,
}

impl Default for TransformerVoltageControl {
    fn default() -> Self {
        Self {
            max_direction_changes: 2,
            max_steps_per_iteration: 3,
        }
    }
}

fn nearest_tap(ratio: f64, tc: &TapChanger) -> f64 {
    if tc.step_size <= 0.0 {
        return ratio;
    }
    let steps = ((ratio - tc.min_ratio) / tc.step_size).round();
    (tc.min_ratio + steps * tc.step_size).clamp(tc.min_ratio, tc.max_ratio)
}

impl TransformerVoltageControl {
    fn controlled_branches(ctx: &OuterLoopContext<'_>) -> Vec<(BranchId, TapChanger)> {
        ctx.network
            .branches()
            .filter_map(|b| b.tap_changer.clone().map(|tc| (b.id, tc)))
            .filter(|(id, tc)| {
                ctx.model
                    .control_var(ControlKind::TransformerVoltage(*id))
                    .is_some()
                    && ctx.model.buses().contains(&tc.controlled_bus)
            })
            .collect()
    }
}

impl OuterLoop for TransformerVoltageControl {
    fn name(&self) -> &'static str {
        "transformer voltage control"
    }

    fn initialize(&self, _ctx: &mut OuterLoopInitContext<'_>) -> Box<dyn Any> {
        Box::new(TapData::default())
    }

    fn check(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<OuterLoopStatus> {
        let branches = Self::controlled_branches(ctx);
        if branches.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        // Phase one: freeze each ratio at its nearest discrete tap.
        let mut froze = false;
        for (id, tc) in &branches {
            let kind = ControlKind::TransformerVoltage(*id);
            if ctx.model.control_frozen(kind) {
                continue;
            }
            let Some(var) = ctx.model.control_var(kind) else {
                continue;
            };
            let continuous = ctx.state.get(var);
            ctx.model.freeze_control(kind, ctx.system, ctx.state);
            if let Some(freeze_eq) = ctx.model.freeze_eq(kind) {
                ctx.system.set_target(freeze_eq, nearest_tap(continuous, tc));
            }
            debug!(branch = id.value(), continuous, "tap ratio frozen");
            froze = true;
        }
        if froze {
            return Ok(OuterLoopStatus::Unstable);
        }

        // Phase two: step frozen taps toward their voltage targets.
        let mut stepped = false;
        for (id, tc) in &branches {
            let kind = ControlKind::TransformerVoltage(*id);
            let Some(freeze_eq) = ctx.model.freeze_eq(kind) else {
                continue;
            };
            let rho = ctx.system.target(freeze_eq);
            let v_var = ctx.model.v_var(tc.controlled_bus);
            let error = tc.target_v_pu - ctx.state.get(v_var);
            let sens = sensitivity_to_variable(ctx, freeze_eq, v_var)?;
            if sens.abs() < 1e-9 {
                continue;
            }
            let steps = quantize_steps(
                error / sens,
                tc.step_size,
                rho,
                tc.min_ratio,
                tc.max_ratio,
                self.max_steps_per_iteration,
            );
            let data = loop_data::<TapData>(ctx.data)?;
            let steps = data
                .per_branch
                .entry(*id)
                .or_default()
                .filter_steps(steps, self.max_direction_changes);
            if steps != 0 {
                let new_rho = rho + steps as f64 * tc.step_size;
                debug!(branch = id.value(), steps, new_rho, "tap stepped");
                ctx.system.set_target(freeze_eq, new_rho);
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
        // Persist solved ratios on the network.
        let finals: Vec<(BranchId, f64)> = Self::controlled_branches(ctx)
            .iter()
            .filter_map(|(id, _)| {
                let kind = ControlKind::TransformerVoltage(*id);
                ctx.model.control_var(kind).map(|v| (*id, ctx.state.get(v)))
            })
            .collect();
        for edge in ctx.network.graph.edge_weights_mut() {
            let lf_core::Edge::Branch(branch) = edge;
            if let Some(&(_, rho)) = finals.iter().find(|(id, _)| *id == branch.id) {
                branch.tap_ratio = rho;
            }
        }
        let data = loop_data::<TapData>(ctx.data)?;
        if data.total_steps > 0 {
            info!(steps = data.total_steps, "tap changer movements");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::EquationSystem;
    use crate::model::{AcModel, FlatStart, VoltageInitializer};
    use crate::solver::newton::{NewtonRaphson, NewtonRaphsonConfig, NonlinearSolver, SolverStatus};
    use crate::solver::outer::{OuterLoopConfig, OuterLoopRunner};
    use crate::sparse::jacobian::JacobianMatrix;
    use lf_core::{Branch, Bus, BusId, Gen, GenId, Load, LoadId, Network};

    fn network_with_tap() -> Network {
        let mut n = Network::new();
        n.add_bus(Bus::new(BusId::new(1), "b1"));
        n.add_bus(Bus::new(BusId::new(2), "b2"));
        n.add_bus(Bus::new(BusId::new(3), "b3"));
        n.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(1.0)
                .with_target_v(1.0),
        );
        n.add_load(Load::new(LoadId::new(1), "l1", BusId::new(3), 1.0, 0.3));
        n.add_branch(Branch::new(
            BranchId::new(1),
            "line",
            BusId::new(1),
            BusId::new(2),
            0.01,
            0.08,
        ))
        .unwrap();
        n.add_branch(
            Branch::new(
                BranchId::new(2),
                "xfmr",
                BusId::new(2),
                BusId::new(3),
                0.0,
                0.1,
            )
            .with_tap_changer(TapChanger {
                step_size: 0.01,
                min_ratio: 0.85,
                max_ratio: 1.15,
                controlled_bus: BusId::new(3),
                target_v_pu: 1.0,
            }),
        )
        .unwrap();
        n
    }

    #[test]
    fn test_tap_settles_on_discrete_grid_near_target() {
        let mut network = network_with_tap();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2), BusId::new(3)];
        let (mut model, mut state) = AcModel::build(&network, &island, &mut system).unwrap();
        FlatStart.initialize(&network, &model, &mut state).unwrap();
        let mut jacobian = JacobianMatrix::new(&mut system);
        let nr = NewtonRaphson::new(NewtonRaphsonConfig::default());
        let initial = nr.solve(&mut system, &mut state, &mut jacobian).unwrap();
        assert_eq!(initial.status, SolverStatus::Converged);

        // Continuous phase held the controlled bus exactly on target.
        let v3 = state.get(model.v_var(BusId::new(3)));
        assert!((v3 - 1.0).abs() < 1e-6);

        let loops: Vec<Box<dyn crate::solver::outer::OuterLoop>> =
            vec![Box::new(TransformerVoltageControl::default())];
        let runner = OuterLoopRunner::new(&loops, OuterLoopConfig::default());
        let outcome = runner
            .run(
                &mut network,
                &mut model,
                &mut system,
                &mut state,
                &mut jacobian,
                &nr,
                initial.iterations,
            )
            .unwrap();
        assert_eq!(outcome.status, SolverStatus::Converged);

        // The ratio landed on the discrete grid.
        let kind = ControlKind::TransformerVoltage(BranchId::new(2));
        let rho = state.get(model.control_var(kind).unwrap());
        let steps_from_min = (rho - 0.85) / 0.01;
        assert!((steps_from_min - steps_from_min.round()).abs() < 1e-9);
        assert!((0.85..=1.15).contains(&rho));

        // Voltage stays within roughly one tap's worth of the target.
        let v3 = state.get(model.v_var(BusId::new(3)));
        assert!((v3 - 1.0).abs() < 0.02);

        // Network writeback happened in cleanup.
        let xfmr = network
            .all_branches()
            .find(|b| b.id == BranchId::new(2))
            .unwrap();
        assert!((xfmr.tap_ratio - rho).abs() < 1e-12);
    }
}
