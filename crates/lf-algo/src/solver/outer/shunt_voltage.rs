//! Switched shunt voltage control: the continuous susceptance solution is
//! frozen to the nearest section, then moved whole sections toward the
//! voltage target.

use super::discrete::{quantize_steps, sensitivity_to_variable, DiscreteControlState};
use super::{loop_data, OuterLoop, OuterLoopContext, OuterLoopInitContext, OuterLoopStatus};
use crate::model::ControlKind;
use lf_core::{LfResult, Shunt, ShuntId};
use std::any::Any;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Default)]
struct ShuntData {
    per_shunt: HashMap<ShuntId, DiscreteControlState>,
    total_sections: usize,
}

pub struct ShuntVoltageControl {
    pub max_direction_changes: usize,
    /// Sections one check may switch in or out.
    pub max_steps_per_iteration: i64,
}

impl Default for ShuntVoltageControl {
    fn default() -> Self {
        Self {
            max_direction_changes: 2,
            max_steps_per_iteration: 3,
        }
    }
}

fn nearest_section(b: f64, shunt: &Shunt) -> f64 {
    if shunt.section_b_pu <= 0.0 {
        return b.clamp(shunt.bmin_pu, shunt.bmax_pu);
    }
    let sections = ((b - shunt.bmin_pu) / shunt.section_b_pu).round();
    (shunt.bmin_pu + sections * shunt.section_b_pu).clamp(shunt.bmin_pu, shunt.bmax_pu)
}

impl ShuntVoltageControl {
    fn controlled_shunts(ctx: &OuterLoopContext<'_>) -> Vec<Shunt> {
        ctx.network
            .shunts()
            .filter(|s| {
                ctx.model
                    .control_var(ControlKind::ShuntVoltage(s.id))
                    .is_some()
                    && s.controlled_bus
                        .map(|b| ctx.model.buses().contains(&b))
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

impl OuterLoop for ShuntVoltageControl {
    fn name(&self) -> &'static str {
        "shunt voltage control"
    }

    fn initialize(&self, _ctx: &mut OuterLoopInitContext<'_>) -> Box<dyn Any> {
        Box::new(ShuntData::default())
    }

    fn check(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<OuterLoopStatus> {
        let shunts = Self::controlled_shunts(ctx);
        if shunts.is_empty() {
            return Ok(OuterLoopStatus::Stable);
        }

        let mut froze = false;
        for shunt in &shunts {
            let kind = ControlKind::ShuntVoltage(shunt.id);
            if ctx.model.control_frozen(kind) {
                continue;
            }
            let Some(var) = ctx.model.control_var(kind) else {
                continue;
            };
            let continuous = ctx.state.get(var);
            ctx.model.freeze_control(kind, ctx.system, ctx.state);
            if let Some(freeze_eq) = ctx.model.freeze_eq(kind) {
                ctx.system
                    .set_target(freeze_eq, nearest_section(continuous, shunt));
            }
            debug!(shunt = shunt.id.value(), continuous, "shunt susceptance frozen");
            froze = true;
        }
        if froze {
            return Ok(OuterLoopStatus::Unstable);
        }

        let mut stepped = false;
        for shunt in &shunts {
            let kind = ControlKind::ShuntVoltage(shunt.id);
            let Some(freeze_eq) = ctx.model.freeze_eq(kind) else {
                continue;
            };
            let Some(controlled_bus) = shunt.controlled_bus else {
                continue;
            };
            let b = ctx.system.target(freeze_eq);
            let v_var = ctx.model.v_var(controlled_bus);
            let error = shunt.target_v_pu - ctx.state.get(v_var);
            let sens = sensitivity_to_variable(ctx, freeze_eq, v_var)?;
            if sens.abs() < 1e-9 {
                continue;
            }
            let steps = quantize_steps(
                error / sens,
                shunt.section_b_pu,
                b,
                shunt.bmin_pu,
                shunt.bmax_pu,
                self.max_steps_per_iteration,
            );
            let data = loop_data::<ShuntData>(ctx.data)?;
            let steps = data
                .per_shunt
                .entry(shunt.id)
                .or_default()
                .filter_steps(steps, self.max_direction_changes);
            if steps != 0 {
                let new_b = b + steps as f64 * shunt.section_b_pu;
                debug!(shunt = shunt.id.value(), steps, new_b, "shunt stepped");
                ctx.system.set_target(freeze_eq, new_b);
                data.total_sections += steps.unsigned_abs() as usize;
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
        let finals: Vec<(ShuntId, f64)> = Self::controlled_shunts(ctx)
            .iter()
            .filter_map(|s| {
                let kind = ControlKind::ShuntVoltage(s.id);
                ctx.model.control_var(kind).map(|v| (s.id, ctx.state.get(v)))
            })
            .collect();
        for node in ctx.network.graph.node_weights_mut() {
            if let lf_core::Node::Shunt(shunt) = node {
                if let Some(&(_, b)) = finals.iter().find(|(id, _)| *id == shunt.id) {
                    shunt.b_pu = b;
                }
            }
        }
        let data = loop_data::<ShuntData>(ctx.data)?;
        if data.total_sections > 0 {
            info!(sections = data.total_sections, "shunt section movements");
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
    use lf_core::{Branch, BranchId, Bus, BusId, Gen, GenId, Load, LoadId, Network};

    fn network_with_shunt() -> Network {
        let mut n = Network::new();
        n.add_bus(Bus::new(BusId::new(1), "b1"));
        n.add_bus(Bus::new(BusId::new(2), "b2"));
        n.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(1.0)
                .with_target_v(1.0),
        );
        n.add_load(Load::new(LoadId::new(1), "l1", BusId::new(2), 1.0, 0.4));
        n.add_shunt(Shunt {
            id: ShuntId::new(1),
            name: "sc1".into(),
            bus: BusId::new(2),
            b_pu: 0.0,
            section_b_pu: 0.1,
            bmin_pu: 0.0,
            bmax_pu: 1.0,
            controlled_bus: Some(BusId::new(2)),
            target_v_pu: 1.0,
        });
        n.add_branch(Branch::new(
            BranchId::new(1),
            "line",
            BusId::new(1),
            BusId::new(2),
            0.01,
            0.15,
        ))
        .unwrap();
        n
    }

    #[test]
    fn test_shunt_supports_voltage_in_sections() {
        let mut network = network_with_shunt();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (mut model, mut state) = AcModel::build(&network, &island, &mut system).unwrap();
        FlatStart.initialize(&network, &model, &mut state).unwrap();
        let mut jacobian = JacobianMatrix::new(&mut system);
        let nr = NewtonRaphson::new(NewtonRaphsonConfig::default());
        let initial = nr.solve(&mut system, &mut state, &mut jacobian).unwrap();
        assert_eq!(initial.status, SolverStatus::Converged);

        let loops: Vec<Box<dyn crate::solver::outer::OuterLoop>> =
            vec![Box::new(ShuntVoltageControl::default())];
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

        // Susceptance on the section grid, voltage near target.
        let kind = ControlKind::ShuntVoltage(ShuntId::new(1));
        let b = state.get(model.control_var(kind).unwrap());
        let sections = b / 0.1;
        assert!((sections - sections.round()).abs() < 1e-9);
        assert!(b >= 0.0);
        let v2 = state.get(model.v_var(BusId::new(2)));
        assert!((v2 - 1.0).abs() < 0.05);

        let shunt = network.shunts().next().unwrap();
        assert!((shunt.b_pu - b).abs() < 1e-12);
    }
}
