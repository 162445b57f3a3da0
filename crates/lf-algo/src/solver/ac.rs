//! Full AC load flow: island splitting, per-island solve with outer
//! loops, and result writeback.
//!
//! Islands are electrically independent, so they are solved in parallel
//! on a clone of the network each; solved state is merged back afterwards.

use crate::equations::EquationSystem;
use crate::model::{
    AcModel, DcAngleInitializer, FlatStart, PreviousValues, VoltageInitializer,
};
use crate::solver::newton::{NewtonRaphson, NewtonRaphsonConfig, NonlinearSolver, SolverStatus};
use crate::solver::outer::{
    AreaInterchangeControl, DistributedSlack, OuterLoop, OuterLoopConfig, OuterLoopRunner,
    ParticipationMode, PhaseShifterControl, ReactiveLimits, ShuntVoltageControl,
    SlackDistributionFailureBehavior, TransformerVoltageControl,
};
use crate::sparse::jacobian::JacobianMatrix;
use lf_core::{
    find_islands, BranchId, BusId, GenId, LfResult, LoadId, Network, Node,
};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Which starting point the Newton iterations use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Flat,
    /// Warm start from the voltages already on the network.
    Previous,
    /// Flat magnitudes, DC-solved angles.
    DcAngles,
}

#[derive(Debug, Clone)]
pub struct AcLoadFlowConfig {
    pub newton: NewtonRaphsonConfig,
    pub outer: OuterLoopConfig,
    pub start: StartMode,
    pub distributed_slack: bool,
    pub participation_mode: ParticipationMode,
    pub slack_failure_behavior: SlackDistributionFailureBehavior,
    pub reactive_limits: bool,
    pub area_interchange: bool,
    pub transformer_voltage_control: bool,
    pub shunt_voltage_control: bool,
    pub phase_shifter_control: bool,
}

impl Default for AcLoadFlowConfig {
    fn default() -> Self {
        Self {
            newton: NewtonRaphsonConfig::default(),
            outer: OuterLoopConfig::default(),
            start: StartMode::Flat,
            distributed_slack: false,
            participation_mode: ParticipationMode::GenerationCapacity,
            slack_failure_behavior: SlackDistributionFailureBehavior::LeaveOnSlackBus,
            reactive_limits: true,
            area_interchange: false,
            transformer_voltage_control: true,
            shunt_voltage_control: true,
            phase_shifter_control: true,
        }
    }
}

/// Per-island outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentResult {
    pub island: usize,
    pub status: SolverStatus,
    pub iterations: usize,
    pub slack_bus: Option<BusId>,
    /// Residual active-power imbalance left on the slack bus (per-unit).
    pub slack_mismatch_pu: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadFlowResult {
    pub components: Vec<ComponentResult>,
}

impl LoadFlowResult {
    /// True when every island that had something to solve converged.
    pub fn fully_converged(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c.status, SolverStatus::Converged | SolverStatus::NoCalculation))
    }
}

/// Solved state harvested from an island clone, merged into the caller's
/// network afterwards.
struct IslandOutcome {
    result: ComponentResult,
    bus_state: HashMap<BusId, (f64, f64)>,
    gen_state: HashMap<GenId, (f64, f64)>,
    load_p: HashMap<LoadId, f64>,
    branch_state: HashMap<BranchId, (f64, f64, f64, f64)>,
}

pub struct AcLoadFlowSolver {
    config: AcLoadFlowConfig,
}

impl AcLoadFlowSolver {
    pub fn new(config: AcLoadFlowConfig) -> Self {
        Self { config }
    }

    fn build_loops(&self) -> Vec<Box<dyn OuterLoop>> {
        // Order matters: device controls settle before dispatch policies.
        let mut loops: Vec<Box<dyn OuterLoop>> = Vec::new();
        if self.config.reactive_limits {
            loops.push(Box::new(ReactiveLimits::default()));
        }
        if self.config.transformer_voltage_control {
            loops.push(Box::new(TransformerVoltageControl::default()));
        }
        if self.config.shunt_voltage_control {
            loops.push(Box::new(ShuntVoltageControl::default()));
        }
        if self.config.phase_shifter_control {
            loops.push(Box::new(PhaseShifterControl::default()));
        }
        if self.config.area_interchange {
            loops.push(Box::new(AreaInterchangeControl::default()));
        }
        if self.config.distributed_slack {
            loops.push(Box::new(DistributedSlack {
                mode: self.config.participation_mode,
                failure_behavior: self.config.slack_failure_behavior,
                ..Default::default()
            }));
        }
        loops
    }

    fn solve_island(&self, network: &Network, island: usize, buses: &[BusId]) -> IslandOutcome {
        let mut scratch = network.clone();
        let no_calculation = |island| IslandOutcome {
            result: ComponentResult {
                island,
                status: SolverStatus::NoCalculation,
                iterations: 0,
                slack_bus: None,
                slack_mismatch_pu: 0.0,
            },
            bus_state: HashMap::new(),
            gen_state: HashMap::new(),
            load_p: HashMap::new(),
            branch_state: HashMap::new(),
        };

        let mut system = EquationSystem::new();
        let Ok((mut model, mut state)) = AcModel::build(&scratch, buses, &mut system) else {
            debug!(island, "island skipped (no voltage control)");
            return no_calculation(island);
        };
        let initializer: Box<dyn VoltageInitializer> = match self.config.start {
            StartMode::Flat => Box::new(FlatStart),
            StartMode::Previous => Box::new(PreviousValues),
            StartMode::DcAngles => Box::new(DcAngleInitializer),
        };
        if initializer.initialize(&scratch, &model, &mut state).is_err() {
            // Fall back rather than fail the island outright.
            let _ = FlatStart.initialize(&scratch, &model, &mut state);
        }

        let mut jacobian = JacobianMatrix::new(&mut system);
        let nr = NewtonRaphson::new(self.config.newton.clone());
        let (status, iterations) = match nr.solve(&mut system, &mut state, &mut jacobian) {
            Ok(initial) if initial.status == SolverStatus::Converged => {
                let loops = self.build_loops();
                let runner = OuterLoopRunner::new(&loops, self.config.outer.clone());
                match runner.run(
                    &mut scratch,
                    &mut model,
                    &mut system,
                    &mut state,
                    &mut jacobian,
                    &nr,
                    initial.iterations,
                ) {
                    Ok(outcome) => (outcome.status, outcome.cumulative_iterations),
                    Err(err) => {
                        debug!(island, %err, "outer loops failed");
                        (SolverStatus::SolverFailed, initial.iterations)
                    }
                }
            }
            Ok(initial) => (initial.status, initial.iterations),
            Err(err) => {
                debug!(island, %err, "island solve failed");
                (SolverStatus::SolverFailed, 0)
            }
        };

        if status == SolverStatus::Converged || status == SolverStatus::Unstable {
            model.write_results(&mut scratch, &system, &state);
        }

        let island_buses: std::collections::HashSet<BusId> = buses.iter().copied().collect();
        let bus_state = scratch
            .buses()
            .filter(|b| island_buses.contains(&b.id))
            .map(|b| (b.id, (b.v_pu, b.angle_rad)))
            .collect();
        let gen_state = scratch
            .gens()
            .filter(|g| island_buses.contains(&g.bus))
            .map(|g| (g.id, (g.p_pu, g.q_pu)))
            .collect();
        let load_p = scratch
            .loads()
            .filter(|l| island_buses.contains(&l.bus))
            .map(|l| (l.id, l.p_pu))
            .collect();
        let branch_state = scratch
            .branches()
            .filter(|b| island_buses.contains(&b.from_bus) && island_buses.contains(&b.to_bus))
            .map(|b| {
                (
                    b.id,
                    (b.p_from_pu, b.q_from_pu, b.tap_ratio, b.phase_shift_rad),
                )
            })
            .collect();

        IslandOutcome {
            result: ComponentResult {
                island,
                status,
                iterations,
                slack_bus: Some(model.slack()),
                slack_mismatch_pu: model.slack_mismatch(&system, &state),
            },
            bus_state,
            gen_state,
            load_p,
            branch_state,
        }
    }

    /// Solve every island and merge the results into `network`.
    pub fn solve(&self, network: &mut Network) -> LfResult<LoadFlowResult> {
        let islands = find_islands(network);
        info!(islands = islands.len(), "ac load flow started");

        let outcomes: Vec<IslandOutcome> = islands
            .par_iter()
            .map(|island| self.solve_island(network, island.island_id, &island.buses))
            .collect();

        let mut components = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let mut v_map = HashMap::new();
            let mut a_map = HashMap::new();
            for (bus, (v, a)) in &outcome.bus_state {
                v_map.insert(*bus, *v);
                a_map.insert(*bus, *a);
            }
            network.update_bus_state(&v_map, &a_map);
            for node in network.graph.node_weights_mut() {
                match node {
                    Node::Gen(gen) => {
                        if let Some(&(p, q)) = outcome.gen_state.get(&gen.id) {
                            gen.p_pu = p;
                            gen.q_pu = q;
                        }
                    }
                    Node::Load(load) => {
                        if let Some(&p) = outcome.load_p.get(&load.id) {
                            load.p_pu = p;
                        }
                    }
                    _ => {}
                }
            }
            for edge in network.graph.edge_weights_mut() {
                let lf_core::Edge::Branch(branch) = edge;
                if let Some(&(p, q, rho, alpha)) = outcome.branch_state.get(&branch.id) {
                    branch.p_from_pu = p;
                    branch.q_from_pu = q;
                    branch.tap_ratio = rho;
                    branch.phase_shift_rad = alpha;
                }
            }
            components.push(outcome.result);
        }
        components.sort_by_key(|c| c.island);

        let result = LoadFlowResult { components };
        info!(converged = result.fully_converged(), "ac load flow finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_core::{Branch, Bus, Gen, Load};

    // Two electrically separate two-bus systems in one network, plus one
    // dead bus with no generation.
    fn multi_island_network() -> Network {
        let mut n = Network::new();
        for i in 1..=5 {
            n.add_bus(Bus::new(BusId::new(i), &format!("b{i}")));
        }
        n.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(0.5)
                .with_target_v(1.0),
        );
        n.add_load(Load::new(LoadId::new(1), "l1", BusId::new(2), 0.5, 0.1));
        n.add_gen(
            Gen::new(GenId::new(2), "g2", BusId::new(3))
                .with_target_p(0.3)
                .with_target_v(1.01),
        );
        n.add_load(Load::new(LoadId::new(2), "l2", BusId::new(4), 0.3, 0.05));
        n.add_branch(Branch::new(
            BranchId::new(1),
            "i1",
            BusId::new(1),
            BusId::new(2),
            0.01,
            0.1,
        ))
        .unwrap();
        n.add_branch(Branch::new(
            BranchId::new(2),
            "i2",
            BusId::new(3),
            BusId::new(4),
            0.01,
            0.1,
        ))
        .unwrap();
        n
    }

    #[test]
    fn test_parallel_islands_solved_and_merged() {
        let mut network = multi_island_network();
        let solver = AcLoadFlowSolver::new(AcLoadFlowConfig::default());
        let result = solver.solve(&mut network).unwrap();

        assert_eq!(result.components.len(), 3);
        assert!(result.fully_converged());
        let statuses: Vec<SolverStatus> = result.components.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == SolverStatus::Converged)
                .count(),
            2
        );
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == SolverStatus::NoCalculation)
                .count(),
            1
        );
        for c in &result.components {
            if c.status == SolverStatus::Converged {
                // The slack carries only line losses here.
                assert!(c.slack_mismatch_pu.abs() < 0.05);
                assert!(c.slack_bus.is_some());
            }
        }

        // Both load buses picked up solved voltages; the dead bus kept its
        // default.
        let v: HashMap<usize, f64> = network.buses().map(|b| (b.id.value(), b.v_pu)).collect();
        assert!(v[&2] < 1.0);
        assert!(v[&4] < 1.01);
        assert_eq!(v[&5], 1.0);

        // Branch flows were written back.
        let b1 = network.all_branches().find(|b| b.id == BranchId::new(1)).unwrap();
        assert!(b1.p_from_pu > 0.49);
    }

    #[test]
    fn test_warm_start_reconverges_quickly() {
        let mut network = multi_island_network();
        let solver = AcLoadFlowSolver::new(AcLoadFlowConfig::default());
        solver.solve(&mut network).unwrap();

        let warm = AcLoadFlowSolver::new(AcLoadFlowConfig {
            start: StartMode::Previous,
            ..Default::default()
        });
        let result = warm.solve(&mut network).unwrap();
        assert!(result.fully_converged());
        for c in &result.components {
            if c.status == SolverStatus::Converged {
                assert!(c.iterations <= 2);
            }
        }
    }
}
