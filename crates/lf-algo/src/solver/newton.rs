//! Newton-Raphson solver over the active equation set.

use crate::equations::{EquationSystem, StateVector};
use crate::sparse::jacobian::{JacobianError, JacobianMatrix};
use lf_core::LfResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Outcome of a solve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverStatus {
    Converged,
    MaxIterationReached,
    /// Linear algebra failure (singular Jacobian, non-finite state).
    SolverFailed,
    /// Nothing to solve (island skipped or empty).
    NoCalculation,
    /// Outer loops still unstable when their budget ran out.
    Unstable,
    /// An outer-loop policy could not meet its goal.
    OuterLoopFailed,
}

#[derive(Debug, Clone)]
pub struct NewtonRaphsonConfig {
    /// Per-equation tolerance; the stopping criterion is
    /// `||f||_2 < sqrt(eps² · n)` so it scales with system size.
    pub eps_per_eq: f64,
    pub max_iterations: usize,
}

impl Default for NewtonRaphsonConfig {
    fn default() -> Self {
        Self {
            eps_per_eq: 1e-6,
            max_iterations: 30,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NewtonResult {
    pub status: SolverStatus,
    pub iterations: usize,
}

/// Contract every nonlinear solver answers: drive the active equation
/// set's mismatch to zero, reporting how it went through the shared
/// result shape. Lets alternative algorithms slot in under the outer
/// loops.
pub trait NonlinearSolver {
    fn solve(
        &self,
        system: &mut EquationSystem,
        state: &mut StateVector,
        jacobian: &mut JacobianMatrix,
    ) -> LfResult<NewtonResult>;
}

pub struct NewtonRaphson {
    config: NewtonRaphsonConfig,
}

impl NewtonRaphson {
    pub fn new(config: NewtonRaphsonConfig) -> Self {
        Self { config }
    }
}

impl NonlinearSolver for NewtonRaphson {
    /// Run iterations until the mismatch norm passes the criterion or the
    /// budget is spent. The state vector is left at the last iterate
    /// either way.
    fn solve(
        &self,
        system: &mut EquationSystem,
        state: &mut StateVector,
        jacobian: &mut JacobianMatrix,
    ) -> LfResult<NewtonResult> {
        let (rows, _) = system.active_counts();
        if rows == 0 {
            return Ok(NewtonResult {
                status: SolverStatus::NoCalculation,
                iterations: 0,
            });
        }
        let threshold = self.config.eps_per_eq * (rows as f64).sqrt();

        for iteration in 0..=self.config.max_iterations {
            let mut f = system.mismatch(state);
            let norm = f.iter().map(|v| v * v).sum::<f64>().sqrt();
            trace!(iteration, norm, "newton iteration");
            if !norm.is_finite() {
                return Ok(NewtonResult {
                    status: SolverStatus::SolverFailed,
                    iterations: iteration,
                });
            }
            if norm < threshold {
                debug!(iterations = iteration, norm, "newton converged");
                return Ok(NewtonResult {
                    status: SolverStatus::Converged,
                    iterations: iteration,
                });
            }
            if iteration == self.config.max_iterations {
                break;
            }

            // J dx = f, then x <- x - dx
            match jacobian.solve(system, state, &mut f) {
                Ok(()) => {}
                Err(JacobianError::Lu(err)) => {
                    debug!(%err, "newton linear solve failed");
                    return Ok(NewtonResult {
                        status: SolverStatus::SolverFailed,
                        iterations: iteration,
                    });
                }
                // Contract violations (non-square system, broken pattern)
                // are hard errors, not a solver status.
                Err(err) => {
                    return Err(lf_core::LfError::Solver(err.to_string()));
                }
            }
            for (col, &var) in system.active_columns().iter().enumerate() {
                state.add(var, -f[col]);
            }
            jacobian.mark_values_dirty();
        }

        debug!(
            max_iterations = self.config.max_iterations,
            "newton did not converge"
        );
        Ok(NewtonResult {
            status: SolverStatus::MaxIterationReached,
            iterations: self.config.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AcModel, FlatStart, VoltageInitializer};
    use lf_core::{Branch, BranchId, Bus, BusId, Gen, GenId, Load, LoadId, Network};

    fn two_bus() -> Network {
        let mut n = Network::new();
        n.add_bus(Bus::new(BusId::new(1), "b1"));
        n.add_bus(Bus::new(BusId::new(2), "b2"));
        n.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(0.8)
                .with_target_v(1.02),
        );
        n.add_load(Load::new(LoadId::new(1), "l1", BusId::new(2), 0.8, 0.25));
        n.add_branch(Branch::new(
            BranchId::new(1),
            "line",
            BusId::new(1),
            BusId::new(2),
            0.02,
            0.12,
        ))
        .unwrap();
        n
    }

    fn solve_two_bus() -> (Network, AcModel, EquationSystem, StateVector, NewtonResult) {
        let network = two_bus();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (model, mut state) = AcModel::build(&network, &island, &mut system).unwrap();
        FlatStart.initialize(&network, &model, &mut state).unwrap();
        let mut jacobian = JacobianMatrix::new(&mut system);
        let nr = NewtonRaphson::new(NewtonRaphsonConfig::default());
        let result = nr.solve(&mut system, &mut state, &mut jacobian).unwrap();
        (network, model, system, state, result)
    }

    #[test]
    fn test_two_bus_converges() {
        let (_network, model, system, state, result) = solve_two_bus();
        assert_eq!(result.status, SolverStatus::Converged);
        assert!(result.iterations > 0 && result.iterations < 10);

        // Load bus below the controlled 1.02, slack pinned exactly.
        let v1 = state.get(model.v_var(BusId::new(1)));
        let v2 = state.get(model.v_var(BusId::new(2)));
        assert!((v1 - 1.02).abs() < 1e-9);
        assert!(v2 < v1 && v2 > 0.9);

        // Slack picks up the line losses on top of the 0.8 target.
        let mismatch = model.slack_mismatch(&system, &state);
        assert!(mismatch > 0.0 && mismatch < 0.05);
    }

    #[test]
    fn test_solved_mismatch_below_threshold() {
        let (_network, _model, mut system, state, _result) = solve_two_bus();
        let f = system.mismatch(&state);
        let n = f.len() as f64;
        let norm = f.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!(norm < 1e-6 * n.sqrt());
    }

    #[test]
    fn test_infeasible_load_hits_iteration_limit() {
        let mut network = two_bus();
        // Far beyond the line's transfer capability.
        for node in network.graph.node_weights_mut() {
            if let lf_core::Node::Load(load) = node {
                load.p_pu = 50.0;
            }
        }
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (model, mut state) = AcModel::build(&network, &island, &mut system).unwrap();
        FlatStart.initialize(&network, &model, &mut state).unwrap();
        let mut jacobian = JacobianMatrix::new(&mut system);
        let nr = NewtonRaphson::new(NewtonRaphsonConfig::default());
        let result = nr.solve(&mut system, &mut state, &mut jacobian).unwrap();
        assert!(matches!(
            result.status,
            SolverStatus::MaxIterationReached | SolverStatus::SolverFailed
        ));
    }

    #[test]
    fn test_zero_impedance_pair_solves_identically() {
        // b1 (slack gen) -- line -- b2 == b3 (tie), load at b3.
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "b1"));
        network.add_bus(Bus::new(BusId::new(2), "b2"));
        network.add_bus(Bus::new(BusId::new(3), "b3"));
        network.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(1.99)
                .with_target_v(1.0),
        );
        network.add_load(Load::new(LoadId::new(1), "l1", BusId::new(3), 1.99, 0.5));
        network
            .add_branch(Branch::new(
                BranchId::new(1),
                "line",
                BusId::new(1),
                BusId::new(2),
                0.0,
                0.1,
            ))
            .unwrap();
        network
            .add_branch(Branch::new(
                BranchId::new(2),
                "tie",
                BusId::new(2),
                BusId::new(3),
                0.0,
                0.0,
            ))
            .unwrap();

        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2), BusId::new(3)];
        let (model, mut state) = AcModel::build(&network, &island, &mut system).unwrap();
        FlatStart.initialize(&network, &model, &mut state).unwrap();
        let mut jacobian = JacobianMatrix::new(&mut system);
        let nr = NewtonRaphson::new(NewtonRaphsonConfig::default());
        let result = nr.solve(&mut system, &mut state, &mut jacobian).unwrap();
        assert_eq!(result.status, SolverStatus::Converged);

        // The tie couples its terminals exactly, not approximately.
        let v2 = state.get(model.v_var(BusId::new(2)));
        let v3 = state.get(model.v_var(BusId::new(3)));
        let a2 = state.get(model.phi_var(BusId::new(2)));
        let a3 = state.get(model.phi_var(BusId::new(3)));
        assert!((v2 - v3).abs() < 1e-12);
        assert!((a2 - a3).abs() < 1e-12);

        // And it still carries the full load through its dummy flow.
        let (p_tie, _q_tie) = model.branch_flow(BranchId::new(2), &state).unwrap();
        assert!((p_tie - 1.99).abs() < 1e-6);
    }
}
