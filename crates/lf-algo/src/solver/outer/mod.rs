//! Outer loops: policies layered around the Newton-Raphson core.
//!
//! Each loop inspects a solved state and either accepts it (`Stable`) or
//! adjusts the equation system and demands a re-solve (`Unstable`). The
//! runner drives them in registration order; a pass over all loops is
//! repeated as long as some re-solve actually iterated, so loops see each
//! other's adjustments. Cleanups run in reverse registration order.

pub mod area_interchange;
pub mod discrete;
pub mod distributed_slack;
pub mod phase_control;
pub mod reactive_limits;
pub mod shunt_voltage;
pub mod transformer_voltage;

pub use area_interchange::AreaInterchangeControl;
pub use discrete::AllowedDirection;
pub use distributed_slack::{
    DistributedSlack, ParticipationMode, SlackDistributionFailureBehavior,
};
pub use phase_control::PhaseShifterControl;
pub use reactive_limits::ReactiveLimits;
pub use shunt_voltage::ShuntVoltageControl;
pub use transformer_voltage::TransformerVoltageControl;

use crate::equations::{EquationSystem, StateVector};
use crate::model::AcModel;
use crate::solver::newton::{NonlinearSolver, SolverStatus};
use crate::sparse::jacobian::JacobianMatrix;
use lf_core::{LfError, LfResult, Network};
use std::any::Any;
use tracing::{debug, warn};

/// Verdict of one outer-loop check.
#[derive(Debug, Clone, PartialEq)]
pub enum OuterLoopStatus {
    /// The solved state satisfies this loop's policy.
    Stable,
    /// The loop adjusted the system; a re-solve is required.
    Unstable,
    /// The policy cannot be satisfied.
    Failed(String),
}

/// Everything a loop may touch during a check.
pub struct OuterLoopContext<'a> {
    pub network: &'a mut Network,
    pub model: &'a mut AcModel,
    pub system: &'a mut EquationSystem,
    pub state: &'a mut StateVector,
    pub jacobian: &'a mut JacobianMatrix,
    /// How many times this loop has already demanded a re-solve.
    pub iteration: usize,
    /// Loop-private data created by [`OuterLoop::initialize`].
    pub data: &'a mut dyn Any,
}

pub trait OuterLoop {
    fn name(&self) -> &'static str;

    /// Create the loop's private data for one run.
    fn initialize(&self, ctx: &mut OuterLoopInitContext<'_>) -> Box<dyn Any>;

    /// Inspect the solved state; adjust and return `Unstable` to demand a
    /// re-solve.
    fn check(&self, ctx: &mut OuterLoopContext<'_>) -> LfResult<OuterLoopStatus>;

    /// Final bookkeeping once the run settled.
    fn cleanup(&self, _ctx: &mut OuterLoopContext<'_>) -> LfResult<()> {
        Ok(())
    }
}

/// Read-only view handed to [`OuterLoop::initialize`].
pub struct OuterLoopInitContext<'a> {
    pub network: &'a Network,
    pub model: &'a AcModel,
    pub system: &'a mut EquationSystem,
    pub state: &'a StateVector,
}

#[derive(Debug, Clone)]
pub struct OuterLoopConfig {
    /// Re-solves allowed per loop before the run is declared unstable.
    pub max_outer_loop_iterations: usize,
}

impl Default for OuterLoopConfig {
    fn default() -> Self {
        Self {
            max_outer_loop_iterations: 20,
        }
    }
}

/// Outcome of a full outer-loop run.
pub struct OuterLoopRunOutcome {
    pub status: SolverStatus,
    /// Newton iterations spent across all re-solves, including the
    /// initial solve.
    pub cumulative_iterations: usize,
}

/// Drives registered loops around the Newton core until every policy is
/// stable or a budget runs out.
pub struct OuterLoopRunner<'a> {
    loops: &'a [Box<dyn OuterLoop>],
    config: OuterLoopConfig,
}

impl<'a> OuterLoopRunner<'a> {
    pub fn new(loops: &'a [Box<dyn OuterLoop>], config: OuterLoopConfig) -> Self {
        Self { loops, config }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        network: &mut Network,
        model: &mut AcModel,
        system: &mut EquationSystem,
        state: &mut StateVector,
        jacobian: &mut JacobianMatrix,
        nr: &dyn NonlinearSolver,
        initial_iterations: usize,
    ) -> LfResult<OuterLoopRunOutcome> {
        let mut data: Vec<Box<dyn Any>> = Vec::with_capacity(self.loops.len());
        for l in self.loops {
            let mut init_ctx = OuterLoopInitContext {
                network: &*network,
                model: &*model,
                system: &mut *system,
                state: &*state,
            };
            data.push(l.initialize(&mut init_ctx));
        }
        let mut iterations_per_loop = vec![0usize; self.loops.len()];
        let mut cumulative = initial_iterations;

        let result = 'run: loop {
            let pass_start = cumulative;
            for (idx, l) in self.loops.iter().enumerate() {
                loop {
                    let mut ctx = OuterLoopContext {
                        network: &mut *network,
                        model: &mut *model,
                        system: &mut *system,
                        state: &mut *state,
                        jacobian: &mut *jacobian,
                        iteration: iterations_per_loop[idx],
                        data: data[idx].as_mut(),
                    };
                    match l.check(&mut ctx)? {
                        OuterLoopStatus::Stable => break,
                        OuterLoopStatus::Failed(reason) => {
                            warn!(name = l.name(), reason = reason.as_str(), "outer loop failed");
                            break 'run SolverStatus::OuterLoopFailed;
                        }
                        OuterLoopStatus::Unstable => {
                            // The check mutated the system, so it gets its
                            // re-solve even when this spends the budget.
                            iterations_per_loop[idx] += 1;
                            debug!(
                                name = l.name(),
                                iteration = iterations_per_loop[idx],
                                "outer loop unstable, re-solving"
                            );
                            let result = nr.solve(system, state, jacobian)?;
                            if result.status != SolverStatus::Converged {
                                break 'run result.status;
                            }
                            cumulative += result.iterations;
                            if iterations_per_loop[idx] >= self.config.max_outer_loop_iterations {
                                warn!(name = l.name(), "outer loop budget exhausted");
                                break 'run SolverStatus::Unstable;
                            }
                        }
                    }
                }
            }
            // Another pass only if some re-solve actually iterated.
            if cumulative == pass_start {
                break SolverStatus::Converged;
            }
        };

        for (idx, l) in self.loops.iter().enumerate().rev() {
            let mut ctx = OuterLoopContext {
                network: &mut *network,
                model: &mut *model,
                system: &mut *system,
                state: &mut *state,
                jacobian: &mut *jacobian,
                iteration: iterations_per_loop[idx],
                data: data[idx].as_mut(),
            };
            l.cleanup(&mut ctx)?;
        }

        Ok(OuterLoopRunOutcome {
            status: result,
            cumulative_iterations: cumulative,
        })
    }
}

/// Downcast helper for loop-private data.
pub(crate) fn loop_data<T: 'static>(data: &mut dyn Any) -> LfResult<&mut T> {
    data.downcast_mut::<T>()
        .ok_or_else(|| LfError::Solver("outer loop data type mismatch".into()))
}
