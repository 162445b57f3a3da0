//! Jacobian matrix manager.
//!
//! Assembles the sparse Jacobian of the active equation set and keeps it
//! consistent with the registry through the listener contract. Validity
//! only ever degrades between updates; the degraded level decides how much
//! work the next [`JacobianMatrix::update`] has to do:
//!
//! - `ValuesInvalid` (state changed): recompute entries into the existing
//!   sparsity pattern, the per-iteration fast path.
//! - `ValuesAndStructureInvalid` / `StructureInvalid` (active set
//!   changed): re-run index assignment and rebuild the pattern.
//!
//! The LU factors are cached alongside and discarded on any downgrade.

use crate::equations::{
    EqId, EquationSystem, EquationSystemListener, StateVector, SystemEvent, VarId,
};
use crate::sparse::lu::{LuError, LuFactors};
use sprs::{CsMat, TriMat};
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum JacobianError {
    #[error("active system is not square: {rows} equations, {cols} variables")]
    NotSquare { rows: usize, cols: usize },

    #[error("recorded contribution has no pattern entry at ({row}, {col})")]
    MissingEntry { row: usize, col: usize },

    #[error(transparent)]
    Lu(#[from] LuError),
}

/// Validity of the assembled matrix relative to the registry and state.
/// Ordering is the degradation order; combining two degradations takes the
/// max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixValidity {
    Valid,
    /// Entry values are stale (the state vector moved).
    ValuesInvalid,
    /// Entry values are stale and the term population changed; the pattern
    /// must be rebuilt from the registry.
    ValuesAndStructureInvalid,
    /// Row/column assignment itself is stale.
    StructureInvalid,
}

struct ValidityCell(Cell<MatrixValidity>);

impl ValidityCell {
    fn downgrade(&self, to: MatrixValidity) {
        self.0.set(self.0.get().max(to));
    }
}

impl EquationSystemListener for ValidityCell {
    fn on_event(&self, event: SystemEvent) {
        let level = match event {
            SystemEvent::TargetChanged => return,
            SystemEvent::TermActivated | SystemEvent::TermDeactivated => {
                MatrixValidity::ValuesAndStructureInvalid
            }
            _ => MatrixValidity::StructureInvalid,
        };
        self.downgrade(level);
    }
}

/// One recorded derivative contribution: term `slot` of equation `eq`,
/// derived with respect to `var`, lands at `data_idx` in the CSR data.
struct Contribution {
    data_idx: usize,
    eq: EqId,
    slot: usize,
    var: VarId,
}

/// The Jacobian of the active equation set, with cached LU factors.
pub struct JacobianMatrix {
    validity: Rc<ValidityCell>,
    matrix: CsMat<f64>,
    contributions: Vec<Contribution>,
    rows: usize,
    cols: usize,
    factors: Option<LuFactors>,
}

impl JacobianMatrix {
    /// Create the manager and subscribe it to the registry.
    pub fn new(system: &mut EquationSystem) -> Self {
        let validity = Rc::new(ValidityCell(Cell::new(MatrixValidity::StructureInvalid)));
        system.add_listener(validity.clone());
        Self {
            validity,
            matrix: CsMat::zero((0, 0)),
            contributions: Vec::new(),
            rows: 0,
            cols: 0,
            factors: None,
        }
    }

    /// Signal that the state vector moved, so entry values are stale.
    pub fn mark_values_dirty(&self) {
        self.validity.downgrade(MatrixValidity::ValuesInvalid);
    }

    pub fn validity(&self) -> MatrixValidity {
        self.validity.0.get()
    }

    pub fn dim(&self) -> usize {
        self.rows
    }

    /// Bring the matrix up to date with the registry and state.
    pub fn update(
        &mut self,
        system: &mut EquationSystem,
        state: &StateVector,
    ) -> Result<(), JacobianError> {
        match self.validity.0.get() {
            MatrixValidity::Valid => return Ok(()),
            MatrixValidity::ValuesInvalid => self.refresh_values(system, state),
            MatrixValidity::ValuesAndStructureInvalid | MatrixValidity::StructureInvalid => {
                self.rebuild(system, state)?
            }
        }
        self.factors = None;
        self.validity.0.set(MatrixValidity::Valid);
        Ok(())
    }

    fn rebuild(
        &mut self,
        system: &mut EquationSystem,
        state: &StateVector,
    ) -> Result<(), JacobianError> {
        system.ensure_index();
        let rows = system.active_rows().len();
        let cols = system.active_columns().len();
        if rows != cols {
            return Err(JacobianError::NotSquare { rows, cols });
        }

        let mut triplets = TriMat::new((rows, cols));
        // (row, col) kept alongside so contributions can be mapped to CSR
        // data slots after duplicate summing.
        let mut recorded: Vec<(usize, usize, EqId, usize, VarId)> = Vec::new();

        for (row, &eq_id) in system.active_rows().iter().enumerate() {
            let equation = system.equation_ref(eq_id);
            for (slot, term_slot) in equation.terms().iter().enumerate() {
                if !term_slot.is_active() {
                    continue;
                }
                for &var in term_slot.term().variables() {
                    let Some(col) = system.variable_ref(var).column() else {
                        continue;
                    };
                    triplets.add_triplet(row, col, term_slot.term().der(var, state));
                    recorded.push((row, col, eq_id, slot, var));
                }
            }
        }

        self.matrix = triplets.to_csr();
        self.contributions = Vec::with_capacity(recorded.len());
        for (row, col, eq, slot, var) in recorded {
            // The triplet was just inserted; a hole here means the pattern
            // and the recording went out of sync.
            let data_idx = self
                .matrix
                .nnz_index(row, col)
                .map(|i| i.0)
                .ok_or(JacobianError::MissingEntry { row, col })?;
            self.contributions.push(Contribution {
                data_idx,
                eq,
                slot,
                var,
            });
        }
        self.rows = rows;
        self.cols = cols;
        debug!(rows, nnz = self.matrix.nnz(), "jacobian rebuilt");
        Ok(())
    }

    fn refresh_values(&mut self, system: &EquationSystem, state: &StateVector) {
        for v in self.matrix.data_mut() {
            *v = 0.0;
        }
        let data = self.matrix.data_mut();
        for c in &self.contributions {
            let term = system.equation_ref(c.eq).terms()[c.slot].term();
            data[c.data_idx] += term.der(c.var, state);
        }
    }

    fn ensure_factors(&mut self) -> Result<&LuFactors, JacobianError> {
        if self.factors.is_none() {
            let n = self.rows;
            let mut dense = vec![0.0; n * n];
            for (i, row) in self.matrix.outer_iterator().enumerate() {
                for (j, &val) in row.iter() {
                    dense[i * n + j] = val;
                }
            }
            self.factors = Some(LuFactors::factorize(&dense, n)?);
        }
        Ok(self.factors.as_ref().unwrap())
    }

    /// Solve `J x = b` in place, updating and factorizing as needed.
    pub fn solve(
        &mut self,
        system: &mut EquationSystem,
        state: &StateVector,
        b: &mut [f64],
    ) -> Result<(), JacobianError> {
        self.update(system, state)?;
        self.ensure_factors()?.solve_in_place(b)?;
        Ok(())
    }

    /// Solve `Jᵀ x = b` in place. This is the sensitivity direction: one
    /// unit of `b` at a variable's column yields, per row, the response of
    /// that variable to the row's target.
    pub fn solve_transposed(
        &mut self,
        system: &mut EquationSystem,
        state: &StateVector,
        b: &mut [f64],
    ) -> Result<(), JacobianError> {
        self.update(system, state)?;
        self.ensure_factors()?.solve_transposed_in_place(b)?;
        Ok(())
    }

    /// Entry value at (row, col), zero if outside the pattern.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.matrix.get(row, col).copied().unwrap_or(0.0)
    }
}
