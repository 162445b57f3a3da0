//! Sparse susceptance matrix (B') for the DC approximation.
//!
//! The B' matrix relates bus angles to active injections under DC
//! assumptions:
//! ```text
//! P = B' × θ
//!
//! B'[i,j] = -b_ij        for i ≠ j
//! B'[i,i] = Σ_k b_ik     over branches at bus i
//! ```
//!
//! It backs the DC angle initializer and the post-contingency angle
//! engine, both of which solve the reduced system with the slack row and
//! column removed.

use lf_core::{BranchId, BusId, Network};
use sprs::{CsMat, CsMatView, TriMat};
use std::collections::HashMap;
use thiserror::Error;

/// Branches with reactance below this are treated as this value when
/// building B', so zero-impedance couplers stay representable.
const MIN_REACTANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum SusceptanceError {
    #[error("no buses found in network")]
    NoBuses,

    #[error("no in-service branches found in network")]
    NoBranches,

    #[error("unknown bus ID: {0}")]
    UnknownBus(usize),

    #[error("slack bus {0} not present in network")]
    UnknownSlack(usize),
}

/// Sparse B' matrix in CSR format, bus order sorted by id for
/// reproducible indexing.
#[derive(Debug, Clone)]
pub struct SparseSusceptance {
    matrix: CsMat<f64>,
    bus_order: Vec<BusId>,
    bus_to_idx: HashMap<BusId, usize>,
    /// BranchId -> (from_idx, to_idx, susceptance b = 1/x)
    branch_data: HashMap<BranchId, (usize, usize, f64)>,
    slack_idx: usize,
}

impl SparseSusceptance {
    /// Build B' from all in-service branches, with the given slack bus.
    pub fn from_network(network: &Network, slack: BusId) -> Result<Self, SusceptanceError> {
        let mut bus_order: Vec<BusId> = network.buses().map(|b| b.id).collect();
        if bus_order.is_empty() {
            return Err(SusceptanceError::NoBuses);
        }
        bus_order.sort_by_key(|id| id.value());
        let bus_to_idx: HashMap<BusId, usize> = bus_order
            .iter()
            .enumerate()
            .map(|(idx, &id)| (id, idx))
            .collect();
        let slack_idx = *bus_to_idx
            .get(&slack)
            .ok_or(SusceptanceError::UnknownSlack(slack.value()))?;

        let n = bus_order.len();
        let mut triplets = TriMat::new((n, n));
        let mut branch_data = HashMap::new();
        let mut branch_count = 0;

        for branch in network.branches() {
            let x = if branch.reactance.abs() < MIN_REACTANCE {
                MIN_REACTANCE.copysign(branch.reactance)
            } else {
                branch.reactance
            };
            let b = 1.0 / (x * branch.tap_ratio);

            let i = *bus_to_idx
                .get(&branch.from_bus)
                .ok_or(SusceptanceError::UnknownBus(branch.from_bus.value()))?;
            let j = *bus_to_idx
                .get(&branch.to_bus)
                .ok_or(SusceptanceError::UnknownBus(branch.to_bus.value()))?;

            triplets.add_triplet(i, j, -b);
            triplets.add_triplet(j, i, -b);
            triplets.add_triplet(i, i, b);
            triplets.add_triplet(j, j, b);

            branch_data.insert(branch.id, (i, j, b));
            branch_count += 1;
        }

        if branch_count == 0 {
            return Err(SusceptanceError::NoBranches);
        }

        Ok(Self {
            matrix: triplets.to_csr(),
            bus_order,
            bus_to_idx,
            branch_data,
            slack_idx,
        })
    }

    pub fn view(&self) -> CsMatView<'_, f64> {
        self.matrix.view()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.matrix.get(i, j).copied().unwrap_or(0.0)
    }

    pub fn n_bus(&self) -> usize {
        self.bus_order.len()
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    pub fn bus_id(&self, idx: usize) -> Option<BusId> {
        self.bus_order.get(idx).copied()
    }

    pub fn bus_index(&self, bus_id: BusId) -> Option<usize> {
        self.bus_to_idx.get(&bus_id).copied()
    }

    pub fn bus_order(&self) -> &[BusId] {
        &self.bus_order
    }

    pub fn slack_idx(&self) -> usize {
        self.slack_idx
    }

    /// Branch data (from_idx, to_idx, susceptance).
    pub fn branch_data(&self, branch_id: BranchId) -> Option<(usize, usize, f64)> {
        self.branch_data.get(&branch_id).copied()
    }

    /// Map a full matrix index to the reduced (slack removed) index, or
    /// `None` for the slack bus itself.
    pub fn reduced_index(&self, idx: usize) -> Option<usize> {
        if idx < self.slack_idx {
            Some(idx)
        } else if idx > self.slack_idx {
            Some(idx - 1)
        } else {
            None
        }
    }

    /// Reduced matrix (slack row/column removed) and its bus order.
    pub fn reduced_matrix(&self) -> (CsMat<f64>, Vec<BusId>) {
        let n = self.n_bus();
        let m = n - 1;

        let mut triplets = TriMat::new((m, m));
        let reduced_order: Vec<BusId> = self
            .bus_order
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != self.slack_idx)
            .map(|(_, &id)| id)
            .collect();

        for i in 0..n {
            let Some(new_i) = self.reduced_index(i) else {
                continue;
            };
            if let Some(row) = self.matrix.outer_view(i) {
                for (j, &val) in row.iter() {
                    if let Some(new_j) = self.reduced_index(j) {
                        triplets.add_triplet(new_i, new_j, val);
                    }
                }
            }
        }

        (triplets.to_csr(), reduced_order)
    }

    /// Reduced matrix as a dense row-major buffer, for LU factorization.
    pub fn reduced_dense(&self) -> (Vec<f64>, Vec<BusId>) {
        let (reduced, order) = self.reduced_matrix();
        let m = order.len();
        let mut dense = vec![0.0; m * m];
        for (i, row) in reduced.outer_iterator().enumerate() {
            for (j, &val) in row.iter() {
                dense[i * m + j] = val;
            }
        }
        (dense, order)
    }

    /// Net active injections (generation minus load) per bus, in matrix
    /// order.
    pub fn injections(&self, network: &Network) -> Vec<f64> {
        let mut p = vec![0.0; self.n_bus()];
        for gen in network.gens() {
            if let Some(&idx) = self.bus_to_idx.get(&gen.bus) {
                p[idx] += gen.target_p_pu;
            }
        }
        for load in network.loads() {
            if let Some(&idx) = self.bus_to_idx.get(&load.bus) {
                p[idx] -= load.p_pu;
            }
        }
        p
    }
}
