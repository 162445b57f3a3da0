//! Woodbury rank-k updates of the DC base case.
//!
//! Removing branch set `S` changes the reduced susceptance matrix `A` by
//! `E C Eᵀ`, where each column of `E` carries +1/-1 at the branch
//! terminals and `C = diag(-b_k)`. The Woodbury identity turns the
//! post-contingency solve into one small `k x k` system against the
//! cached base factorization:
//! ```text
//! θ' = θ₀ - Z (C⁻¹ + Eᵀ Z)⁻¹ Eᵀ θ₀        with Z = A⁻¹ E
//! ```
//! The `Z` columns are precomputed per branch, so re-solving a
//! contingency costs one `k x k` factorization plus a vector update.

use crate::sparse::lu::{LuError, LuFactors};
use crate::sparse::susceptance::{SparseSusceptance, SusceptanceError};
use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};
use lf_core::{BranchId, BusId, Network};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// A set of branches tripped together.
#[derive(Debug, Clone)]
pub struct Contingency {
    pub id: usize,
    pub name: String,
    pub branches: Vec<BranchId>,
}

impl Contingency {
    pub fn single(id: usize, branch: BranchId) -> Self {
        Self {
            id,
            name: format!("N-1 branch {}", branch.value()),
            branches: vec![branch],
        }
    }
}

#[derive(Debug, Error)]
pub enum ContingencyError {
    #[error("susceptance matrix: {0}")]
    Susceptance(#[from] SusceptanceError),

    #[error("base factorization: {0}")]
    Factorization(#[from] LuError),

    #[error("branch {0} not part of the base case")]
    UnknownBranch(usize),

    #[error("contingency update produced a singular correction (island split)")]
    SingularUpdate,
}

/// Post-contingency angles with branch flows re-derived from them.
#[derive(Debug, Clone)]
pub struct PostContingencyState {
    /// Angles in reduced bus order; the slack bus is pinned at zero.
    pub angles: HashMap<BusId, f64>,
    /// Active flow per surviving in-service branch, from -> to.
    pub flows: HashMap<BranchId, f64>,
    /// Buses cut off from the slack; their injections were zeroed.
    pub lost_buses: Vec<BusId>,
}

/// DC engine holding the base factorization and the per-branch update
/// columns.
pub struct WoodburyEngine {
    susceptance: SparseSusceptance,
    factors: LuFactors,
    base_angles: Vec<f64>,
    /// z_l = A⁻¹ e_l per in-service branch.
    z_columns: HashMap<BranchId, Vec<f64>>,
}

impl WoodburyEngine {
    pub fn new(network: &Network, slack: BusId) -> Result<Self, ContingencyError> {
        let susceptance = SparseSusceptance::from_network(network, slack)?;
        let (dense, reduced_order) = susceptance.reduced_dense();
        let m = reduced_order.len();
        let factors = LuFactors::factorize(&dense, m)?;

        let injections = susceptance.injections(network);
        let mut rhs = Vec::with_capacity(m);
        for (idx, p) in injections.iter().enumerate() {
            if susceptance.reduced_index(idx).is_some() {
                rhs.push(*p);
            }
        }
        let base_angles = factors.solve(&rhs)?;

        let mut z_columns = HashMap::new();
        for branch in network.branches() {
            let Some((i, j, _)) = susceptance.branch_data(branch.id) else {
                continue;
            };
            let mut e = vec![0.0; m];
            if let Some(ri) = susceptance.reduced_index(i) {
                e[ri] += 1.0;
            }
            if let Some(rj) = susceptance.reduced_index(j) {
                e[rj] -= 1.0;
            }
            factors.solve_in_place(&mut e)?;
            z_columns.insert(branch.id, e);
        }

        Ok(Self {
            susceptance,
            factors,
            base_angles,
            z_columns,
        })
    }

    pub fn susceptance(&self) -> &SparseSusceptance {
        &self.susceptance
    }

    /// Contingency-state column of a branch.
    pub fn z_column(&self, branch: BranchId) -> Option<&[f64]> {
        self.z_columns.get(&branch).map(|z| z.as_slice())
    }

    /// Base-case angle of a bus (slack pinned at zero).
    pub fn base_angle(&self, bus: BusId) -> Option<f64> {
        let idx = self.susceptance.bus_index(bus)?;
        Some(match self.susceptance.reduced_index(idx) {
            Some(r) => self.base_angles[r],
            None => 0.0,
        })
    }

    fn angle_at(&self, angles: &[f64], full_idx: usize) -> f64 {
        match self.susceptance.reduced_index(full_idx) {
            Some(r) => angles[r],
            None => 0.0,
        }
    }

    /// Angle difference across a branch in a reduced angle vector.
    fn angle_diff(&self, angles: &[f64], branch: BranchId) -> Option<f64> {
        let (i, j, _) = self.susceptance.branch_data(branch)?;
        Some(self.angle_at(angles, i) - self.angle_at(angles, j))
    }

    /// Apply the rank-k correction for `removed` to `angles` (reduced
    /// order, modified in place).
    fn apply_update(&self, angles: &mut [f64], removed: &[BranchId]) -> Result<(), ContingencyError> {
        if removed.is_empty() {
            return Ok(());
        }
        let k = removed.len();
        let mut branch_b = Vec::with_capacity(k);
        for &id in removed {
            let (_, _, b) = self
                .susceptance
                .branch_data(id)
                .ok_or(ContingencyError::UnknownBranch(id.value()))?;
            branch_b.push(b);
        }

        // M = C⁻¹ + Eᵀ Z, with C = diag(-b).
        let mut m_mat = Mat::zeros(k, k);
        let mut rhs = Mat::zeros(k, 1);
        for (row, &id_row) in removed.iter().enumerate() {
            for (col, &id_col) in removed.iter().enumerate() {
                let z = self
                    .z_columns
                    .get(&id_col)
                    .ok_or(ContingencyError::UnknownBranch(id_col.value()))?;
                let mut val = self.angle_diff(z, id_row).unwrap_or(0.0);
                if row == col {
                    val -= 1.0 / branch_b[row];
                }
                m_mat.write(row, col, val);
            }
            rhs.write(row, 0, self.angle_diff(angles, id_row).unwrap_or(0.0));
        }

        let lu = m_mat.partial_piv_lu();
        let y = lu.solve(&rhs);
        for row in 0..k {
            if !y.read(row, 0).is_finite() {
                return Err(ContingencyError::SingularUpdate);
            }
        }

        for (col, &id) in removed.iter().enumerate() {
            let z = &self.z_columns[&id];
            let scale = y.read(col, 0);
            for (a, zi) in angles.iter_mut().zip(z.iter()) {
                *a -= scale * zi;
            }
        }
        Ok(())
    }

    /// Re-solve the base injections against the cached factorization with
    /// the injections of `zeroed` buses removed. Used when a contingency
    /// cuts buses off from the slack.
    fn angles_with_zeroed(
        &self,
        network: &Network,
        zeroed: &[BusId],
    ) -> Result<Vec<f64>, ContingencyError> {
        let mut injections = self.susceptance.injections(network);
        for &bus in zeroed {
            if let Some(idx) = self.susceptance.bus_index(bus) {
                injections[idx] = 0.0;
            }
        }
        let mut rhs = Vec::with_capacity(self.base_angles.len());
        for (idx, p) in injections.iter().enumerate() {
            if self.susceptance.reduced_index(idx).is_some() {
                rhs.push(*p);
            }
        }
        Ok(self.factors.solve(&rhs)?)
    }

    /// Angles and flows after tripping `removed`, assuming the trip does
    /// not split the network. Use [`crate::contingency::ContingencyAnalysis`]
    /// for the split-aware path.
    pub fn post_contingency(
        &self,
        network: &Network,
        removed: &[BranchId],
    ) -> Result<PostContingencyState, ContingencyError> {
        self.post_contingency_with(network, removed, &[])
    }

    /// Split-aware variant: `lost_buses` get their injections zeroed and
    /// `removed` must already exclude any branch needed to keep the
    /// surviving grid connected.
    pub fn post_contingency_with(
        &self,
        network: &Network,
        removed: &[BranchId],
        lost_buses: &[BusId],
    ) -> Result<PostContingencyState, ContingencyError> {
        let mut angles = if lost_buses.is_empty() {
            self.base_angles.clone()
        } else {
            self.angles_with_zeroed(network, lost_buses)?
        };
        self.apply_update(&mut angles, removed)?;
        debug!(removed = removed.len(), lost = lost_buses.len(), "contingency applied");

        let mut angle_map = HashMap::new();
        for (idx, &bus) in self.susceptance.bus_order().iter().enumerate() {
            angle_map.insert(bus, self.angle_at(&angles, idx));
        }

        let mut flows = HashMap::new();
        for branch in network.branches() {
            if removed.contains(&branch.id) {
                continue;
            }
            let Some((i, j, b)) = self.susceptance.branch_data(branch.id) else {
                continue;
            };
            let diff = self.angle_at(&angles, i) - self.angle_at(&angles, j);
            flows.insert(branch.id, b * diff);
        }

        Ok(PostContingencyState {
            angles: angle_map,
            flows,
            lost_buses: lost_buses.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_core::{Branch, Bus, Gen, GenId, Load, LoadId};

    // Four buses in a ring plus a 1-3 chord; slack at bus 1.
    fn ring_network() -> Network {
        let mut n = Network::new();
        for i in 1..=4 {
            n.add_bus(Bus::new(BusId::new(i), &format!("b{i}")));
        }
        n.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(2.0)
                .with_target_v(1.0),
        );
        n.add_load(Load::new(LoadId::new(1), "l3", BusId::new(3), 2.0, 0.0));
        let lines = [
            (1, 1, 2, 0.1),
            (2, 2, 3, 0.2),
            (3, 3, 4, 0.2),
            (4, 4, 1, 0.1),
            (5, 1, 3, 0.25),
        ];
        for (id, f, t, x) in lines {
            n.add_branch(Branch::new(
                BranchId::new(id),
                &format!("l{f}{t}"),
                BusId::new(f),
                BusId::new(t),
                0.0,
                x,
            ))
            .unwrap();
        }
        n
    }

    /// Brute-force reference: rebuild B' without the removed branches.
    fn brute_force_angles(network: &Network, removed: &[BranchId]) -> HashMap<BusId, f64> {
        let mut reduced = network.clone();
        for &id in removed {
            reduced.set_branch_status(id, false).unwrap();
        }
        let engine = WoodburyEngine::new(&reduced, BusId::new(1)).unwrap();
        reduced
            .buses()
            .map(|b| (b.id, engine.base_angle(b.id).unwrap()))
            .collect()
    }

    #[test]
    fn test_base_angles_satisfy_injections() {
        let network = ring_network();
        let engine = WoodburyEngine::new(&network, BusId::new(1)).unwrap();
        // Slack is pinned, loaded bus lags it.
        assert_eq!(engine.base_angle(BusId::new(1)), Some(0.0));
        assert!(engine.base_angle(BusId::new(3)).unwrap() < 0.0);
    }

    #[test]
    fn test_rank_one_matches_rebuild() {
        let network = ring_network();
        let engine = WoodburyEngine::new(&network, BusId::new(1)).unwrap();
        let removed = [BranchId::new(2)];
        let state = engine.post_contingency(&network, &removed).unwrap();
        let reference = brute_force_angles(&network, &removed);
        for (bus, angle) in &state.angles {
            assert!(
                (angle - reference[bus]).abs() < 1e-9,
                "bus {} mismatch",
                bus.value()
            );
        }
        assert!(!state.flows.contains_key(&BranchId::new(2)));
    }

    #[test]
    fn test_rank_two_matches_rebuild() {
        let network = ring_network();
        let engine = WoodburyEngine::new(&network, BusId::new(1)).unwrap();
        let removed = [BranchId::new(1), BranchId::new(3)];
        let state = engine.post_contingency(&network, &removed).unwrap();
        let reference = brute_force_angles(&network, &removed);
        for (bus, angle) in &state.angles {
            assert!((angle - reference[bus]).abs() < 1e-9);
        }
        // Buses 2 and 4 become leaves with no injection; the whole load
        // rides the 1-3 chord.
        assert!(state.flows[&BranchId::new(2)].abs() < 1e-9);
        assert!(state.flows[&BranchId::new(4)].abs() < 1e-9);
        assert!((state.flows[&BranchId::new(5)] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_flows_balance_at_load_bus() {
        let network = ring_network();
        let engine = WoodburyEngine::new(&network, BusId::new(1)).unwrap();
        let state = engine
            .post_contingency(&network, &[BranchId::new(1)])
            .unwrap();
        // Bus 3 receives its full demand over the surviving lines.
        let into_3 = state.flows[&BranchId::new(2)] - state.flows[&BranchId::new(3)]
            + state.flows[&BranchId::new(5)];
        assert!((into_3 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_branch_rejected() {
        let network = ring_network();
        let engine = WoodburyEngine::new(&network, BusId::new(1)).unwrap();
        assert!(matches!(
            engine.post_contingency(&network, &[BranchId::new(9)]),
            Err(ContingencyError::UnknownBranch(9))
        ));
    }
}
