//! Fast contingency analysis on the DC approximation.
//!
//! One base factorization is shared across all contingencies; each trip
//! is a Woodbury rank-k re-solve, with a two-tier connectivity check in
//! front of it. Batches run in parallel.

pub mod connectivity;
pub mod woodbury;

pub use connectivity::{
    confirm_break, resolve_break, screen_potentially_breaking, BreakResolution,
};
pub use woodbury::{Contingency, ContingencyError, PostContingencyState, WoodburyEngine};

use lf_core::{BranchId, BusId, LfError, LfResult, Network};
use rayon::prelude::*;
use tracing::{info, warn};

/// Result of one contingency in a batch.
#[derive(Debug, Clone)]
pub struct ContingencyOutcome {
    pub id: usize,
    pub name: String,
    /// `None` when the update failed or nothing remained to trip.
    pub state: Option<PostContingencyState>,
    pub broke_connectivity: bool,
}

impl ContingencyOutcome {
    pub fn solved(&self) -> bool {
        self.state.is_some()
    }
}

/// Batch engine: base case plus screening state, shared across workers.
pub struct ContingencyAnalysis {
    engine: WoodburyEngine,
    slack: BusId,
}

impl ContingencyAnalysis {
    pub fn new(network: &Network, slack: BusId) -> LfResult<Self> {
        let engine = WoodburyEngine::new(network, slack)
            .map_err(|e| LfError::Solver(format!("contingency base case: {e}")))?;
        Ok(Self { engine, slack })
    }

    pub fn engine(&self) -> &WoodburyEngine {
        &self.engine
    }

    /// Every in-service branch tripped one at a time.
    pub fn n_minus_one(network: &Network) -> Vec<Contingency> {
        network
            .branches()
            .enumerate()
            .map(|(id, branch)| Contingency::single(id, branch.id))
            .collect()
    }

    fn run_one(&self, network: &Network, contingency: &Contingency) -> ContingencyOutcome {
        // Branches already out of service contribute nothing.
        let set: Vec<BranchId> = contingency
            .branches
            .iter()
            .copied()
            .filter(|&id| self.engine.susceptance().branch_data(id).is_some())
            .collect();
        if set.is_empty() {
            return ContingencyOutcome {
                id: contingency.id,
                name: contingency.name.clone(),
                state: None,
                broke_connectivity: false,
            };
        }

        let flagged = screen_potentially_breaking(&self.engine, &set);
        let breaks = !flagged.is_empty() && confirm_break(network, &set);

        let result = if breaks {
            let resolution = resolve_break(&self.engine, network, &set, self.slack);
            self.engine
                .post_contingency_with(network, &resolution.applied, &resolution.lost_buses)
        } else {
            self.engine.post_contingency(network, &set)
        };

        let state = match result {
            Ok(mut state) => {
                // Bridging branches stayed in the matrix; they are still
                // tripped as far as the caller is concerned.
                if breaks {
                    for id in &set {
                        state.flows.remove(id);
                    }
                }
                Some(state)
            }
            Err(err) => {
                warn!(name = contingency.name.as_str(), %err, "contingency not solved");
                None
            }
        };
        ContingencyOutcome {
            id: contingency.id,
            name: contingency.name.clone(),
            state,
            broke_connectivity: breaks,
        }
    }

    /// Run a batch in parallel, preserving input order.
    pub fn run(&self, network: &Network, contingencies: &[Contingency]) -> Vec<ContingencyOutcome> {
        info!(count = contingencies.len(), "contingency batch started");
        let mut outcomes: Vec<ContingencyOutcome> = contingencies
            .par_iter()
            .map(|c| self.run_one(network, c))
            .collect();
        outcomes.sort_by_key(|o| o.id);
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_core::{Branch, Bus, Gen, GenId, Load, LoadId};

    fn network() -> Network {
        let mut n = Network::new();
        for i in 1..=5 {
            n.add_bus(Bus::new(BusId::new(i), &format!("b{i}")));
        }
        n.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(2.0)
                .with_target_v(1.0),
        );
        n.add_load(Load::new(LoadId::new(1), "l3", BusId::new(3), 1.5, 0.0));
        n.add_load(Load::new(LoadId::new(2), "l5", BusId::new(5), 0.5, 0.0));
        let lines = [
            (1, 1, 2, 0.1),
            (2, 2, 3, 0.2),
            (3, 3, 4, 0.2),
            (4, 4, 1, 0.1),
            (5, 1, 3, 0.25),
            (6, 4, 5, 0.1),
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

    #[test]
    fn test_n_minus_one_batch() {
        let network = network();
        let analysis = ContingencyAnalysis::new(&network, BusId::new(1)).unwrap();
        let contingencies = ContingencyAnalysis::n_minus_one(&network);
        assert_eq!(contingencies.len(), 6);
        let outcomes = analysis.run(&network, &contingencies);
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.solved()));
        // Only the stub branch breaks connectivity.
        let breaking: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.broke_connectivity)
            .map(|o| o.name.as_str())
            .collect();
        assert_eq!(breaking, vec!["N-1 branch 6"]);
    }

    #[test]
    fn test_breaking_contingency_zeroes_lost_load() {
        let network = network();
        let analysis = ContingencyAnalysis::new(&network, BusId::new(1)).unwrap();
        let c = Contingency::single(0, BranchId::new(6));
        let outcomes = analysis.run(&network, &[c]);
        let state = outcomes[0].state.as_ref().unwrap();
        assert_eq!(state.lost_buses, vec![BusId::new(5)]);
        // With bus 5's demand gone, the surviving flows only carry the
        // 1.5 p.u. at bus 3.
        let into_3 = state.flows[&BranchId::new(2)] - state.flows[&BranchId::new(3)]
            + state.flows[&BranchId::new(5)];
        assert!((into_3 - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_non_breaking_matches_plain_update() {
        let network = network();
        let analysis = ContingencyAnalysis::new(&network, BusId::new(1)).unwrap();
        let c = Contingency::single(0, BranchId::new(2));
        let outcomes = analysis.run(&network, &[c]);
        let state = outcomes[0].state.as_ref().unwrap();
        assert!(!outcomes[0].broke_connectivity);
        let direct = analysis
            .engine()
            .post_contingency(&network, &[BranchId::new(2)])
            .unwrap();
        for (bus, angle) in &state.angles {
            assert!((angle - direct.angles[bus]).abs() < 1e-12);
        }
    }
}
