//! Connectivity-break detection for contingencies, in two tiers.
//!
//! Tier one is a screen over the precomputed contingency-state columns:
//! the self-transfer factor of a tripped branch against the whole tripped
//! set approaches one exactly when the set leaves no alternate path. The
//! screen can flag sets that survive, but never misses a true break.
//! Tier two confirms flagged sets with an exact graph traversal.
//!
//! For a confirmed break, the minimal reconnection set is the subset of
//! tripped branches that still bridges the surviving components; those
//! stay in the matrix so the Woodbury update remains well-posed, and the
//! buses truly cut off from the slack get their injections zeroed.

use crate::contingency::woodbury::WoodburyEngine;
use lf_core::{component_count_without, BranchId, BusId, Network};
use petgraph::unionfind::UnionFind;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Screen margin: a set is flagged when some tripped branch's aggregate
/// self-transfer factor reaches `1 - SCREEN_TOLERANCE`.
pub const SCREEN_TOLERANCE: f64 = 1e-6;

/// How a confirmed break is worked around.
#[derive(Debug, Clone)]
pub struct BreakResolution {
    /// Tripped branches kept in the matrix to bridge the split.
    pub reconnection: Vec<BranchId>,
    /// Tripped branches actually applied as a Woodbury update.
    pub applied: Vec<BranchId>,
    /// Buses cut off from the slack in the true topology.
    pub lost_buses: Vec<BusId>,
}

/// Aggregate self-transfer factor of one tripped branch against the set.
fn transfer_factor(engine: &WoodburyEngine, branch: BranchId, set: &[BranchId]) -> Option<f64> {
    let susceptance = engine.susceptance();
    let (i, j, b) = susceptance.branch_data(branch)?;
    let at = |z: &[f64], idx: usize| match susceptance.reduced_index(idx) {
        Some(r) => z[r],
        None => 0.0,
    };
    let mut sigma = 0.0;
    for &member in set {
        let z = engine.z_column(member)?;
        sigma += (b * (at(z, i) - at(z, j))).abs();
    }
    Some(sigma)
}

/// Tripped branches whose transfer factor says the set may split the
/// network. Empty means the set is provably safe.
pub fn screen_potentially_breaking(engine: &WoodburyEngine, set: &[BranchId]) -> Vec<BranchId> {
    set.iter()
        .copied()
        .filter(|&branch| {
            transfer_factor(engine, branch, set)
                .map(|sigma| sigma >= 1.0 - SCREEN_TOLERANCE)
                .unwrap_or(true)
        })
        .collect()
}

/// Exact check: does removing the set increase the component count?
pub fn confirm_break(network: &Network, set: &[BranchId]) -> bool {
    let base = component_count_without(network, &[]);
    component_count_without(network, set) > base
}

/// Buses unreachable from the slack once the set is out.
fn buses_lost_from_slack(network: &Network, set: &[BranchId], slack: BusId) -> Vec<BusId> {
    let removed: HashSet<BranchId> = set.iter().copied().collect();
    let mut adjacency: HashMap<BusId, Vec<BusId>> = HashMap::new();
    for bus in network.buses() {
        adjacency.entry(bus.id).or_default();
    }
    for branch in network.branches() {
        if removed.contains(&branch.id) {
            continue;
        }
        adjacency.entry(branch.from_bus).or_default().push(branch.to_bus);
        adjacency.entry(branch.to_bus).or_default().push(branch.from_bus);
    }

    let mut reached: HashSet<BusId> = HashSet::new();
    let mut queue = VecDeque::from([slack]);
    while let Some(bus) = queue.pop_front() {
        if !reached.insert(bus) {
            continue;
        }
        if let Some(neighbors) = adjacency.get(&bus) {
            for &n in neighbors {
                if !reached.contains(&n) {
                    queue.push_back(n);
                }
            }
        }
    }

    let mut lost: Vec<BusId> = network
        .buses()
        .map(|b| b.id)
        .filter(|id| !reached.contains(id))
        .collect();
    lost.sort_unstable();
    lost
}

/// Work out the minimal reconnection set for a breaking contingency.
pub fn resolve_break(
    engine: &WoodburyEngine,
    network: &Network,
    set: &[BranchId],
    slack: BusId,
) -> BreakResolution {
    let susceptance = engine.susceptance();
    let removed: HashSet<BranchId> = set.iter().copied().collect();

    // Components of the surviving grid.
    let mut uf = UnionFind::<usize>::new(susceptance.n_bus());
    for branch in network.branches() {
        if removed.contains(&branch.id) {
            continue;
        }
        if let Some((i, j, _)) = susceptance.branch_data(branch.id) {
            uf.union(i, j);
        }
    }

    // Greedily re-add tripped branches that still bridge components.
    let mut reconnection = Vec::new();
    let mut applied = Vec::new();
    for &branch in set {
        match susceptance.branch_data(branch) {
            Some((i, j, _)) if uf.union(i, j) => reconnection.push(branch),
            Some(_) => applied.push(branch),
            None => {}
        }
    }
    debug!(
        reconnection = reconnection.len(),
        applied = applied.len(),
        "connectivity break resolved"
    );

    BreakResolution {
        reconnection,
        applied,
        lost_buses: buses_lost_from_slack(network, set, slack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_core::{Branch, Bus, Gen, GenId, Load, LoadId};

    // Ring 1-2-3-4 with a 1-3 chord and a stub bus 5 hanging off bus 4.
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
    fn test_screen_flags_stub_trip() {
        let n = network();
        let engine = WoodburyEngine::new(&n, BusId::new(1)).unwrap();
        // Branch 6 is the only path to bus 5.
        let flagged = screen_potentially_breaking(&engine, &[BranchId::new(6)]);
        assert_eq!(flagged, vec![BranchId::new(6)]);
        assert!(confirm_break(&n, &[BranchId::new(6)]));
    }

    #[test]
    fn test_screen_clears_redundant_trip() {
        let n = network();
        let engine = WoodburyEngine::new(&n, BusId::new(1)).unwrap();
        let flagged = screen_potentially_breaking(&engine, &[BranchId::new(2)]);
        assert!(flagged.is_empty());
        assert!(!confirm_break(&n, &[BranchId::new(2)]));
    }

    // The screen may over-flag but must never clear a set that truly
    // breaks the network.
    #[test]
    fn test_screen_has_no_false_negatives() {
        let n = network();
        let engine = WoodburyEngine::new(&n, BusId::new(1)).unwrap();
        let ids: Vec<BranchId> = (1..=6).map(BranchId::new).collect();
        for (a_idx, &a) in ids.iter().enumerate() {
            for &b in &ids[a_idx + 1..] {
                let set = [a, b];
                if confirm_break(&n, &set) {
                    assert!(
                        !screen_potentially_breaking(&engine, &set).is_empty(),
                        "screen missed break of {:?}",
                        set
                    );
                }
            }
        }
    }

    #[test]
    fn test_resolution_keeps_bridge_and_zeroes_stub() {
        let n = network();
        let engine = WoodburyEngine::new(&n, BusId::new(1)).unwrap();
        let set = [BranchId::new(2), BranchId::new(6)];
        let resolution = resolve_break(&engine, &n, &set, BusId::new(1));
        // Branch 6 must stay to keep the matrix nonsingular; branch 2 has
        // alternate paths and is applied normally.
        assert_eq!(resolution.reconnection, vec![BranchId::new(6)]);
        assert_eq!(resolution.applied, vec![BranchId::new(2)]);
        assert_eq!(resolution.lost_buses, vec![BusId::new(5)]);
    }
}
