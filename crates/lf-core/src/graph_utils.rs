//! Topological analysis of the network graph.
//!
//! Each connected component ("island") is solved independently by the
//! solver crate, so island labeling is the first step of every run.

use crate::{Branch, BranchId, BusId, Edge, Network, Node};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet, VecDeque};

/// One electrical island: the buses of a single connected component.
#[derive(Debug, Clone)]
pub struct Island {
    pub island_id: usize,
    pub buses: Vec<BusId>,
}

impl Island {
    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }
}

/// Labels connected components (breadth-first search over in-service
/// branches) and returns one [`Island`] per component.
///
/// Out-of-service branches do not connect buses; non-bus nodes (gens,
/// loads, shunts) attach to their bus through the `bus` field rather than
/// graph edges and are ignored here.
pub fn find_islands(network: &Network) -> Vec<Island> {
    // Adjacency over buses only, via in-service branches.
    let mut adjacency: HashMap<BusId, Vec<BusId>> = HashMap::new();
    for bus in network.buses() {
        adjacency.entry(bus.id).or_default();
    }
    for branch in network.branches() {
        adjacency.entry(branch.from_bus).or_default().push(branch.to_bus);
        adjacency.entry(branch.to_bus).or_default().push(branch.from_bus);
    }

    let mut bus_order: Vec<BusId> = network.buses().map(|b| b.id).collect();
    bus_order.sort_unstable();

    let mut visited: HashSet<BusId> = HashSet::new();
    let mut islands = Vec::new();
    for &start in &bus_order {
        if visited.contains(&start) {
            continue;
        }
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut members = Vec::new();
        while let Some(bus) = queue.pop_front() {
            if !visited.insert(bus) {
                continue;
            }
            members.push(bus);
            if let Some(neighbors) = adjacency.get(&bus) {
                for &n in neighbors {
                    if !visited.contains(&n) {
                        queue.push_back(n);
                    }
                }
            }
        }
        members.sort_unstable();
        islands.push(Island {
            island_id: islands.len(),
            buses: members,
        });
    }
    islands
}

/// Check whether the bus set stays connected after removing the given
/// branches. Returns the resulting component count.
pub fn component_count_without(network: &Network, removed: &[BranchId]) -> usize {
    let removed: HashSet<BranchId> = removed.iter().copied().collect();
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

    let mut visited: HashSet<BusId> = HashSet::new();
    let mut components = 0;
    for bus in adjacency.keys().copied().collect::<Vec<_>>() {
        if visited.contains(&bus) {
            continue;
        }
        components += 1;
        let mut queue = VecDeque::from([bus]);
        while let Some(b) = queue.pop_front() {
            if !visited.insert(b) {
                continue;
            }
            for &n in &adjacency[&b] {
                if !visited.contains(&n) {
                    queue.push_back(n);
                }
            }
        }
    }
    components
}

/// Look up a branch by id.
pub fn branch_by_id(network: &Network, id: BranchId) -> Option<&Branch> {
    network.graph.edge_references().find_map(|e| {
        let Edge::Branch(branch) = e.weight();
        (branch.id == id).then_some(branch)
    })
}

/// Look up a bus by id.
pub fn bus_by_id(network: &Network, id: BusId) -> Option<&crate::Bus> {
    network.graph.node_weights().find_map(|n| match n {
        Node::Bus(bus) if bus.id == id => Some(bus),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Branch, Bus};

    /// Bus 1 -- Bus 2 -- Bus 3, with Bus 4 isolated.
    fn chain_network() -> Network {
        let mut network = Network::new();
        let b1 = network.add_bus(Bus::new(BusId::new(1), "b1"));
        let b2 = network.add_bus(Bus::new(BusId::new(2), "b2"));
        let b3 = network.add_bus(Bus::new(BusId::new(3), "b3"));
        network.add_bus(Bus::new(BusId::new(4), "b4"));
        network.graph.add_edge(
            b1,
            b2,
            Edge::Branch(Branch::new(
                BranchId::new(1),
                "l12",
                BusId::new(1),
                BusId::new(2),
                0.0,
                0.1,
            )),
        );
        network.graph.add_edge(
            b2,
            b3,
            Edge::Branch(Branch::new(
                BranchId::new(2),
                "l23",
                BusId::new(2),
                BusId::new(3),
                0.0,
                0.1,
            )),
        );
        network
    }

    #[test]
    fn test_island_labeling() {
        let network = chain_network();
        let islands = find_islands(&network);
        assert_eq!(islands.len(), 2);
        assert_eq!(islands[0].buses, vec![BusId::new(1), BusId::new(2), BusId::new(3)]);
        assert_eq!(islands[1].buses, vec![BusId::new(4)]);
    }

    #[test]
    fn test_out_of_service_branch_splits() {
        let mut network = chain_network();
        network.set_branch_status(BranchId::new(2), false).unwrap();
        let islands = find_islands(&network);
        assert_eq!(islands.len(), 3);
    }

    #[test]
    fn test_component_count_without() {
        let network = chain_network();
        assert_eq!(component_count_without(&network, &[]), 2);
        assert_eq!(component_count_without(&network, &[BranchId::new(1)]), 3);
    }
}
