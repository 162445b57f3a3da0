//! # lf-core: Network Model for Steady-State Load Flow
//!
//! Provides the bus/branch graph and element data consumed by the solver
//! crate (`lf-algo`).
//!
//! ## Design Philosophy
//!
//! Networks are modeled as **undirected multigraphs** where:
//! - **Nodes**: Buses, Generators (gen), Loads, Shunt compensators
//! - **Edges**: Branches (transmission lines and transformers)
//!
//! This graph-based approach enables:
//! - Fast topological queries (connectivity, island detection)
//! - Type-safe element access with newtype IDs
//! - Support for multiple edge types between same nodes (parallel branches)
//!
//! All electrical quantities are in per-unit on a common MVA base; angles
//! are in radians. The solver writes computed state (voltage magnitude,
//! angle, branch flows) back into the element structs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lf_core::*;
//!
//! let mut network = Network::new();
//!
//! let bus1 = network.add_bus(Bus::new(BusId::new(1), "Bus 1"));
//! let bus2 = network.add_bus(Bus::new(BusId::new(2), "Bus 2"));
//!
//! network.add_gen(
//!     Gen::new(GenId::new(1), "Gen 1", BusId::new(1))
//!         .with_target_p(0.5)
//!         .with_q_limits(-1.0, 1.0),
//! );
//! network.add_load(Load::new(LoadId::new(1), "Load 1", BusId::new(2), 0.5, 0.1));
//!
//! network.graph.add_edge(
//!     bus1,
//!     bus2,
//!     Edge::Branch(Branch::new(
//!         BranchId::new(1),
//!         "Line 1-2",
//!         BusId::new(1),
//!         BusId::new(2),
//!         0.01,
//!         0.1,
//!     )),
//! );
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Unified error type
//! - [`graph_utils`] - Topological analysis (connectivity, islands)

use petgraph::{prelude::*, Undirected};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod error;
pub mod graph_utils;

pub use error::{LfError, LfResult};
pub use graph_utils::*;
pub use petgraph::graph::NodeIndex;

// Newtype wrappers for IDs for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShuntId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AreaId(usize);

macro_rules! impl_id {
    ($type:ty) => {
        impl $type {
            #[inline]
            pub fn new(value: usize) -> Self {
                Self(value)
            }
            #[inline]
            pub fn value(&self) -> usize {
                self.0
            }
        }
    };
}

impl_id!(BusId);
impl_id!(BranchId);
impl_id!(GenId);
impl_id!(LoadId);
impl_id!(ShuntId);
impl_id!(AreaId);

/// An electrical node. Voltage state fields are written back by the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    /// Voltage magnitude (per-unit), solver output
    pub v_pu: f64,
    /// Voltage angle (radians), solver output
    pub angle_rad: f64,
    /// Minimum voltage limit in per-unit
    pub vmin_pu: Option<f64>,
    /// Maximum voltage limit in per-unit
    pub vmax_pu: Option<f64>,
    /// Interchange area this bus belongs to, if any
    pub area: Option<AreaId>,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            id: BusId(0),
            name: String::new(),
            v_pu: 1.0,
            angle_rad: 0.0,
            vmin_pu: None,
            vmax_pu: None,
            area: None,
        }
    }
}

impl Bus {
    pub fn new(id: BusId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_area(mut self, area: AreaId) -> Self {
        self.area = Some(area);
        self
    }
}

/// A transmission line or transformer between two buses.
///
/// Transformer taps are modeled on the `from_bus` side: a ratio `tap_ratio`
/// and a phase shift `phase_shift_rad` both apply to the from terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    /// Series resistance (per-unit)
    pub resistance: f64,
    /// Series reactance (per-unit)
    pub reactance: f64,
    /// Total line charging susceptance (per-unit, split half/half)
    pub charging_b: f64,
    /// Multiplicative tap magnitude applied on the from side
    pub tap_ratio: f64,
    /// Phase shift applied on the from side (radians)
    pub phase_shift_rad: f64,
    /// Operational status flag (false = out of service)
    pub status: bool,
    /// Tap changer description when this branch is a controllable transformer
    pub tap_changer: Option<TapChanger>,
    /// Phase control description when this branch regulates active flow
    pub phase_control: Option<PhaseControl>,
    /// Active flow at the from terminal (per-unit), solver output
    pub p_from_pu: f64,
    /// Reactive flow at the from terminal (per-unit), solver output
    pub q_from_pu: f64,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            id: BranchId(0),
            name: String::new(),
            from_bus: BusId(0),
            to_bus: BusId(0),
            resistance: 0.0,
            reactance: 0.0,
            charging_b: 0.0,
            tap_ratio: 1.0,
            phase_shift_rad: 0.0,
            status: true,
            tap_changer: None,
            phase_control: None,
            p_from_pu: 0.0,
            q_from_pu: 0.0,
        }
    }
}

impl Branch {
    pub fn new(
        id: BranchId,
        name: impl Into<String>,
        from_bus: BusId,
        to_bus: BusId,
        resistance: f64,
        reactance: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            from_bus,
            to_bus,
            resistance,
            reactance,
            ..Self::default()
        }
    }

    pub fn with_charging_b(mut self, b: f64) -> Self {
        self.charging_b = b;
        self
    }

    pub fn with_tap_ratio(mut self, ratio: f64) -> Self {
        self.tap_ratio = ratio;
        self
    }

    pub fn with_tap_changer(mut self, tap_changer: TapChanger) -> Self {
        self.tap_changer = Some(tap_changer);
        self
    }

    pub fn with_phase_control(mut self, control: PhaseControl) -> Self {
        self.phase_control = Some(control);
        self
    }

    /// True when the series impedance is effectively zero (the branch ties
    /// its terminal buses to the same electrical point).
    pub fn is_zero_impedance(&self) -> bool {
        self.resistance.hypot(self.reactance) < 1e-8
    }
}

/// Discrete on-load tap changer on a transformer branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapChanger {
    /// Ratio change per tap step
    pub step_size: f64,
    /// Lowest reachable ratio
    pub min_ratio: f64,
    /// Highest reachable ratio
    pub max_ratio: f64,
    /// Bus whose voltage this transformer regulates
    pub controlled_bus: BusId,
    /// Voltage target at the controlled bus (per-unit)
    pub target_v_pu: f64,
}

/// Phase-shifting transformer regulating active flow on its own branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseControl {
    /// Phase change per tap step (radians)
    pub step_size_rad: f64,
    /// Lowest reachable shift (radians)
    pub min_shift_rad: f64,
    /// Highest reachable shift (radians)
    pub max_shift_rad: f64,
    /// Active flow target at the from terminal (per-unit)
    pub target_p_pu: f64,
}

/// A generating unit attached to a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gen {
    pub id: GenId,
    pub name: String,
    pub bus: BusId,
    /// Active power setpoint (per-unit)
    pub target_p_pu: f64,
    /// Voltage setpoint when this unit controls voltage (per-unit)
    pub target_v_pu: Option<f64>,
    /// Reactive setpoint used when not voltage-controlling (per-unit)
    pub target_q_pu: f64,
    /// Minimum reactive capability (per-unit)
    pub qmin_pu: f64,
    /// Maximum reactive capability (per-unit)
    pub qmax_pu: f64,
    /// Maximum active capability (per-unit), used for slack participation
    pub pmax_pu: f64,
    /// Whether this unit participates in slack distribution
    pub participating: bool,
    /// Designated fallback unit for undistributable slack residual
    pub reference: bool,
    /// Reactive output (per-unit), solver output
    pub q_pu: f64,
    /// Active output after slack distribution (per-unit), solver output
    pub p_pu: f64,
}

impl Gen {
    pub fn new(id: GenId, name: impl Into<String>, bus: BusId) -> Self {
        Self {
            id,
            name: name.into(),
            bus,
            target_p_pu: 0.0,
            target_v_pu: None,
            target_q_pu: 0.0,
            qmin_pu: f64::NEG_INFINITY,
            qmax_pu: f64::INFINITY,
            pmax_pu: 0.0,
            participating: false,
            reference: false,
            q_pu: 0.0,
            p_pu: 0.0,
        }
    }

    pub fn with_target_p(mut self, p_pu: f64) -> Self {
        self.target_p_pu = p_pu;
        self.p_pu = p_pu;
        self
    }

    pub fn with_target_v(mut self, v_pu: f64) -> Self {
        self.target_v_pu = Some(v_pu);
        self
    }

    pub fn with_q_limits(mut self, qmin_pu: f64, qmax_pu: f64) -> Self {
        self.qmin_pu = qmin_pu;
        self.qmax_pu = qmax_pu;
        self
    }

    pub fn with_pmax(mut self, pmax_pu: f64) -> Self {
        self.pmax_pu = pmax_pu;
        self
    }

    pub fn participating(mut self, participating: bool) -> Self {
        self.participating = participating;
        self
    }

    pub fn as_reference(mut self) -> Self {
        self.reference = true;
        self
    }
}

/// A load attached to a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Load {
    pub id: LoadId,
    pub name: String,
    pub bus: BusId,
    /// Active demand (per-unit)
    pub p_pu: f64,
    /// Reactive demand (per-unit)
    pub q_pu: f64,
    /// Whether this load follows system imbalance (conforming load)
    pub conforming: bool,
}

impl Load {
    pub fn new(id: LoadId, name: impl Into<String>, bus: BusId, p_pu: f64, q_pu: f64) -> Self {
        Self {
            id,
            name: name.into(),
            bus,
            p_pu,
            q_pu,
            conforming: true,
        }
    }
}

/// A switched shunt compensator at a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shunt {
    pub id: ShuntId,
    pub name: String,
    pub bus: BusId,
    /// Susceptance (per-unit); positive = capacitive injection
    pub b_pu: f64,
    /// Susceptance change per section
    pub section_b_pu: f64,
    /// Reachable susceptance range
    pub bmin_pu: f64,
    pub bmax_pu: f64,
    /// Bus whose voltage this shunt regulates, if controllable
    pub controlled_bus: Option<BusId>,
    /// Voltage target at the controlled bus (per-unit)
    pub target_v_pu: f64,
}

impl Shunt {
    pub fn fixed(id: ShuntId, name: impl Into<String>, bus: BusId, b_pu: f64) -> Self {
        Self {
            id,
            name: name.into(),
            bus,
            b_pu,
            section_b_pu: 0.0,
            bmin_pu: b_pu,
            bmax_pu: b_pu,
            controlled_bus: None,
            target_v_pu: 1.0,
        }
    }
}

/// Interchange area with a net-interchange target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub name: String,
    /// Net interchange target (per-unit; positive = exporting)
    pub interchange_target_pu: f64,
}

/// Node types in the network graph
#[derive(Debug, Clone)]
pub enum Node {
    Bus(Bus),
    Gen(Gen),
    Load(Load),
    Shunt(Shunt),
}

/// Edge types in the network graph
#[derive(Debug, Clone)]
pub enum Edge {
    Branch(Branch),
}

/// The main network container: an undirected multigraph plus area metadata.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub graph: Graph<Node, Edge, Undirected>,
    pub areas: Vec<Area>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bus node; returns its graph index for wiring branches.
    pub fn add_bus(&mut self, bus: Bus) -> NodeIndex {
        self.graph.add_node(Node::Bus(bus))
    }

    pub fn add_gen(&mut self, gen: Gen) -> NodeIndex {
        self.graph.add_node(Node::Gen(gen))
    }

    pub fn add_load(&mut self, load: Load) -> NodeIndex {
        self.graph.add_node(Node::Load(load))
    }

    pub fn add_shunt(&mut self, shunt: Shunt) -> NodeIndex {
        self.graph.add_node(Node::Shunt(shunt))
    }

    /// Add a branch, wiring it between its terminal buses by id.
    pub fn add_branch(&mut self, branch: Branch) -> LfResult<EdgeIndex> {
        let from = self
            .bus_node(branch.from_bus)
            .ok_or_else(|| LfError::Network(format!("bus {} not found", branch.from_bus.value())))?;
        let to = self
            .bus_node(branch.to_bus)
            .ok_or_else(|| LfError::Network(format!("bus {} not found", branch.to_bus.value())))?;
        Ok(self.graph.add_edge(from, to, Edge::Branch(branch)))
    }

    /// Graph index of a bus node.
    pub fn bus_node(&self, id: BusId) -> Option<NodeIndex> {
        self.graph.node_indices().find(|&idx| {
            matches!(&self.graph[idx], Node::Bus(bus) if bus.id == id)
        })
    }

    /// Iterate buses in graph order.
    pub fn buses(&self) -> impl Iterator<Item = &Bus> {
        self.graph.node_weights().filter_map(|n| match n {
            Node::Bus(bus) => Some(bus),
            _ => None,
        })
    }

    pub fn gens(&self) -> impl Iterator<Item = &Gen> {
        self.graph.node_weights().filter_map(|n| match n {
            Node::Gen(gen) => Some(gen),
            _ => None,
        })
    }

    pub fn loads(&self) -> impl Iterator<Item = &Load> {
        self.graph.node_weights().filter_map(|n| match n {
            Node::Load(load) => Some(load),
            _ => None,
        })
    }

    pub fn shunts(&self) -> impl Iterator<Item = &Shunt> {
        self.graph.node_weights().filter_map(|n| match n {
            Node::Shunt(shunt) => Some(shunt),
            _ => None,
        })
    }

    /// Iterate in-service branches.
    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.graph.edge_weights().filter_map(|e| match e {
            Edge::Branch(branch) => branch.status.then_some(branch),
        })
    }

    /// Iterate all branches regardless of status.
    pub fn all_branches(&self) -> impl Iterator<Item = &Branch> {
        self.graph.edge_weights().map(|e| match e {
            Edge::Branch(branch) => branch,
        })
    }

    /// Flip a branch in or out of service.
    pub fn set_branch_status(&mut self, id: BranchId, status: bool) -> LfResult<()> {
        for edge in self.graph.edge_weights_mut() {
            let Edge::Branch(branch) = edge;
            if branch.id == id {
                branch.status = status;
                return Ok(());
            }
        }
        Err(LfError::Network(format!("branch {} not found", id.value())))
    }

    /// Write computed bus state back into the bus structs.
    pub fn update_bus_state(&mut self, v_pu: &HashMap<BusId, f64>, angle_rad: &HashMap<BusId, f64>) {
        for node in self.graph.node_weights_mut() {
            if let Node::Bus(bus) = node {
                if let Some(&v) = v_pu.get(&bus.id) {
                    bus.v_pu = v;
                }
                if let Some(&a) = angle_rad.get(&bus.id) {
                    bus.angle_rad = a;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bus_network() -> Network {
        let mut network = Network::new();
        let b1 = network.add_bus(Bus::new(BusId::new(1), "b1"));
        let b2 = network.add_bus(Bus::new(BusId::new(2), "b2"));
        network.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(0.5)
                .with_target_v(1.0),
        );
        network.add_load(Load::new(LoadId::new(1), "l1", BusId::new(2), 0.5, 0.1));
        network.graph.add_edge(
            b1,
            b2,
            Edge::Branch(Branch::new(
                BranchId::new(1),
                "line",
                BusId::new(1),
                BusId::new(2),
                0.01,
                0.1,
            )),
        );
        network
    }

    #[test]
    fn test_element_iteration() {
        let network = two_bus_network();
        assert_eq!(network.buses().count(), 2);
        assert_eq!(network.gens().count(), 1);
        assert_eq!(network.loads().count(), 1);
        assert_eq!(network.branches().count(), 1);
    }

    #[test]
    fn test_branch_status_toggle() {
        let mut network = two_bus_network();
        network.set_branch_status(BranchId::new(1), false).unwrap();
        assert_eq!(network.branches().count(), 0);
        assert_eq!(network.all_branches().count(), 1);
        network.set_branch_status(BranchId::new(1), true).unwrap();
        assert_eq!(network.branches().count(), 1);
    }

    #[test]
    fn test_unknown_branch_is_error() {
        let mut network = two_bus_network();
        assert!(network.set_branch_status(BranchId::new(42), false).is_err());
    }

    #[test]
    fn test_zero_impedance_detection() {
        let branch = Branch::new(
            BranchId::new(1),
            "tie",
            BusId::new(1),
            BusId::new(2),
            0.0,
            0.0,
        );
        assert!(branch.is_zero_impedance());
        let line = Branch::new(
            BranchId::new(2),
            "line",
            BusId::new(1),
            BusId::new(2),
            0.0,
            0.1,
        );
        assert!(!line.is_zero_impedance());
    }

    #[test]
    fn test_bus_state_writeback() {
        let mut network = two_bus_network();
        let mut v = HashMap::new();
        let mut a = HashMap::new();
        v.insert(BusId::new(2), 0.97);
        a.insert(BusId::new(2), -0.03);
        network.update_bus_state(&v, &a);
        let bus2 = network.buses().find(|b| b.id == BusId::new(2)).unwrap();
        assert!((bus2.v_pu - 0.97).abs() < 1e-12);
        assert!((bus2.angle_rad + 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_id_serde_roundtrip() {
        let id = BusId::new(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "7");
        let back: BusId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
