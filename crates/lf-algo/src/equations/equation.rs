//! Equations: the scalar constraints of the equation system.

use super::term::EquationTerm;
use serde::{Deserialize, Serialize};

/// Typed role of an equation. Ordering (with the owning element number)
/// defines the total order used for row assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EquationType {
    /// Bus active power balance: sum of outgoing flows = generation - load
    BusP,
    /// Bus reactive power balance
    BusQ,
    /// Bus voltage magnitude target (voltage-controlled bus)
    BusVTarget,
    /// Bus voltage angle target (slack bus reference)
    BusPhiTarget,
    /// Shunt susceptance frozen at its current value
    ShuntBTarget,
    /// Transformer ratio frozen at its current value
    BranchRhoTarget,
    /// Phase shift frozen at its current value
    BranchAlphaTarget,
    /// Branch active flow target (phase-shifter flow control)
    BranchPTarget,
    /// Zero-impedance branch angle coupling: phi1 - phi2 = 0
    ZeroPhi,
    /// Zero-impedance branch voltage coupling: v1 - v2 = 0
    ZeroV,
}

/// Arena handle for an equation. Stable for the life of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EqId(pub(crate) usize);

impl EqId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A term slot: the registry manages the active flag, the term itself is
/// supplied by the device library.
#[derive(Debug)]
pub struct TermSlot {
    pub(crate) active: bool,
    pub(crate) term: Box<dyn EquationTerm>,
}

impl TermSlot {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn term(&self) -> &dyn EquationTerm {
        self.term.as_ref()
    }
}

/// One scalar constraint: a sum of terms with a target value. The assigned
/// matrix row mutates as the active set changes; identity is
/// (owning element, role).
#[derive(Debug)]
pub struct Equation {
    pub element: usize,
    pub eq_type: EquationType,
    pub(crate) row: Option<usize>,
    pub(crate) active: bool,
    pub(crate) removed: bool,
    pub(crate) target: f64,
    pub(crate) terms: Vec<TermSlot>,
}

impl Equation {
    pub(crate) fn new(element: usize, eq_type: EquationType) -> Self {
        Self {
            element,
            eq_type,
            row: None,
            active: true,
            removed: false,
            target: 0.0,
            terms: Vec::new(),
        }
    }

    /// Assigned matrix row, or `None` while the equation is inactive.
    pub fn row(&self) -> Option<usize> {
        self.row
    }

    pub fn is_active(&self) -> bool {
        self.active && !self.removed
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn terms(&self) -> &[TermSlot] {
        &self.terms
    }

    /// Whether this equation, if activated, would bind at least one
    /// variable into the active set.
    pub fn has_active_term(&self) -> bool {
        self.terms.iter().any(|t| t.active)
    }

    /// Sort key for reproducible row assignment.
    pub(crate) fn order_key(&self) -> (usize, EquationType) {
        (self.element, self.eq_type)
    }
}
