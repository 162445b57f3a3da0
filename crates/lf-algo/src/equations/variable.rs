//! Variables: the scalar unknowns of the equation system.

use serde::{Deserialize, Serialize};

/// Typed role of a variable. The ordering of this enum, together with the
/// owning element number, defines the total order used for column
/// assignment, so index assignment is reproducible across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VariableType {
    /// Bus voltage magnitude (per-unit)
    BusV,
    /// Bus voltage angle (radians)
    BusPhi,
    /// Shunt susceptance (per-unit)
    ShuntB,
    /// Transformer tap ratio
    BranchRho,
    /// Transformer phase shift (radians)
    BranchAlpha,
    /// Active flow through a zero-impedance branch (per-unit)
    DummyP,
    /// Reactive flow through a zero-impedance branch (per-unit)
    DummyQ,
}

/// Arena handle for a variable. Stable for the life of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) usize);

impl VarId {
    /// Position in the registry arena (also the state-vector slot).
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// One scalar unknown: identity is (owning element, role); the assigned
/// matrix column mutates as the active equation set changes.
#[derive(Debug)]
pub struct Variable {
    pub element: usize,
    pub var_type: VariableType,
    pub(crate) column: Option<usize>,
}

impl Variable {
    pub(crate) fn new(element: usize, var_type: VariableType) -> Self {
        Self {
            element,
            var_type,
            column: None,
        }
    }

    /// Assigned matrix column, or `None` while the variable is outside the
    /// active set.
    pub fn column(&self) -> Option<usize> {
        self.column
    }

    /// Sort key for reproducible column assignment.
    pub(crate) fn order_key(&self) -> (usize, VariableType) {
        (self.element, self.var_type)
    }
}
