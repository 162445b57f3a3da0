//! Symbolic equation system: variables, equations, terms and the registry
//! that assigns matrix rows and columns to the active subset.

pub mod equation;
pub mod system;
pub mod term;
pub mod variable;

pub use equation::{EqId, Equation, EquationType, TermSlot};
pub use system::{EquationSystem, EquationSystemListener, SystemEvent, TargetVector};
pub use term::{EquationTerm, StateVector, VariableTerm};
pub use variable::{VarId, Variable, VariableType};
