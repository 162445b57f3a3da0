//! Sparse linear algebra: Jacobian management, the DC susceptance matrix
//! and the dense LU kernel they both factor through.

pub mod jacobian;
pub mod lu;
pub mod susceptance;

pub use jacobian::{JacobianError, JacobianMatrix, MatrixValidity};
pub use lu::{LuError, LuFactors};
pub use susceptance::{SparseSusceptance, SusceptanceError};
