//! # lf-algo: Steady-State Load Flow Algorithms
//!
//! The solver companion to [`lf_core`]: a symbolic equation system, an AC
//! network model over it, a Newton-Raphson core with outer-loop controls,
//! and a DC contingency engine.
//!
//! ## Architecture
//!
//! - [`equations`] - variable/equation registry with dynamic activation,
//!   change listeners, and the dense state vector
//! - [`model`] - the AC model: bus balances, branch flow terms, discrete
//!   controls, voltage initializers
//! - [`sparse`] - sparse assembly of the Jacobian and B' matrices plus the
//!   dense LU kernel behind both
//! - [`solver`] - Newton-Raphson, the outer-loop protocol, and the
//!   island-parallel AC driver
//! - [`contingency`] - Woodbury rank-k post-contingency re-solves with
//!   connectivity-break screening
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lf_algo::solver::{AcLoadFlowConfig, AcLoadFlowSolver};
//! use lf_core::Network;
//!
//! let mut network = Network::new();
//! // ... populate buses, branches, gens, loads ...
//! let solver = AcLoadFlowSolver::new(AcLoadFlowConfig::default());
//! let result = solver.solve(&mut network).unwrap();
//! assert!(result.fully_converged());
//! ```

pub mod contingency;
pub mod equations;
pub mod model;
pub mod solver;
pub mod sparse;

pub use contingency::{Contingency, ContingencyAnalysis, ContingencyOutcome, WoodburyEngine};
pub use solver::{AcLoadFlowConfig, AcLoadFlowSolver, LoadFlowResult, SolverStatus};
