//! Load flow solvers: the Newton-Raphson core, the outer-loop protocol
//! around it, and the island-aware AC driver.

pub mod ac;
pub mod newton;
pub mod outer;

pub use ac::{AcLoadFlowConfig, AcLoadFlowSolver, ComponentResult, LoadFlowResult, StartMode};
pub use newton::{NewtonRaphson, NewtonRaphsonConfig, NewtonResult, NonlinearSolver, SolverStatus};
pub use outer::{OuterLoop, OuterLoopConfig, OuterLoopRunner, OuterLoopStatus};
