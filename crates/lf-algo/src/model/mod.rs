//! Network-to-equations mapping: the AC model, its flow terms and the
//! voltage initializers.

pub mod ac;
pub mod ac_terms;
pub mod init;

pub use ac::{AcModel, BusMode, ControlKind, GenInfo};
pub use ac_terms::{BranchSide, ClosedBranchFlowTerm, FlowKind, Parameter, ShuntFlowTerm};
pub use init::{DcAngleInitializer, FlatStart, PreviousValues, VoltageInitializer};
