//! Voltage initialization strategies for the Newton-Raphson start point.

use crate::equations::StateVector;
use crate::model::ac::AcModel;
use crate::sparse::lu::LuFactors;
use crate::sparse::susceptance::SparseSusceptance;
use lf_core::{BusId, LfError, LfResult, Network};
use std::collections::HashMap;
use tracing::debug;

/// Seeds the state vector before the first Newton-Raphson iteration.
pub trait VoltageInitializer {
    fn initialize(
        &self,
        network: &Network,
        model: &AcModel,
        state: &mut StateVector,
    ) -> LfResult<()>;
}

/// Flat start: magnitude at setpoint (or 1.0), angle zero.
#[derive(Debug, Default)]
pub struct FlatStart;

impl VoltageInitializer for FlatStart {
    fn initialize(
        &self,
        _network: &Network,
        model: &AcModel,
        state: &mut StateVector,
    ) -> LfResult<()> {
        for &bus in model.buses() {
            let v_set = model
                .gens_at(bus)
                .iter()
                .find_map(|g| g.target_v_pu)
                .unwrap_or(1.0);
            state.set(model.v_var(bus), v_set);
            state.set(model.phi_var(bus), 0.0);
        }
        Ok(())
    }
}

/// Warm start from the voltages stored on the network, typically the
/// result of an earlier solve.
#[derive(Debug, Default)]
pub struct PreviousValues;

impl VoltageInitializer for PreviousValues {
    fn initialize(
        &self,
        network: &Network,
        model: &AcModel,
        state: &mut StateVector,
    ) -> LfResult<()> {
        let stored: HashMap<BusId, (f64, f64)> = network
            .buses()
            .map(|b| (b.id, (b.v_pu, b.angle_rad)))
            .collect();
        for &bus in model.buses() {
            if let Some(&(v, a)) = stored.get(&bus) {
                state.set(model.v_var(bus), if v > 0.0 { v } else { 1.0 });
                state.set(model.phi_var(bus), a);
            }
        }
        Ok(())
    }
}

/// Seeds angles from a DC solve, magnitudes flat. Helps convergence on
/// heavily loaded networks where the flat angle profile is far off.
#[derive(Debug, Default)]
pub struct DcAngleInitializer;

impl VoltageInitializer for DcAngleInitializer {
    fn initialize(
        &self,
        network: &Network,
        model: &AcModel,
        state: &mut StateVector,
    ) -> LfResult<()> {
        FlatStart.initialize(network, model, state)?;

        let b_prime = SparseSusceptance::from_network(network, model.slack())
            .map_err(|e| LfError::Solver(e.to_string()))?;
        let (dense, order) = b_prime.reduced_dense();
        let factors = LuFactors::factorize(&dense, order.len())
            .map_err(|e| LfError::Solver(e.to_string()))?;

        let injections = b_prime.injections(network);
        let mut rhs: Vec<f64> = (0..b_prime.n_bus())
            .filter_map(|idx| b_prime.reduced_index(idx).map(|_| injections[idx]))
            .collect();
        factors
            .solve_in_place(&mut rhs)
            .map_err(|e| LfError::Solver(e.to_string()))?;

        let angles: HashMap<BusId, f64> = order.iter().copied().zip(rhs).collect();
        for &bus in model.buses() {
            if let Some(&angle) = angles.get(&bus) {
                state.set(model.phi_var(bus), angle);
            }
        }
        debug!(buses = model.buses().len(), "dc angle start applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::EquationSystem;
    use lf_core::{Branch, BranchId, Bus, Gen, GenId, Load, LoadId};

    fn network() -> Network {
        let mut n = Network::new();
        n.add_bus(Bus::new(BusId::new(1), "b1"));
        n.add_bus(Bus::new(BusId::new(2), "b2"));
        n.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(1.0)
                .with_target_v(1.03),
        );
        n.add_load(Load::new(LoadId::new(1), "l1", BusId::new(2), 1.0, 0.3));
        n.add_branch(Branch::new(
            BranchId::new(1),
            "line",
            BusId::new(1),
            BusId::new(2),
            0.0,
            0.2,
        ))
        .unwrap();
        n
    }

    #[test]
    fn test_flat_start() {
        let network = network();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (model, mut state) = AcModel::build(&network, &island, &mut system).unwrap();
        FlatStart.initialize(&network, &model, &mut state).unwrap();
        assert!((state.get(model.v_var(BusId::new(1))) - 1.03).abs() < 1e-12);
        assert!((state.get(model.v_var(BusId::new(2))) - 1.0).abs() < 1e-12);
        assert_eq!(state.get(model.phi_var(BusId::new(2))), 0.0);
    }

    #[test]
    fn test_dc_angle_start() {
        let network = network();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (model, mut state) = AcModel::build(&network, &island, &mut system).unwrap();
        DcAngleInitializer
            .initialize(&network, &model, &mut state)
            .unwrap();
        // P = B theta: 1.0 p.u. over x = 0.2 -> theta2 = -0.2 rad.
        let theta2 = state.get(model.phi_var(BusId::new(2)));
        assert!((theta2 + 0.2).abs() < 1e-9);
        assert_eq!(state.get(model.phi_var(BusId::new(1))), 0.0);
    }
}
