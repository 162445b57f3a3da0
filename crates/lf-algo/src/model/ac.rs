//! AC load-flow model: maps one island of the network onto the equation
//! system.
//!
//! Per bus, a voltage magnitude and angle variable plus active and
//! reactive balance equations are always created; the bus mode decides
//! which are active:
//!
//! - slack: angle reference active, active balance inactive (its mismatch
//!   is the island imbalance),
//! - voltage-controlled (PV): voltage target active, reactive balance
//!   inactive (but still evaluable for limit checks),
//! - load (PQ): both balances active.
//!
//! Zero-impedance branches get dummy flow variables tied into the terminal
//! balances and angle/magnitude coupling equations, so both terminal buses
//! solve to the exact same voltage while the branch flow stays defined.
//!
//! Controlled transformers, phase shifters and switched shunts start in
//! their continuous phase: the control variable is free and a target
//! equation at the controlled quantity is active. The discrete outer loops
//! later freeze them through [`AcModel::freeze_control`].

use crate::equations::{
    EqId, EquationSystem, EquationType, StateVector, VarId, VariableTerm, VariableType,
};
use crate::model::ac_terms::{BranchSide, ClosedBranchFlowTerm, FlowKind, Parameter, ShuntFlowTerm};
use lf_core::{BranchId, BusId, GenId, LfError, LfResult, Network, ShuntId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Role of a bus in the solved system. PV buses may be switched to PQ by
/// the reactive-limit outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Slack,
    Pv,
    Pq,
}

/// Snapshot of one generating unit, used for limit checks and reactive
/// splitting.
#[derive(Debug, Clone)]
pub struct GenInfo {
    pub id: GenId,
    pub qmin_pu: f64,
    pub qmax_pu: f64,
    pub target_v_pu: Option<f64>,
}

/// A control that can be frozen: the continuous target equation is
/// swapped for an equation pinning the control variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    TransformerVoltage(BranchId),
    ShuntVoltage(ShuntId),
    PhaseShifterFlow(BranchId),
}

#[derive(Debug)]
struct Control {
    var: VarId,
    /// Equation active during the continuous phase
    continuous_eq: EqId,
    /// Equation pinning the control variable once frozen
    freeze_eq: EqId,
    frozen: bool,
}

enum FlowRecord {
    Closed {
        p: ClosedBranchFlowTerm,
        q: ClosedBranchFlowTerm,
        p_to: ClosedBranchFlowTerm,
    },
    ZeroImpedance {
        p: VarId,
        q: VarId,
    },
}

/// One island of the network, expressed as equations and variables.
pub struct AcModel {
    buses: Vec<BusId>,
    slack: BusId,
    modes: HashMap<BusId, BusMode>,
    v_var: HashMap<BusId, VarId>,
    phi_var: HashMap<BusId, VarId>,
    p_eq: HashMap<BusId, EqId>,
    q_eq: HashMap<BusId, EqId>,
    v_target_eq: HashMap<BusId, EqId>,
    load_p: HashMap<BusId, f64>,
    load_q: HashMap<BusId, f64>,
    conforming_load_p: HashMap<BusId, f64>,
    bus_gens: HashMap<BusId, Vec<GenInfo>>,
    flows: Vec<FlowRecord>,
    flow_index: HashMap<BranchId, usize>,
    controls: HashMap<ControlKind, Control>,
}

impl AcModel {
    /// Build the model for one island. Fails when the island has no
    /// voltage-controlling generator to serve as the angle reference.
    pub fn build(
        network: &Network,
        island: &[BusId],
        system: &mut EquationSystem,
    ) -> LfResult<(AcModel, StateVector)> {
        let island_set: HashSet<BusId> = island.iter().copied().collect();
        let mut buses: Vec<BusId> = island.to_vec();
        buses.sort_by_key(|id| id.value());

        // Aggregate loads and generators per bus.
        let mut load_p: HashMap<BusId, f64> = HashMap::new();
        let mut load_q: HashMap<BusId, f64> = HashMap::new();
        let mut conforming_load_p: HashMap<BusId, f64> = HashMap::new();
        for load in network.loads().filter(|l| island_set.contains(&l.bus)) {
            *load_p.entry(load.bus).or_default() += load.p_pu;
            *load_q.entry(load.bus).or_default() += load.q_pu;
            if load.conforming {
                *conforming_load_p.entry(load.bus).or_default() += load.p_pu;
            }
        }

        let mut bus_gens: HashMap<BusId, Vec<GenInfo>> = HashMap::new();
        let mut gen_p: HashMap<BusId, f64> = HashMap::new();
        let mut gen_q: HashMap<BusId, f64> = HashMap::new();
        let mut slack = None;
        for gen in network.gens().filter(|g| island_set.contains(&g.bus)) {
            *gen_p.entry(gen.bus).or_default() += gen.target_p_pu;
            if gen.target_v_pu.is_none() {
                *gen_q.entry(gen.bus).or_default() += gen.target_q_pu;
            }
            if gen.target_v_pu.is_some() && slack.is_none() {
                slack = Some(gen.bus);
            }
            bus_gens.entry(gen.bus).or_default().push(GenInfo {
                id: gen.id,
                qmin_pu: gen.qmin_pu,
                qmax_pu: gen.qmax_pu,
                target_v_pu: gen.target_v_pu,
            });
        }
        let slack = slack.ok_or_else(|| {
            LfError::Solver("island has no voltage-controlling generator".into())
        })?;

        let mut model = AcModel {
            buses: buses.clone(),
            slack,
            modes: HashMap::new(),
            v_var: HashMap::new(),
            phi_var: HashMap::new(),
            p_eq: HashMap::new(),
            q_eq: HashMap::new(),
            v_target_eq: HashMap::new(),
            load_p,
            load_q,
            conforming_load_p,
            bus_gens,
            flows: Vec::new(),
            flow_index: HashMap::new(),
            controls: HashMap::new(),
        };
        let mut state = StateVector::new();

        model.build_buses(network, system, &gen_p, &gen_q);
        model.build_branches(network, &island_set, system)?;
        model.build_shunts(network, &island_set, system);

        state.resize(system.variable_count());
        model.init_state(network, &mut state);
        debug!(
            buses = model.buses.len(),
            slack = model.slack.value(),
            "ac model built"
        );
        Ok((model, state))
    }

    fn build_buses(
        &mut self,
        network: &Network,
        system: &mut EquationSystem,
        gen_p: &HashMap<BusId, f64>,
        gen_q: &HashMap<BusId, f64>,
    ) {
        for &bus in &self.buses {
            let el = bus.value();
            let v = system.create_variable(el, VariableType::BusV);
            let phi = system.create_variable(el, VariableType::BusPhi);
            self.v_var.insert(bus, v);
            self.phi_var.insert(bus, phi);

            let p_eq = system.create_equation(el, EquationType::BusP);
            let q_eq = system.create_equation(el, EquationType::BusQ);
            let p_target = gen_p.get(&bus).copied().unwrap_or(0.0)
                - self.load_p.get(&bus).copied().unwrap_or(0.0);
            let q_target = gen_q.get(&bus).copied().unwrap_or(0.0)
                - self.load_q.get(&bus).copied().unwrap_or(0.0);
            system.set_target(p_eq, p_target);
            system.set_target(q_eq, q_target);
            self.p_eq.insert(bus, p_eq);
            self.q_eq.insert(bus, q_eq);

            let target_v = self
                .bus_gens
                .get(&bus)
                .and_then(|gens| gens.iter().find_map(|g| g.target_v_pu));

            let mode = if bus == self.slack {
                BusMode::Slack
            } else if target_v.is_some() {
                BusMode::Pv
            } else {
                BusMode::Pq
            };
            self.modes.insert(bus, mode);

            if let Some(v_set) = target_v {
                let v_eq = system.create_equation(el, EquationType::BusVTarget);
                system.add_term(v_eq, Box::new(VariableTerm::new(v, 1.0)));
                system.set_target(v_eq, v_set);
                self.v_target_eq.insert(bus, v_eq);
                system.set_equation_active(q_eq, false);
            }

            match mode {
                BusMode::Slack => {
                    let phi_eq = system.create_equation(el, EquationType::BusPhiTarget);
                    system.add_term(phi_eq, Box::new(VariableTerm::new(phi, 1.0)));
                    system.set_target(phi_eq, 0.0);
                    system.set_equation_active(p_eq, false);
                }
                BusMode::Pv | BusMode::Pq => {}
            }
        }
    }

    fn build_branches(
        &mut self,
        network: &Network,
        island: &HashSet<BusId>,
        system: &mut EquationSystem,
    ) -> LfResult<()> {
        for branch in network.branches() {
            if !island.contains(&branch.from_bus) || !island.contains(&branch.to_bus) {
                continue;
            }
            if branch.is_zero_impedance() {
                self.build_zero_impedance_branch(branch.id, branch.from_bus, branch.to_bus, system);
                continue;
            }

            let el = branch.id.value();
            let v1 = self.v_var[&branch.from_bus];
            let ph1 = self.phi_var[&branch.from_bus];
            let v2 = self.v_var[&branch.to_bus];
            let ph2 = self.phi_var[&branch.to_bus];

            // Controlled parameters become variables; otherwise fixed data.
            let rho = if let Some(tc) = &branch.tap_changer {
                let rho_var = system.create_variable(el, VariableType::BranchRho);
                let freeze = system.create_equation(el, EquationType::BranchRhoTarget);
                system.add_term(freeze, Box::new(VariableTerm::new(rho_var, 1.0)));
                system.set_target(freeze, branch.tap_ratio);
                system.set_equation_active(freeze, false);

                if self.v_target_eq.contains_key(&tc.controlled_bus)
                    || !island.contains(&tc.controlled_bus)
                {
                    // Controlled bus already regulated (or outside the
                    // island): keep the ratio pinned instead.
                    warn!(
                        branch = el,
                        bus = tc.controlled_bus.value(),
                        "transformer control target unavailable, ratio frozen"
                    );
                    system.set_equation_active(freeze, true);
                    self.controls.insert(
                        ControlKind::TransformerVoltage(branch.id),
                        Control {
                            var: rho_var,
                            continuous_eq: freeze,
                            freeze_eq: freeze,
                            frozen: true,
                        },
                    );
                } else {
                    let v_ctl = self.v_var[&tc.controlled_bus];
                    let v_eq = system
                        .create_equation(tc.controlled_bus.value(), EquationType::BusVTarget);
                    system.add_term(v_eq, Box::new(VariableTerm::new(v_ctl, 1.0)));
                    system.set_target(v_eq, tc.target_v_pu);
                    self.controls.insert(
                        ControlKind::TransformerVoltage(branch.id),
                        Control {
                            var: rho_var,
                            continuous_eq: v_eq,
                            freeze_eq: freeze,
                            frozen: false,
                        },
                    );
                }
                Parameter::Var(rho_var)
            } else {
                Parameter::Fixed(branch.tap_ratio)
            };

            let alpha = if let Some(pc) = &branch.phase_control {
                let alpha_var = system.create_variable(el, VariableType::BranchAlpha);
                let freeze = system.create_equation(el, EquationType::BranchAlphaTarget);
                system.add_term(freeze, Box::new(VariableTerm::new(alpha_var, 1.0)));
                system.set_target(freeze, branch.phase_shift_rad);
                system.set_equation_active(freeze, false);

                let flow_eq = system.create_equation(el, EquationType::BranchPTarget);
                system.add_term(
                    flow_eq,
                    Box::new(ClosedBranchFlowTerm::new(
                        branch,
                        FlowKind::ActivePower,
                        BranchSide::From,
                        v1,
                        ph1,
                        v2,
                        ph2,
                        rho,
                        Parameter::Var(alpha_var),
                    )),
                );
                system.set_target(flow_eq, pc.target_p_pu);
                self.controls.insert(
                    ControlKind::PhaseShifterFlow(branch.id),
                    Control {
                        var: alpha_var,
                        continuous_eq: flow_eq,
                        freeze_eq: freeze,
                        frozen: false,
                    },
                );
                Parameter::Var(alpha_var)
            } else {
                Parameter::Fixed(branch.phase_shift_rad)
            };

            for (side, bus) in [
                (BranchSide::From, branch.from_bus),
                (BranchSide::To, branch.to_bus),
            ] {
                let p_term = ClosedBranchFlowTerm::new(
                    branch,
                    FlowKind::ActivePower,
                    side,
                    v1,
                    ph1,
                    v2,
                    ph2,
                    rho,
                    alpha,
                );
                let q_term = ClosedBranchFlowTerm::new(
                    branch,
                    FlowKind::ReactivePower,
                    side,
                    v1,
                    ph1,
                    v2,
                    ph2,
                    rho,
                    alpha,
                );
                system.add_term(self.p_eq[&bus], Box::new(p_term));
                system.add_term(self.q_eq[&bus], Box::new(q_term));
            }

            // Separate copies for result extraction.
            self.flow_index.insert(branch.id, self.flows.len());
            self.flows.push(FlowRecord::Closed {
                p: ClosedBranchFlowTerm::new(
                    branch,
                    FlowKind::ActivePower,
                    BranchSide::From,
                    v1,
                    ph1,
                    v2,
                    ph2,
                    rho,
                    alpha,
                ),
                q: ClosedBranchFlowTerm::new(
                    branch,
                    FlowKind::ReactivePower,
                    BranchSide::From,
                    v1,
                    ph1,
                    v2,
                    ph2,
                    rho,
                    alpha,
                ),
                p_to: ClosedBranchFlowTerm::new(
                    branch,
                    FlowKind::ActivePower,
                    BranchSide::To,
                    v1,
                    ph1,
                    v2,
                    ph2,
                    rho,
                    alpha,
                ),
            });
        }
        Ok(())
    }

    fn build_zero_impedance_branch(
        &mut self,
        id: BranchId,
        from: BusId,
        to: BusId,
        system: &mut EquationSystem,
    ) {
        let el = id.value();
        let dummy_p = system.create_variable(el, VariableType::DummyP);
        let dummy_q = system.create_variable(el, VariableType::DummyQ);

        // Flow leaves the from bus and enters the to bus.
        system.add_term(self.p_eq[&from], Box::new(VariableTerm::new(dummy_p, 1.0)));
        system.add_term(self.p_eq[&to], Box::new(VariableTerm::new(dummy_p, -1.0)));
        system.add_term(self.q_eq[&from], Box::new(VariableTerm::new(dummy_q, 1.0)));
        system.add_term(self.q_eq[&to], Box::new(VariableTerm::new(dummy_q, -1.0)));

        let phi_eq = system.create_equation(el, EquationType::ZeroPhi);
        system.add_term(phi_eq, Box::new(VariableTerm::new(self.phi_var[&from], 1.0)));
        system.add_term(phi_eq, Box::new(VariableTerm::new(self.phi_var[&to], -1.0)));

        let v_eq = system.create_equation(el, EquationType::ZeroV);
        system.add_term(v_eq, Box::new(VariableTerm::new(self.v_var[&from], 1.0)));
        system.add_term(v_eq, Box::new(VariableTerm::new(self.v_var[&to], -1.0)));

        self.flow_index.insert(id, self.flows.len());
        self.flows.push(FlowRecord::ZeroImpedance {
            p: dummy_p,
            q: dummy_q,
        });
    }

    fn build_shunts(
        &mut self,
        network: &Network,
        island: &HashSet<BusId>,
        system: &mut EquationSystem,
    ) {
        for shunt in network.shunts().filter(|s| island.contains(&s.bus)) {
            let v = self.v_var[&shunt.bus];
            let controllable = shunt
                .controlled_bus
                .filter(|b| island.contains(b) && !self.v_target_eq.contains_key(b));
            if let Some(controlled_bus) = controllable {
                let el = shunt.id.value();
                let b_var = system.create_variable(el, VariableType::ShuntB);
                let freeze = system.create_equation(el, EquationType::ShuntBTarget);
                system.add_term(freeze, Box::new(VariableTerm::new(b_var, 1.0)));
                system.set_target(freeze, shunt.b_pu);
                system.set_equation_active(freeze, false);

                let v_ctl = self.v_var[&controlled_bus];
                let v_eq =
                    system.create_equation(controlled_bus.value(), EquationType::BusVTarget);
                system.add_term(v_eq, Box::new(VariableTerm::new(v_ctl, 1.0)));
                system.set_target(v_eq, shunt.target_v_pu);

                system.add_term(
                    self.q_eq[&shunt.bus],
                    Box::new(ShuntFlowTerm::new(Parameter::Var(b_var), v)),
                );
                self.controls.insert(
                    ControlKind::ShuntVoltage(shunt.id),
                    Control {
                        var: b_var,
                        continuous_eq: v_eq,
                        freeze_eq: freeze,
                        frozen: false,
                    },
                );
            } else {
                system.add_term(
                    self.q_eq[&shunt.bus],
                    Box::new(ShuntFlowTerm::new(Parameter::Fixed(shunt.b_pu), v)),
                );
            }
        }
    }

    fn init_state(&self, network: &Network, state: &mut StateVector) {
        let bus_v: HashMap<BusId, f64> = network.buses().map(|b| (b.id, b.v_pu)).collect();
        for &bus in &self.buses {
            let v0 = bus_v.get(&bus).copied().unwrap_or(1.0);
            let v_set = self
                .bus_gens
                .get(&bus)
                .and_then(|gens| gens.iter().find_map(|g| g.target_v_pu));
            state.set(self.v_var[&bus], v_set.unwrap_or(if v0 > 0.0 { v0 } else { 1.0 }));
            state.set(self.phi_var[&bus], 0.0);
        }

        let branch_by_id: HashMap<BranchId, (f64, f64)> = network
            .all_branches()
            .map(|b| (b.id, (b.tap_ratio, b.phase_shift_rad)))
            .collect();
        let shunt_b: HashMap<ShuntId, f64> = network.shunts().map(|s| (s.id, s.b_pu)).collect();
        for (kind, control) in &self.controls {
            let initial = match *kind {
                ControlKind::TransformerVoltage(id) => branch_by_id[&id].0,
                ControlKind::PhaseShifterFlow(id) => branch_by_id[&id].1,
                ControlKind::ShuntVoltage(id) => shunt_b[&id],
            };
            state.set(control.var, initial);
        }
    }

    // ---- accessors used by the solver and outer loops --------------------

    pub fn buses(&self) -> &[BusId] {
        &self.buses
    }

    pub fn slack(&self) -> BusId {
        self.slack
    }

    pub fn mode(&self, bus: BusId) -> BusMode {
        self.modes[&bus]
    }

    pub fn v_var(&self, bus: BusId) -> VarId {
        self.v_var[&bus]
    }

    pub fn phi_var(&self, bus: BusId) -> VarId {
        self.phi_var[&bus]
    }

    pub fn p_eq(&self, bus: BusId) -> EqId {
        self.p_eq[&bus]
    }

    pub fn q_eq(&self, bus: BusId) -> EqId {
        self.q_eq[&bus]
    }

    pub fn gens_at(&self, bus: BusId) -> &[GenInfo] {
        self.bus_gens.get(&bus).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn load_q(&self, bus: BusId) -> f64 {
        self.load_q.get(&bus).copied().unwrap_or(0.0)
    }

    pub fn conforming_load_p(&self, bus: BusId) -> f64 {
        self.conforming_load_p.get(&bus).copied().unwrap_or(0.0)
    }

    pub fn control_kinds(&self) -> Vec<ControlKind> {
        let mut kinds: Vec<ControlKind> = self.controls.keys().copied().collect();
        kinds.sort_by_key(|k| match *k {
            ControlKind::TransformerVoltage(id) => (0, id.value()),
            ControlKind::ShuntVoltage(id) => (1, id.value()),
            ControlKind::PhaseShifterFlow(id) => (2, id.value()),
        });
        kinds
    }

    pub fn control_var(&self, kind: ControlKind) -> Option<VarId> {
        self.controls.get(&kind).map(|c| c.var)
    }

    pub fn control_frozen(&self, kind: ControlKind) -> bool {
        self.controls.get(&kind).map(|c| c.frozen).unwrap_or(true)
    }

    /// Equation driving a control during its continuous phase. Inactive
    /// once frozen, but still evaluable (e.g. for the controlled flow).
    pub fn continuous_eq(&self, kind: ControlKind) -> Option<EqId> {
        self.controls.get(&kind).map(|c| c.continuous_eq)
    }

    /// Equation pinning a frozen control variable, if frozen.
    pub fn freeze_eq(&self, kind: ControlKind) -> Option<EqId> {
        self.controls
            .get(&kind)
            .filter(|c| c.frozen)
            .map(|c| c.freeze_eq)
    }

    /// Swap a control from its continuous phase to the frozen phase,
    /// pinning the control variable at its current value.
    pub fn freeze_control(
        &mut self,
        kind: ControlKind,
        system: &mut EquationSystem,
        state: &StateVector,
    ) {
        if let Some(control) = self.controls.get_mut(&kind) {
            if control.frozen {
                return;
            }
            system.set_equation_active(control.continuous_eq, false);
            system.set_equation_active(control.freeze_eq, true);
            system.set_target(control.freeze_eq, state.get(control.var));
            control.frozen = true;
        }
    }

    /// Net reactive power the network draws at a bus, from the (possibly
    /// inactive) reactive balance equation. The generation needed there is
    /// this value plus the local reactive load.
    pub fn bus_reactive_generation(
        &self,
        bus: BusId,
        system: &EquationSystem,
        state: &StateVector,
    ) -> f64 {
        system.eval_equation(self.q_eq[&bus], state) + self.load_q(bus)
    }

    /// Active power imbalance absorbed by the slack bus: the value of its
    /// inactive balance equation minus its injection target.
    pub fn slack_mismatch(&self, system: &EquationSystem, state: &StateVector) -> f64 {
        let eq = self.p_eq[&self.slack];
        system.eval_equation(eq, state) - system.target(eq)
    }

    /// Switch a voltage-controlled bus to PQ with its reactive generation
    /// pinned at `q_gen`. The reactive balance target becomes
    /// `q_gen - load_q`.
    pub fn switch_pv_to_pq(
        &mut self,
        bus: BusId,
        q_gen: f64,
        system: &mut EquationSystem,
    ) {
        debug_assert_eq!(self.modes[&bus], BusMode::Pv);
        if let Some(&v_eq) = self.v_target_eq.get(&bus) {
            system.set_equation_active(v_eq, false);
        }
        let q_eq = self.q_eq[&bus];
        system.set_target(q_eq, q_gen - self.load_q(bus));
        system.set_equation_active(q_eq, true);
        self.modes.insert(bus, BusMode::Pq);
    }

    /// Shift a bus active injection target (slack distribution, area
    /// interchange corrections).
    pub fn add_p_target(&self, bus: BusId, delta: f64, system: &mut EquationSystem) {
        let eq = self.p_eq[&bus];
        let target = system.target(eq) + delta;
        system.set_target(eq, target);
    }

    /// Active/reactive flow at the from terminal of a branch.
    pub fn branch_flow(&self, branch: BranchId, state: &StateVector) -> Option<(f64, f64)> {
        use crate::equations::EquationTerm;
        let record = &self.flows[*self.flow_index.get(&branch)?];
        Some(match record {
            FlowRecord::Closed { p, q, .. } => (p.eval(state), q.eval(state)),
            FlowRecord::ZeroImpedance { p, q } => (state.get(*p), state.get(*q)),
        })
    }

    /// Active flow leaving the to terminal into the branch.
    pub fn branch_flow_to(&self, branch: BranchId, state: &StateVector) -> Option<f64> {
        use crate::equations::EquationTerm;
        let record = &self.flows[*self.flow_index.get(&branch)?];
        Some(match record {
            FlowRecord::Closed { p_to, .. } => p_to.eval(state),
            FlowRecord::ZeroImpedance { p, .. } => -state.get(*p),
        })
    }

    /// Write solved voltages, flows and generator reactive outputs back
    /// into the network.
    pub fn write_results(
        &self,
        network: &mut Network,
        system: &EquationSystem,
        state: &StateVector,
    ) {
        let mut v_map = HashMap::new();
        let mut a_map = HashMap::new();
        for &bus in &self.buses {
            v_map.insert(bus, state.get(self.v_var[&bus]));
            a_map.insert(bus, state.get(self.phi_var[&bus]));
        }
        network.update_bus_state(&v_map, &a_map);

        // Reactive output split evenly among a bus's voltage-controlling
        // units.
        let mut gen_q: HashMap<GenId, f64> = HashMap::new();
        for &bus in &self.buses {
            let controlling: Vec<&GenInfo> = self
                .gens_at(bus)
                .iter()
                .filter(|g| g.target_v_pu.is_some())
                .collect();
            if controlling.is_empty() {
                continue;
            }
            let q = self.bus_reactive_generation(bus, system, state);
            let share = q / controlling.len() as f64;
            for gen in controlling {
                gen_q.insert(gen.id, share);
            }
        }

        let flows: HashMap<BranchId, (f64, f64)> = self
            .flow_index
            .keys()
            .filter_map(|&id| self.branch_flow(id, state).map(|f| (id, f)))
            .collect();

        for node in network.graph.node_weights_mut() {
            if let lf_core::Node::Gen(gen) = node {
                if let Some(&q) = gen_q.get(&gen.id) {
                    gen.q_pu = q;
                }
            }
        }
        for edge in network.graph.edge_weights_mut() {
            let lf_core::Edge::Branch(branch) = edge;
            if let Some(&(p, q)) = flows.get(&branch.id) {
                branch.p_from_pu = p;
                branch.q_from_pu = q;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_core::{Branch, Bus, Gen, Load};

    fn two_bus() -> Network {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "b1"));
        network.add_bus(Bus::new(BusId::new(2), "b2"));
        network.add_gen(
            Gen::new(GenId::new(1), "g1", BusId::new(1))
                .with_target_p(0.6)
                .with_target_v(1.02),
        );
        network.add_load(Load::new(LoadId::new(1), "l1", BusId::new(2), 0.6, 0.2));
        network
            .add_branch(Branch::new(
                BranchId::new(1),
                "line",
                BusId::new(1),
                BusId::new(2),
                0.01,
                0.1,
            ))
            .unwrap();
        network
    }

    use lf_core::LoadId;

    #[test]
    fn test_bus_modes_and_square_system() {
        let network = two_bus();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (model, _state) = AcModel::build(&network, &island, &mut system).unwrap();
        assert_eq!(model.slack(), BusId::new(1));
        assert_eq!(model.mode(BusId::new(1)), BusMode::Slack);
        assert_eq!(model.mode(BusId::new(2)), BusMode::Pq);
        // Slack: phi target + v target. PQ bus: p and q balances.
        let (rows, cols) = system.active_counts();
        assert_eq!(rows, 4);
        assert_eq!(cols, 4);
    }

    #[test]
    fn test_targets_from_injections() {
        let network = two_bus();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (model, _state) = AcModel::build(&network, &island, &mut system).unwrap();
        let p2 = model.p_eq(BusId::new(2));
        assert!((system.target(p2) + 0.6).abs() < 1e-12);
        let q2 = model.q_eq(BusId::new(2));
        assert!((system.target(q2) + 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_no_generator_island_fails() {
        let mut network = Network::new();
        network.add_bus(Bus::new(BusId::new(1), "b1"));
        let mut system = EquationSystem::new();
        assert!(AcModel::build(&network, &[BusId::new(1)], &mut system).is_err());
    }

    #[test]
    fn test_pv_to_pq_switch() {
        let mut network = two_bus();
        network.add_gen(
            Gen::new(GenId::new(2), "g2", BusId::new(2))
                .with_target_p(0.0)
                .with_target_v(1.0)
                .with_q_limits(-0.1, 0.1),
        );
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2)];
        let (mut model, _state) = AcModel::build(&network, &island, &mut system).unwrap();
        assert_eq!(model.mode(BusId::new(2)), BusMode::Pv);
        let before = system.active_counts();
        model.switch_pv_to_pq(BusId::new(2), 0.1, &mut system);
        assert_eq!(model.mode(BusId::new(2)), BusMode::Pq);
        // One equation swapped for another: still square, same size.
        assert_eq!(system.active_counts(), before);
        // Target reflects pinned generation minus local load.
        let q2 = model.q_eq(BusId::new(2));
        assert!((system.target(q2) - (0.1 - 0.2)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_impedance_branch_structure() {
        let mut network = two_bus();
        network.add_bus(Bus::new(BusId::new(3), "b3"));
        network
            .add_branch(Branch::new(
                BranchId::new(2),
                "tie",
                BusId::new(2),
                BusId::new(3),
                0.0,
                0.0,
            ))
            .unwrap();
        let mut system = EquationSystem::new();
        let island = vec![BusId::new(1), BusId::new(2), BusId::new(3)];
        let (_model, _state) = AcModel::build(&network, &island, &mut system).unwrap();
        // 3 buses: slack (2 targets) + 2 PQ (4 balances) = 6 equations,
        // plus 2 coupling equations; 6 bus variables + 2 dummy flows.
        let (rows, cols) = system.active_counts();
        assert_eq!(rows, 8);
        assert_eq!(cols, 8);
    }
}
