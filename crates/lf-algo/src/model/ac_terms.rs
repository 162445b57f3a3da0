//! AC equation terms for branches and shunts.
//!
//! Branch flows use the pi model with the tap (ratio `rho`, phase shift
//! `alpha`) on the from side. With series admittance `y = 1/(r + jx)` and
//! half charging `ysh = j b/2` per terminal, the two-port admittances are
//! ```text
//! Y11 = (y + ysh) / rho²        Y12 = -y e^{+j alpha} / rho
//! Y21 = -y e^{-j alpha} / rho   Y22 =  y + ysh
//! ```
//! so the sending-end complex power at a terminal is
//! `S = v_l² conj(Y_ll) + v_l v_r e^{j(th_l - th_r)} conj(Y_lr)`.
//!
//! Ratio and phase shift are each either fixed network data or a solver
//! variable (when a control outer loop drives them). Derivatives with
//! respect to rho/alpha come from
//! `dY11/drho = -2 Y11/rho`, `dY_lr/drho = -Y_lr/rho`,
//! `dY12/dalpha = +j Y12`, `dY21/dalpha = -j Y21`.

use crate::equations::{EquationTerm, StateVector, VarId};
use lf_core::Branch;
use num_complex::Complex64;

/// A branch/shunt parameter: network data, or a solver unknown.
#[derive(Debug, Clone, Copy)]
pub enum Parameter {
    Fixed(f64),
    Var(VarId),
}

impl Parameter {
    fn value(&self, state: &StateVector) -> f64 {
        match *self {
            Parameter::Fixed(v) => v,
            Parameter::Var(id) => state.get(id),
        }
    }

    fn is(&self, var: VarId) -> bool {
        matches!(*self, Parameter::Var(id) if id == var)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    ActivePower,
    ReactivePower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSide {
    From,
    To,
}

/// Flow at one terminal of an in-service branch with nonzero impedance.
#[derive(Debug)]
pub struct ClosedBranchFlowTerm {
    kind: FlowKind,
    side: BranchSide,
    /// Series admittance
    y: Complex64,
    /// Half charging susceptance at each terminal
    ysh: Complex64,
    v1: VarId,
    ph1: VarId,
    v2: VarId,
    ph2: VarId,
    rho: Parameter,
    alpha: Parameter,
    vars: Vec<VarId>,
}

/// Shared intermediate values at a given state.
struct BranchEval {
    v_loc: f64,
    v_rem: f64,
    /// Local minus remote angle
    cos_a: f64,
    sin_a: f64,
    rho: f64,
    /// Two-port admittance at (local, local)
    diag: Complex64,
    /// Two-port admittance at (local, remote)
    off: Complex64,
}

impl ClosedBranchFlowTerm {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        branch: &Branch,
        kind: FlowKind,
        side: BranchSide,
        v1: VarId,
        ph1: VarId,
        v2: VarId,
        ph2: VarId,
        rho: Parameter,
        alpha: Parameter,
    ) -> Self {
        let y = Complex64::new(branch.resistance, branch.reactance).inv();
        let ysh = Complex64::new(0.0, branch.charging_b / 2.0);
        let mut vars = vec![v1, ph1, v2, ph2];
        if let Parameter::Var(id) = rho {
            vars.push(id);
        }
        if let Parameter::Var(id) = alpha {
            vars.push(id);
        }
        Self {
            kind,
            side,
            y,
            ysh,
            v1,
            ph1,
            v2,
            ph2,
            rho,
            alpha,
            vars,
        }
    }

    fn branch_eval(&self, state: &StateVector) -> BranchEval {
        let rho = self.rho.value(state);
        let alpha = self.alpha.value(state);
        let shift = Complex64::from_polar(1.0, alpha);

        let (v_loc, v_rem, a, diag, off) = match self.side {
            BranchSide::From => (
                state.get(self.v1),
                state.get(self.v2),
                state.get(self.ph1) - state.get(self.ph2),
                (self.y + self.ysh) / (rho * rho),
                -self.y * shift / rho,
            ),
            BranchSide::To => (
                state.get(self.v2),
                state.get(self.v1),
                state.get(self.ph2) - state.get(self.ph1),
                self.y + self.ysh,
                -self.y * shift.conj() / rho,
            ),
        };

        BranchEval {
            v_loc,
            v_rem,
            cos_a: a.cos(),
            sin_a: a.sin(),
            rho,
            diag,
            off,
        }
    }

    /// Flow value given the diagonal and off-diagonal admittance parts.
    fn flow(&self, e: &BranchEval, diag: Complex64, off: Complex64) -> f64 {
        let cross = e.v_loc * e.v_rem;
        match self.kind {
            FlowKind::ActivePower => {
                e.v_loc * e.v_loc * diag.re + cross * (off.re * e.cos_a + off.im * e.sin_a)
            }
            FlowKind::ReactivePower => {
                -e.v_loc * e.v_loc * diag.im + cross * (off.re * e.sin_a - off.im * e.cos_a)
            }
        }
    }

    fn is_local(&self, var: VarId) -> bool {
        match self.side {
            BranchSide::From => var == self.v1 || var == self.ph1,
            BranchSide::To => var == self.v2 || var == self.ph2,
        }
    }
}

impl EquationTerm for ClosedBranchFlowTerm {
    fn variables(&self) -> &[VarId] {
        &self.vars
    }

    fn eval(&self, state: &StateVector) -> f64 {
        let e = self.branch_eval(state);
        self.flow(&e, e.diag, e.off)
    }

    fn der(&self, var: VarId, state: &StateVector) -> f64 {
        let e = self.branch_eval(state);
        let cross_part = match self.kind {
            FlowKind::ActivePower => e.off.re * e.cos_a + e.off.im * e.sin_a,
            FlowKind::ReactivePower => e.off.re * e.sin_a - e.off.im * e.cos_a,
        };

        if var == self.v1 || var == self.v2 {
            let diag_part = match self.kind {
                FlowKind::ActivePower => e.diag.re,
                FlowKind::ReactivePower => -e.diag.im,
            };
            return if self.is_local(var) {
                2.0 * e.v_loc * diag_part + e.v_rem * cross_part
            } else {
                e.v_loc * cross_part
            };
        }

        if var == self.ph1 || var == self.ph2 {
            // d/da of the cross part, then chain with da/dth = +-1
            let da = match self.kind {
                FlowKind::ActivePower => -e.off.re * e.sin_a + e.off.im * e.cos_a,
                FlowKind::ReactivePower => e.off.re * e.cos_a + e.off.im * e.sin_a,
            };
            let sign = if self.is_local(var) { 1.0 } else { -1.0 };
            return sign * e.v_loc * e.v_rem * da;
        }

        if self.rho.is(var) {
            let d_diag = match self.side {
                BranchSide::From => -2.0 * e.diag / e.rho,
                BranchSide::To => Complex64::new(0.0, 0.0),
            };
            let d_off = -e.off / e.rho;
            return self.flow(&e, d_diag, d_off);
        }

        if self.alpha.is(var) {
            let j = Complex64::new(0.0, 1.0);
            let d_off = match self.side {
                BranchSide::From => j * e.off,
                BranchSide::To => -j * e.off,
            };
            return self.flow(&e, Complex64::new(0.0, 0.0), d_off);
        }

        0.0
    }
}

/// Reactive flow drawn by a shunt: `q = -b v²` at its bus. The
/// susceptance is fixed data or the solver variable of a controlled shunt.
#[derive(Debug)]
pub struct ShuntFlowTerm {
    b: Parameter,
    v: VarId,
    vars: Vec<VarId>,
}

impl ShuntFlowTerm {
    pub fn new(b: Parameter, v: VarId) -> Self {
        let mut vars = vec![v];
        if let Parameter::Var(id) = b {
            vars.push(id);
        }
        Self { b, v, vars }
    }
}

impl EquationTerm for ShuntFlowTerm {
    fn variables(&self) -> &[VarId] {
        &self.vars
    }

    fn eval(&self, state: &StateVector) -> f64 {
        let v = state.get(self.v);
        -self.b.value(state) * v * v
    }

    fn der(&self, var: VarId, state: &StateVector) -> f64 {
        let v = state.get(self.v);
        if var == self.v {
            -2.0 * self.b.value(state) * v
        } else if self.b.is(var) {
            -v * v
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lf_core::{BranchId, BusId};

    fn test_branch() -> Branch {
        let mut branch = Branch::new(
            BranchId::new(1),
            "line",
            BusId::new(1),
            BusId::new(2),
            0.02,
            0.15,
        )
        .with_charging_b(0.04);
        branch.tap_ratio = 1.05;
        branch.phase_shift_rad = 0.1;
        branch
    }

    fn term_vars() -> (VarId, VarId, VarId, VarId, VarId, VarId) {
        (
            VarId(0),
            VarId(1),
            VarId(2),
            VarId(3),
            VarId(4),
            VarId(5),
        )
    }

    fn test_state() -> StateVector {
        let mut state = StateVector::new();
        state.resize(6);
        state.set(VarId(0), 1.04);
        state.set(VarId(1), 0.02);
        state.set(VarId(2), 0.98);
        state.set(VarId(3), -0.05);
        state.set(VarId(4), 1.05); // rho
        state.set(VarId(5), 0.1); // alpha
        state
    }

    fn check_gradient(term: &dyn EquationTerm, state: &StateVector) {
        let h = 1e-7;
        for &var in term.variables() {
            let mut plus = state.clone();
            plus.add(var, h);
            let mut minus = state.clone();
            minus.add(var, -h);
            let numeric = (term.eval(&plus) - term.eval(&minus)) / (2.0 * h);
            let analytic = term.der(var, state);
            assert!(
                (numeric - analytic).abs() < 1e-5,
                "var {:?}: numeric {} vs analytic {}",
                var,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn test_flow_derivatives_match_finite_differences() {
        let branch = test_branch();
        let (v1, ph1, v2, ph2, rho, alpha) = term_vars();
        let state = test_state();
        for kind in [FlowKind::ActivePower, FlowKind::ReactivePower] {
            for side in [BranchSide::From, BranchSide::To] {
                let term = ClosedBranchFlowTerm::new(
                    &branch,
                    kind,
                    side,
                    v1,
                    ph1,
                    v2,
                    ph2,
                    Parameter::Var(rho),
                    Parameter::Var(alpha),
                );
                check_gradient(&term, &state);
            }
        }
    }

    #[test]
    fn test_from_and_to_flows_balance_losses() {
        // Lossless line: active flows at the two ends must cancel.
        let branch = Branch::new(
            BranchId::new(1),
            "lossless",
            BusId::new(1),
            BusId::new(2),
            0.0,
            0.2,
        );
        let (v1, ph1, v2, ph2, _, _) = term_vars();
        let state = test_state();
        let p_from = ClosedBranchFlowTerm::new(
            &branch,
            FlowKind::ActivePower,
            BranchSide::From,
            v1,
            ph1,
            v2,
            ph2,
            Parameter::Fixed(1.0),
            Parameter::Fixed(0.0),
        );
        let p_to = ClosedBranchFlowTerm::new(
            &branch,
            FlowKind::ActivePower,
            BranchSide::To,
            v1,
            ph1,
            v2,
            ph2,
            Parameter::Fixed(1.0),
            Parameter::Fixed(0.0),
        );
        assert!((p_from.eval(&state) + p_to.eval(&state)).abs() < 1e-12);
    }

    #[test]
    fn test_resistive_line_has_losses() {
        let branch = test_branch();
        let (v1, ph1, v2, ph2, _, _) = term_vars();
        let state = test_state();
        let make = |side| {
            ClosedBranchFlowTerm::new(
                &branch,
                FlowKind::ActivePower,
                side,
                v1,
                ph1,
                v2,
                ph2,
                Parameter::Fixed(branch.tap_ratio),
                Parameter::Fixed(branch.phase_shift_rad),
            )
        };
        let loss = make(BranchSide::From).eval(&state) + make(BranchSide::To).eval(&state);
        assert!(loss > 0.0);
    }

    #[test]
    fn test_shunt_term() {
        let mut state = StateVector::new();
        state.resize(2);
        let v = VarId(0);
        let b = VarId(1);
        state.set(v, 1.02);
        state.set(b, 0.3);
        let term = ShuntFlowTerm::new(Parameter::Var(b), v);
        assert!((term.eval(&state) + 0.3 * 1.02 * 1.02).abs() < 1e-12);
        check_gradient(&term, &state);
    }
}
