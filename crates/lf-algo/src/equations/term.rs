//! Equation terms and the state vector they evaluate against.

use super::variable::VarId;

/// Current values of all registered variables, indexed by [`VarId`].
///
/// The state vector is dense over the whole arena (not just the active
/// set), so activation changes never reshuffle state slots.
#[derive(Debug, Clone, Default)]
pub struct StateVector {
    values: Vec<f64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a slot exists for every variable up to `len`.
    pub fn resize(&mut self, len: usize) {
        if self.values.len() < len {
            self.values.resize(len, 0.0);
        }
    }

    #[inline]
    pub fn get(&self, var: VarId) -> f64 {
        self.values[var.index()]
    }

    #[inline]
    pub fn set(&mut self, var: VarId, value: f64) {
        self.values[var.index()] = value;
    }

    #[inline]
    pub fn add(&mut self, var: VarId, delta: f64) {
        self.values[var.index()] += delta;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A contributor to an equation's value.
///
/// Terms are supplied per physical device type; the registry only consumes
/// this contract. A term references (never owns) the variables it depends
/// on, and exposes its value and partial derivatives at the current state.
pub trait EquationTerm: std::fmt::Debug + Send {
    /// Variables this term depends on.
    fn variables(&self) -> &[VarId];

    /// Term value at the given state.
    fn eval(&self, state: &StateVector) -> f64;

    /// Partial derivative with respect to `var` at the given state.
    /// Returns 0 for variables the term does not depend on.
    fn der(&self, var: VarId, state: &StateVector) -> f64;
}

/// A linear term `coeff * x`: the workhorse for target equations
/// (`v = v_set`), zero-impedance coupling (`phi1 - phi2 = 0`) and
/// dummy-flow contributions to bus balances.
#[derive(Debug)]
pub struct VariableTerm {
    vars: [VarId; 1],
    coeff: f64,
}

impl VariableTerm {
    pub fn new(var: VarId, coeff: f64) -> Self {
        Self { vars: [var], coeff }
    }
}

impl EquationTerm for VariableTerm {
    fn variables(&self) -> &[VarId] {
        &self.vars
    }

    fn eval(&self, state: &StateVector) -> f64 {
        self.coeff * state.get(self.vars[0])
    }

    fn der(&self, var: VarId, _state: &StateVector) -> f64 {
        if var == self.vars[0] {
            self.coeff
        } else {
            0.0
        }
    }
}
