//! The equation system registry.
//!
//! Owns all [`Variable`]s and [`Equation`]s in arenas indexed by integer
//! ids; terms hold [`VarId`]s rather than references, so the cyclic
//! Equation/Term/Variable references of the symbolic model never become
//! ownership cycles.
//!
//! Row/column indices form a dense `0..n` renumbering of the active set,
//! recomputed lazily on first access after a structural mutation. Active
//! equations are ordered by (element, type); the variables referenced by at
//! least one active term of an active equation are ordered the same way.
//! Re-indexing therefore costs O(active equations + active terms) and is
//! idempotent.
//!
//! Structural mutations notify registered listeners through typed events;
//! the registry has no knowledge of who is listening (the Jacobian manager
//! and the target-vector cache subscribe, but anything honoring
//! [`EquationSystemListener`] can).

use super::equation::{EqId, Equation, EquationType, TermSlot};
use super::term::{EquationTerm, StateVector};
use super::variable::{VarId, Variable, VariableType};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Typed structural change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    EquationCreated,
    EquationRemoved,
    EquationActivated,
    EquationDeactivated,
    TermActivated,
    TermDeactivated,
    VariableCreated,
    /// Only an equation target changed; structure and derivatives are
    /// unaffected.
    TargetChanged,
}

impl SystemEvent {
    /// Whether this event can change the active row/column sets.
    pub fn is_structural(&self) -> bool {
        !matches!(self, SystemEvent::TargetChanged)
    }
}

/// Notification contract for structural changes. Implementors typically
/// keep interior-mutable dirty flags (the registry calls with `&self`).
pub trait EquationSystemListener {
    fn on_event(&self, event: SystemEvent);
}

/// Symbolic model of unknowns and constraints, with lazily maintained
/// matrix indexing.
#[derive(Default)]
pub struct EquationSystem {
    variables: Vec<Variable>,
    var_lookup: HashMap<(usize, VariableType), VarId>,
    equations: Vec<Equation>,
    eq_lookup: HashMap<(usize, EquationType), EqId>,
    index_valid: bool,
    active_rows: Vec<EqId>,
    active_columns: Vec<VarId>,
    listeners: Vec<Rc<dyn EquationSystemListener>>,
}

impl std::fmt::Debug for EquationSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquationSystem")
            .field("variables", &self.variables.len())
            .field("equations", &self.equations.len())
            .field("index_valid", &self.index_valid)
            .finish()
    }
}

impl EquationSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to structural change notifications.
    pub fn add_listener(&mut self, listener: Rc<dyn EquationSystemListener>) {
        self.listeners.push(listener);
    }

    fn notify(&self, event: SystemEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    fn invalidate_index(&mut self, event: SystemEvent) {
        self.index_valid = false;
        self.notify(event);
    }

    // ---- variables -------------------------------------------------------

    /// Get or create the variable (element, type). Idempotent by key.
    pub fn create_variable(&mut self, element: usize, var_type: VariableType) -> VarId {
        if let Some(&id) = self.var_lookup.get(&(element, var_type)) {
            return id;
        }
        let id = VarId(self.variables.len());
        self.variables.push(Variable::new(element, var_type));
        self.var_lookup.insert((element, var_type), id);
        self.invalidate_index(SystemEvent::VariableCreated);
        id
    }

    /// Look up a variable previously registered for (element, type).
    ///
    /// Panics if the variable was never registered: that is a programming
    /// contract violation, not a recoverable condition.
    pub fn variable(&self, element: usize, var_type: VariableType) -> VarId {
        match self.var_lookup.get(&(element, var_type)) {
            Some(&id) => id,
            None => panic!(
                "variable ({element}, {var_type:?}) was never registered"
            ),
        }
    }

    pub fn find_variable(&self, element: usize, var_type: VariableType) -> Option<VarId> {
        self.var_lookup.get(&(element, var_type)).copied()
    }

    pub fn variable_ref(&self, id: VarId) -> &Variable {
        &self.variables[id.index()]
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    // ---- equations -------------------------------------------------------

    /// Get or create the equation (element, type). Idempotent by key.
    pub fn create_equation(&mut self, element: usize, eq_type: EquationType) -> EqId {
        if let Some(&id) = self.eq_lookup.get(&(element, eq_type)) {
            return id;
        }
        let id = EqId(self.equations.len());
        self.equations.push(Equation::new(element, eq_type));
        self.eq_lookup.insert((element, eq_type), id);
        self.invalidate_index(SystemEvent::EquationCreated);
        id
    }

    /// Look up an equation previously created for (element, type).
    ///
    /// Panics if it was never created (programming contract violation).
    pub fn equation(&self, element: usize, eq_type: EquationType) -> EqId {
        match self.eq_lookup.get(&(element, eq_type)) {
            Some(&id) => id,
            None => panic!("equation ({element}, {eq_type:?}) was never created"),
        }
    }

    pub fn find_equation(&self, element: usize, eq_type: EquationType) -> Option<EqId> {
        self.eq_lookup.get(&(element, eq_type)).copied()
    }

    pub fn equation_ref(&self, id: EqId) -> &Equation {
        &self.equations[id.index()]
    }

    /// Remove an equation from the system. Its arena slot is tombstoned so
    /// existing ids stay valid; the key can be re-created later.
    pub fn remove_equation(&mut self, element: usize, eq_type: EquationType) {
        if let Some(id) = self.eq_lookup.remove(&(element, eq_type)) {
            let eq = &mut self.equations[id.index()];
            eq.removed = true;
            eq.row = None;
            self.invalidate_index(SystemEvent::EquationRemoved);
        }
    }

    /// Append a term to an equation. Terms start active.
    pub fn add_term(&mut self, eq: EqId, term: Box<dyn EquationTerm>) {
        self.equations[eq.index()].terms.push(TermSlot { active: true, term });
        self.invalidate_index(SystemEvent::TermActivated);
    }

    /// Activate or deactivate an equation.
    pub fn set_equation_active(&mut self, eq: EqId, active: bool) {
        let equation = &mut self.equations[eq.index()];
        if equation.active == active || equation.removed {
            return;
        }
        equation.active = active;
        trace!(
            element = equation.element,
            eq_type = ?equation.eq_type,
            active,
            "equation activation changed"
        );
        let event = if active {
            SystemEvent::EquationActivated
        } else {
            SystemEvent::EquationDeactivated
        };
        self.invalidate_index(event);
    }

    /// Activate or deactivate one term of an equation.
    pub fn set_term_active(&mut self, eq: EqId, term_index: usize, active: bool) {
        let slot = &mut self.equations[eq.index()].terms[term_index];
        if slot.active == active {
            return;
        }
        slot.active = active;
        let event = if active {
            SystemEvent::TermActivated
        } else {
            SystemEvent::TermDeactivated
        };
        self.invalidate_index(event);
    }

    /// Set an equation's target value. Does not change structure.
    pub fn set_target(&mut self, eq: EqId, target: f64) {
        self.equations[eq.index()].target = target;
        self.notify(SystemEvent::TargetChanged);
    }

    pub fn target(&self, eq: EqId) -> f64 {
        self.equations[eq.index()].target
    }

    // ---- indexing --------------------------------------------------------

    /// Recompute row/column assignments if dirtied. Idempotent.
    pub fn ensure_index(&mut self) {
        if self.index_valid {
            return;
        }

        // Rows: active equations in total (element, type) order.
        let mut rows: Vec<EqId> = (0..self.equations.len())
            .map(EqId)
            .filter(|id| self.equations[id.index()].is_active())
            .collect();
        rows.sort_by_key(|id| self.equations[id.index()].order_key());

        // Columns: variables referenced by at least one active term of an
        // active equation, in total (element, type) order.
        let mut referenced = vec![false; self.variables.len()];
        for id in &rows {
            for slot in &self.equations[id.index()].terms {
                if !slot.active {
                    continue;
                }
                for var in slot.term.variables() {
                    referenced[var.index()] = true;
                }
            }
        }
        let mut columns: Vec<VarId> = (0..self.variables.len())
            .map(VarId)
            .filter(|id| referenced[id.index()])
            .collect();
        columns.sort_by_key(|id| self.variables[id.index()].order_key());

        for v in &mut self.variables {
            v.column = None;
        }
        for (col, id) in columns.iter().enumerate() {
            self.variables[id.index()].column = Some(col);
        }
        for e in &mut self.equations {
            e.row = None;
        }
        for (row, id) in rows.iter().enumerate() {
            self.equations[id.index()].row = Some(row);
        }

        self.active_rows = rows;
        self.active_columns = columns;
        self.index_valid = true;
    }

    /// Active equations in row order. Call [`ensure_index`] first.
    pub fn active_rows(&self) -> &[EqId] {
        debug_assert!(self.index_valid);
        &self.active_rows
    }

    /// Active variables in column order. Call [`ensure_index`] first.
    pub fn active_columns(&self) -> &[VarId] {
        debug_assert!(self.index_valid);
        &self.active_columns
    }

    /// (active equation count, active variable count)
    pub fn active_counts(&mut self) -> (usize, usize) {
        self.ensure_index();
        (self.active_rows.len(), self.active_columns.len())
    }

    /// Whether the active system is square (precondition for factorization).
    pub fn is_square(&mut self) -> bool {
        let (rows, cols) = self.active_counts();
        rows == cols
    }

    // ---- evaluation ------------------------------------------------------

    /// Value of one equation (sum of its active terms), whether or not the
    /// equation is active. Used e.g. to read the reactive injection of a
    /// voltage-controlled bus whose balance equation is inactive.
    pub fn eval_equation(&self, eq: EqId, state: &StateVector) -> f64 {
        self.equations[eq.index()]
            .terms
            .iter()
            .filter(|slot| slot.active)
            .map(|slot| slot.term.eval(state))
            .sum()
    }

    /// Mismatch vector `f(x)`: per active row, equation value minus target.
    pub fn mismatch(&mut self, state: &StateVector) -> Vec<f64> {
        self.ensure_index();
        self.active_rows
            .iter()
            .map(|id| {
                let eq = &self.equations[id.index()];
                let value: f64 = eq
                    .terms
                    .iter()
                    .filter(|slot| slot.active)
                    .map(|slot| slot.term.eval(state))
                    .sum();
                value - eq.target
            })
            .collect()
    }
}

/// Cached dense target vector in row order, maintained through the
/// registry's notification contract.
pub struct TargetVector {
    dirty: Rc<DirtyFlag>,
    values: Vec<f64>,
}

pub(crate) struct DirtyFlag(std::cell::Cell<bool>);

impl EquationSystemListener for DirtyFlag {
    fn on_event(&self, _event: SystemEvent) {
        // Any event (target or structural) invalidates the cached vector.
        self.0.set(true);
    }
}

impl TargetVector {
    /// Create the cache and subscribe it to the registry.
    pub fn new(system: &mut EquationSystem) -> Self {
        let dirty = Rc::new(DirtyFlag(std::cell::Cell::new(true)));
        system.add_listener(dirty.clone());
        Self {
            dirty,
            values: Vec::new(),
        }
    }

    /// Target values per active row, recomputed when dirtied.
    pub fn values(&mut self, system: &mut EquationSystem) -> &[f64] {
        if self.dirty.0.get() {
            system.ensure_index();
            self.values = system
                .active_rows()
                .iter()
                .map(|id| system.equation_ref(*id).target())
                .collect();
            self.dirty.0.set(false);
        }
        &self.values
    }
}
