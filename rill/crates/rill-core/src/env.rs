//! The environment: global variables and the no-fiber stack.
//!
//! Globals live in a per-instance slot pool.  Each slot is an
//! upvalue cell, not a bare value: a closure that captures a global
//! shares the cell, so assignments through either side stay visible
//! to both.  Slot allocation is idempotent per name and slot order
//! is stable (insertion order).
//!
//! When no fiber is running the environment also provides the value
//! stack the host's push/pop operations work against.

use indexmap::IndexMap;
use rill_util::Symbol;

use crate::state::State;
use crate::value::Value;
use std::rc::Rc;

use crate::object::Obj;

/// Global slot pool plus the default value stack.
pub struct Env {
    pub(crate) names: IndexMap<Symbol, u16>,
    /// One upvalue cell (kind `Upv`) per slot.
    pub(crate) slots: Vec<Rc<Obj>>,
    /// Host value stack used when no fiber is running.
    pub(crate) stack: Vec<Value>,
}

impl Env {
    pub fn new() -> Self {
        Self {
            names: IndexMap::new(),
            slots: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// The slot for a name, if allocated.
    pub fn global_by_name(&self, name: Symbol) -> Option<u16> {
        self.names.get(&name).copied()
    }

    /// The cell at a slot.
    pub(crate) fn slot(&self, loc: u16) -> &Rc<Obj> {
        &self.slots[loc as usize]
    }

    /// Number of allocated global slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Allocate (or find) the global slot for `name`.  Idempotent.
    pub fn env_add_global(&mut self, name: Symbol) -> u16 {
        if let Some(loc) = self.env.names.get(&name) {
            return *loc;
        }
        let cell = self.new_upv_obj(Value::Udf);
        let loc = u16::try_from(self.env.slots.len()).expect("global slot pool overflow");
        self.env.slots.push(cell);
        self.env.names.insert(name, loc);
        loc
    }

    /// Read a global by slot.
    pub fn env_get_global_by_loc(&self, loc: u16) -> Value {
        self.env
            .slot(loc)
            .as_upv()
            .expect("global slot is a cell")
            .borrow()
            .clone()
    }

    /// Read a global by name; `udf` when the name has no slot.
    pub fn env_get_global_by_name(&self, name: Symbol) -> Value {
        match self.env.global_by_name(name) {
            Some(loc) => self.env_get_global_by_loc(loc),
            None => Value::Udf,
        }
    }

    /// Write a global by slot.
    pub(crate) fn env_set_global_by_loc(&self, loc: u16, val: Value) {
        *self
            .env
            .slot(loc)
            .as_upv()
            .expect("global slot is a cell")
            .borrow_mut() = val;
    }
}
