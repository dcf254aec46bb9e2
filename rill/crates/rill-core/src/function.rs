//! Functions: immutable code artifacts.
//!
//! A function is either **virtual** (bytecode compiled from source)
//! or **native** (a host callback).  Closures pair a function with
//! its captured environment; the function itself never changes after
//! construction.
//!
//! A variadic function carries a dedicated [`crate::index::Index`]
//! shared by every variadic-argument record it ever packs, so the
//! integer keys of surplus arguments cost one shared mapping.

use std::rc::Rc;

use rill_util::Symbol;

use crate::error::{Error, Result};
use crate::object::Obj;
use crate::opcode::Instr;
use crate::state::State;
use crate::value::Value;

/// Debug info for a virtual function.
pub struct DbgInfo {
    /// Function name symbol (`<anon>` when unnamed).
    pub func: Symbol,
    /// Source unit name symbol.
    pub file: Symbol,
    /// Line per instruction, parallel to the code array.
    pub lines: Box<[u32]>,
}

/// A compiled bytecode function.
pub struct VirFun {
    pub code: Box<[Instr]>,
    pub consts: Box<[Value]>,
    /// Label table: instruction pointers indexed by jump operands.
    /// Keeps compiled code position independent.
    pub labels: Box<[u32]>,
    /// Total local slots, parameters included.
    pub nlocals: u16,
    pub nupvals: u16,
    /// Operand region sizing hint.
    pub ntemps: u16,
    pub dbg: Option<DbgInfo>,
}

/// What a native callback hands back.
pub enum NatOut {
    /// Return these values to the caller.
    Ret(Vec<Value>),
    /// Suspend the running fiber with these values.
    Yield(Vec<Value>),
}

/// Invocation context passed to a native callback.
pub struct NatCall {
    /// The call's arguments.
    pub args: Vec<Value>,
    /// Data attached to the closure, if any (kind `Dat`); the
    /// callback may read and write its members and buffer.
    pub dat: Option<Rc<Obj>>,
}

/// A native callback.
pub type NativeFn = Rc<dyn Fn(&mut State, NatCall) -> Result<NatOut>>;

/// A host-implemented function.
pub struct NatFun {
    pub name: Symbol,
    pub params: Box<[Symbol]>,
    pub cb: NativeFn,
}

pub enum FunKind {
    Vir(VirFun),
    Nat(NatFun),
}

/// An immutable code artifact.
pub struct Function {
    /// Declared parameter count, variadic tail excluded.
    pub nparams: u16,
    /// The shared variadic-argument index (kind `Idx`), present only
    /// for variadic functions.
    pub varg: Option<Rc<Obj>>,
    pub kind: FunKind,
}

impl Function {
    pub fn is_variadic(&self) -> bool {
        self.varg.is_some()
    }

    /// The function's display name for call errors and traces.
    pub fn name_text(&self, state: &State) -> String {
        match &self.kind {
            FunKind::Vir(v) => match &v.dbg {
                Some(dbg) => state.syms().text(dbg.func).into_owned(),
                None => "<anon>".to_string(),
            },
            FunKind::Nat(n) => state.syms().text(n.name).into_owned(),
        }
    }

    /// The line for an instruction pointer, when debug info exists.
    pub fn line_at(&self, ip: u32) -> Option<u32> {
        match &self.kind {
            FunKind::Vir(v) => {
                let dbg = v.dbg.as_ref()?;
                dbg.lines.get(ip as usize).copied()
            }
            FunKind::Nat(_) => None,
        }
    }

    /// The source unit name, when debug info exists.
    pub fn file_text(&self, state: &State) -> Option<String> {
        match &self.kind {
            FunKind::Vir(v) => v
                .dbg
                .as_ref()
                .map(|d| state.syms().text(d.file).into_owned()),
            FunKind::Nat(_) => None,
        }
    }
}

/// Build a native callback from a plain closure; a convenience for
/// hosts and tests.
pub fn native_fn<F>(f: F) -> NativeFn
where
    F: Fn(&mut State, NatCall) -> std::result::Result<NatOut, Error> + 'static,
{
    Rc::new(f)
}
