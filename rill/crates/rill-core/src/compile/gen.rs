//! The code generator.
//!
//! Kept separate from the parser so each stays a manageable size and
//! the output side can change (say, to a serialized form) without
//! touching the grammar.  A [`Gen`] accumulates one function's code,
//! constants, labels, and slot tables; generators nest with their
//! parent while a closure body compiles.
//!
//! # Slot namespaces
//!
//! Each function has three: locals (with lexical scoping anchored to
//! code positions and slot recycling on scope exit), upvalues
//! (function-wide, resolved against the parent at finish time), and
//! labels (lexically scoped visibility over a flat label table).
//! Globals resolve through the instance environment when the
//! generator compiles in global scope.
//!
//! # Constants
//!
//! Constants deduplicate by a canonical key — tag plus payload, or
//! the content bytes for strings.  Object constants (the index of a
//! record literal, a child function) are identity-keyed so distinct
//! sites stay distinct.

use std::rc::Rc;

use indexmap::IndexMap;
use rill_util::{define_idx, IndexVec, Symbol};

use crate::error::{ErrKind, Result};
use crate::function::{DbgInfo, FunKind, Function, VirFun};
use crate::object::{Obj, ObjKind};
use crate::opcode::{stack_effect, Instr, OpCode};
use crate::state::State;
use crate::value::Value;

/// Where a name resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VarKind {
    Global,
    Upval,
    Local,
    Closed,
}

/// A resolved variable.
#[derive(Clone, Copy, Debug)]
pub(crate) struct VarRef {
    pub kind: VarKind,
    pub slot: u16,
}

struct LocalEntry {
    name: Symbol,
    slot: u16,
    kind: VarKind,
}

struct ScopeMark {
    lcl_len: usize,
    next_slot: u16,
    lbl_vis_len: usize,
}

define_idx! {
    /// A label in a function's label table; doubles as the jump
    /// operand.
    pub(crate) struct LblId;
}

#[derive(Hash, PartialEq, Eq)]
enum ConstKey {
    Int(i64),
    Dec(u64),
    Sym(u32),
    Str(Vec<u8>),
    Uniq(u32),
}

/// Per-function code generator.
pub(crate) struct Gen {
    pub global: bool,
    pub debug: bool,
    pub func: Symbol,
    pub file: Symbol,

    lcls: Vec<LocalEntry>,
    scopes: Vec<ScopeMark>,
    next_slot: u16,
    max_slots: u16,

    pub upvs: Vec<Symbol>,

    /// Label table (resolved positions) plus the lexically visible
    /// name → id bindings.
    lbl_wheres: IndexVec<LblId, u32>,
    lbl_vis: Vec<(Symbol, LblId)>,

    consts: Vec<Value>,
    const_keys: IndexMap<ConstKey, u16>,
    uniq: u32,

    pub code: Vec<Instr>,
    pub lines: Vec<u32>,

    pub nparams: u16,
    pub vparams: bool,

    cur_temps: i32,
    max_temps: i32,

    pub cur_line: u32,
}

impl Gen {
    pub fn new(global: bool, debug: bool, func: Symbol, file: Symbol) -> Self {
        Self {
            global,
            debug,
            func,
            file,
            lcls: Vec::new(),
            scopes: Vec::new(),
            next_slot: 0,
            max_slots: 0,
            upvs: Vec::new(),
            lbl_wheres: IndexVec::new(),
            lbl_vis: Vec::new(),
            consts: Vec::new(),
            const_keys: IndexMap::new(),
            uniq: 0,
            code: Vec::new(),
            lines: Vec::new(),
            nparams: 0,
            vparams: false,
            cur_temps: 0,
            max_temps: 0,
            cur_line: 1,
        }
    }

    /// Current code position.
    pub fn place(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn set_line(&mut self, line: u32) {
        self.cur_line = line;
    }

    /// Append an instruction, tracking the operand-region watermark.
    pub fn emit(&mut self, op: OpCode, opr: u16) {
        self.code.push(Instr::new(op, opr));
        if self.debug {
            self.lines.push(self.cur_line);
        }
        self.cur_temps += stack_effect(op, opr);
        if self.cur_temps > self.max_temps {
            self.max_temps = self.cur_temps;
        }
    }

    // ---- constants -----------------------------------------------------

    /// Add a constant, deduplicating by canonical key.
    pub fn add_const(&mut self, state: &mut State, v: &Value) -> Result<u16> {
        let key = match v {
            Value::Int(i) => ConstKey::Int(*i),
            Value::Dec(d) => ConstKey::Dec(d.to_bits()),
            Value::Sym(s) => ConstKey::Sym(s.id()),
            Value::Obj(o) => match &o.kind {
                ObjKind::Str(bytes) => ConstKey::Str(bytes.to_vec()),
                _ => {
                    self.uniq += 1;
                    ConstKey::Uniq(self.uniq)
                }
            },
            _ => {
                self.uniq += 1;
                ConstKey::Uniq(self.uniq)
            }
        };

        if let Some(&ix) = self.const_keys.get(&key) {
            return Ok(ix);
        }
        if self.consts.len() > u16::MAX as usize {
            return Err(state.err_msg(ErrKind::Limit, "constant count".into()));
        }
        let ix = self.consts.len() as u16;
        self.consts.push(v.clone());
        self.const_keys.insert(key, ix);
        Ok(ix)
    }

    /// Emit the load of a constant, using the short encodings for
    /// the first eight.
    pub fn emit_const_get(&mut self, ix: u16) {
        if ix < 8 {
            let op = OpCode::try_from(u8::from(OpCode::GetConst0) + ix as u8)
                .expect("short constant opcode");
            self.emit(op, 0);
        } else {
            self.emit(OpCode::GetConst, ix);
        }
    }

    // ---- locals and scopes ---------------------------------------------

    pub fn open_scope(&mut self) {
        self.scopes.push(ScopeMark {
            lcl_len: self.lcls.len(),
            next_slot: self.next_slot,
            lbl_vis_len: self.lbl_vis.len(),
        });
    }

    pub fn close_scope(&mut self) {
        let mark = self.scopes.pop().expect("scope to close");
        self.lcls.truncate(mark.lcl_len);
        self.next_slot = mark.next_slot;
        self.lbl_vis.truncate(mark.lbl_vis_len);
    }

    fn find_local(&self, name: Symbol) -> Option<VarRef> {
        self.lcls.iter().rev().find(|e| e.name == name).map(|e| VarRef {
            kind: e.kind,
            slot: e.slot,
        })
    }

    /// Declare a local in the current scope.  Redeclaring a name the
    /// current scope already holds reuses its slot (and keeps a
    /// closed slot closed, so captures observe the new value).
    pub fn add_local(&mut self, state: &mut State, name: Symbol) -> Result<VarRef> {
        let scope_floor = self.scopes.last().map_or(0, |m| m.lcl_len);
        if let Some(e) = self.lcls[scope_floor..].iter().rev().find(|e| e.name == name) {
            return Ok(VarRef {
                kind: e.kind,
                slot: e.slot,
            });
        }

        if self.next_slot == u16::MAX {
            return Err(state.err_msg(ErrKind::Limit, "local variable count".into()));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        if self.next_slot > self.max_slots {
            self.max_slots = self.next_slot;
        }
        self.lcls.push(LocalEntry {
            name,
            slot,
            kind: VarKind::Local,
        });
        Ok(VarRef {
            kind: VarKind::Local,
            slot,
        })
    }

    /// Declare a parameter.  The variadic tail is a local but does
    /// not count toward the declared arity.
    pub fn add_param(&mut self, state: &mut State, name: Symbol, vparam: bool) -> Result<VarRef> {
        if vparam {
            self.vparams = true;
        } else {
            self.nparams += 1;
        }
        self.add_local(state, name)
    }

    fn find_upv(&self, name: Symbol) -> Option<u16> {
        self.upvs.iter().position(|n| *n == name).map(|p| p as u16)
    }

    fn add_upv(&mut self, state: &mut State, name: Symbol) -> Result<u16> {
        if let Some(p) = self.find_upv(name) {
            return Ok(p);
        }
        if self.upvs.len() >= u16::MAX as usize {
            return Err(state.err_msg(ErrKind::Limit, "upvalue count".into()));
        }
        self.upvs.push(name);
        Ok((self.upvs.len() - 1) as u16)
    }

    /// Resolve a name for reading or assignment.  Order: locals of
    /// this function (innermost scope first); then, in global scope,
    /// the environment; otherwise the upvalue table, auto-creating
    /// an entry resolved against the parent at finish time.
    pub fn get_var(&mut self, state: &mut State, name: Symbol) -> Result<VarRef> {
        if let Some(v) = self.find_local(name) {
            return Ok(v);
        }
        if self.global {
            let slot = state.env_add_global(name);
            return Ok(VarRef {
                kind: VarKind::Global,
                slot,
            });
        }
        if let Some(p) = self.find_upv(name) {
            return Ok(VarRef {
                kind: VarKind::Upval,
                slot: p,
            });
        }
        let p = self.add_upv(state, name)?;
        Ok(VarRef {
            kind: VarKind::Upval,
            slot: p,
        })
    }

    /// Declare a name for a `def` destination.
    pub fn add_var(&mut self, state: &mut State, name: Symbol) -> Result<VarRef> {
        if self.global {
            let slot = state.env_add_global(name);
            return Ok(VarRef {
                kind: VarKind::Global,
                slot,
            });
        }
        self.add_local(state, name)
    }

    /// Resolve a child capture against this generator, promoting a
    /// plain local to closed-over on first capture.  Returns the
    /// reference instruction the closure construction emits.
    pub fn resolve_capture(&mut self, state: &mut State, name: Symbol) -> Result<(OpCode, u16)> {
        if let Some(pos) = self.lcls.iter().rposition(|e| e.name == name) {
            let entry = &mut self.lcls[pos];
            return Ok(match entry.kind {
                VarKind::Local => {
                    entry.kind = VarKind::Closed;
                    (OpCode::RefLocal, entry.slot)
                }
                VarKind::Closed => (OpCode::RefClosed, entry.slot),
                _ => unreachable!("locals table holds locals"),
            });
        }
        if self.global {
            let slot = state.env_add_global(name);
            return Ok((OpCode::RefGlobal, slot));
        }
        let p = self.add_upv(state, name)?;
        Ok((OpCode::RefUpval, p))
    }

    /// Emit a variable read, using the short encodings.
    pub fn emit_get(&mut self, var: VarRef) {
        let (base0, wide) = match var.kind {
            VarKind::Global => {
                self.emit(OpCode::GetGlobal, var.slot);
                return;
            }
            VarKind::Upval => (OpCode::GetUpval0, OpCode::GetUpval),
            VarKind::Local => (OpCode::GetLocal0, OpCode::GetLocal),
            VarKind::Closed => (OpCode::GetClosed0, OpCode::GetClosed),
        };
        if var.slot < 8 {
            let op = OpCode::try_from(u8::from(base0) + var.slot as u8).expect("short opcode");
            self.emit(op, 0);
        } else {
            self.emit(wide, var.slot);
        }
    }

    /// Emit a first-class reference to a variable.
    pub fn emit_ref(&mut self, var: VarRef) {
        let op = match var.kind {
            VarKind::Global => OpCode::RefGlobal,
            VarKind::Upval => OpCode::RefUpval,
            VarKind::Local => OpCode::RefLocal,
            VarKind::Closed => OpCode::RefClosed,
        };
        self.emit(op, var.slot);
    }

    // ---- labels --------------------------------------------------------

    /// Create a label at the current position, visible in the
    /// current scope.
    pub fn add_lbl(&mut self, state: &mut State, name: Symbol) -> Result<LblId> {
        if self.lbl_wheres.len() >= u16::MAX as usize {
            return Err(state.err_msg(ErrKind::Limit, "label count".into()));
        }
        let place = self.place();
        let id = self.lbl_wheres.push(place);
        self.lbl_vis.push((name, id));
        Ok(id)
    }

    /// The innermost visible label with this name.
    pub fn get_lbl(&self, name: Symbol) -> Option<LblId> {
        self.lbl_vis
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    /// Repoint a label.
    pub fn mov_lbl(&mut self, id: LblId, place: u32) {
        self.lbl_wheres[id] = place;
    }
}

/// Finish the innermost generator into a function object.  With
/// `constr`, also emit the closure construction sequence into the
/// parent: the function constant, one reference per captured
/// upvalue, then `MAKE_CLS`.
pub(crate) fn finish(
    state: &mut State,
    gens: &mut Vec<Gen>,
    roots: &super::GenRoots,
    constr: bool,
) -> Result<Rc<Obj>> {
    let gen = gens.pop().expect("a generator to finish");

    let varg = if gen.vparams {
        let idx = state.new_idx_obj();
        roots.keep(Value::Obj(idx.clone()));
        Some(idx)
    } else {
        None
    };

    let dbg = gen.debug.then(|| DbgInfo {
        func: gen.func,
        file: gen.file,
        lines: gen.lines.into_boxed_slice(),
    });

    let fun = Function {
        nparams: gen.nparams,
        varg,
        kind: FunKind::Vir(VirFun {
            code: gen.code.into_boxed_slice(),
            consts: gen.consts.into_boxed_slice(),
            labels: gen.lbl_wheres.into_raw().into_boxed_slice(),
            nlocals: gen.max_slots,
            nupvals: gen.upvs.len() as u16,
            ntemps: gen.max_temps.max(0) as u16,
            dbg,
        }),
    };
    let fun_obj = state.new_fun_obj(fun);
    roots.keep(Value::Obj(fun_obj.clone()));

    // A function boundary is a safepoint: everything the compiler
    // still needs is reachable through the registered root scanner.
    state.safepoint();

    if constr {
        let nupvals = gen.upvs.len();
        let parent = gens.last_mut().expect("parent generator");
        let fc = parent.add_const(state, &Value::Obj(fun_obj.clone()))?;
        parent.emit_const_get(fc);
        for name in &gen.upvs {
            let (op, opr) = parent.resolve_capture(state, *name)?;
            parent.emit(op, opr);
        }
        parent.emit(OpCode::MakeCls, nupvals as u16);
    }

    Ok(fun_obj)
}
