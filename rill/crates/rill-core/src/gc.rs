//! The tracing collector.
//!
//! Stop-the-world mark-sweep over the instance's object list.  A
//! cycle:
//!
//! 1. Bump the cycle counter; every 5th cycle is **full** and also
//!    sweeps interned symbols and pointer-table entries.
//! 2. Run every registered scanner so component-private roots (the
//!    compiler mid-compilation, host code) get marked.
//! 3. Mark the instance roots: the active fiber stack, the global
//!    environment, the in-flight error value, the guard stack, the
//!    pending allocations, and (on full cycles) every symbol the
//!    instance itself retains.
//! 4. Sweep: unmarked objects are destructed — their interiors are
//!    cleared, which breaks `Rc` cycles — and uncharged from the
//!    memory accounting; survivors get their marks cleared.
//! 5. Reset `mem_limit` from the surviving usage, and on full cycles
//!    run the symbol-table sweep and pointer-table finish hook.
//!
//! Marking is worklist-based: the mark bit is tested and set before
//! an object is pushed, which is both the cycle guard and the
//! termination proof.

use std::rc::Rc;

use rill_util::{Symbol, SymbolTable};

use crate::object::{self, Obj, ObjKind};
use crate::ptr::{PtrId, PtrTable};
use crate::state::State;
use crate::value::Value;

/// A registered root scanner.  Implementations mark whatever roots
/// they are responsible for.
pub trait Scan {
    fn scan(&self, marker: &mut Marker<'_>);
}

/// The marking context handed to scanners and traversal.
pub struct Marker<'a> {
    full: bool,
    work: Vec<Rc<Obj>>,
    syms: &'a SymbolTable,
    ptrs: &'a PtrTable,
}

impl<'a> Marker<'a> {
    fn new(full: bool, syms: &'a SymbolTable, ptrs: &'a PtrTable) -> Self {
        Self {
            full,
            work: Vec::new(),
            syms,
            ptrs,
        }
    }

    /// True on full cycles; symbol marking only matters then.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Mark a value and everything reachable from it.
    pub fn mark_value(&mut self, v: &Value) {
        match v {
            Value::Obj(o) => self.mark_obj(o),
            Value::Sym(s) => self.mark_sym(*s),
            Value::Ptr(p) => self.mark_ptr(*p),
            _ => {}
        }
    }

    /// Mark an object and queue it for traversal.
    pub fn mark_obj(&mut self, obj: &Rc<Obj>) {
        if !obj.marked.get() {
            obj.marked.set(true);
            self.work.push(obj.clone());
        }
    }

    /// Mark a symbol as live for the full-cycle sweep.
    pub fn mark_sym(&mut self, sym: Symbol) {
        if self.full {
            self.syms.mark(sym);
        }
    }

    /// Mark a pointer entry as live for the full-cycle finish hook.
    pub fn mark_ptr(&mut self, id: PtrId) {
        if self.full {
            self.ptrs.mark(id);
        }
    }

    fn drain(&mut self) {
        while let Some(obj) = self.work.pop() {
            self.traverse(&obj);
        }
    }

    fn traverse(&mut self, obj: &Rc<Obj>) {
        match &obj.kind {
            ObjKind::Str(_) => {}
            ObjKind::Idx(idx) => {
                let idx = idx.borrow();
                for (key, _) in idx.iter() {
                    self.mark_value(key);
                }
            }
            ObjKind::Rec(rec) => {
                let rec = rec.borrow();
                self.mark_obj(rec.idx_obj());
                for (_, v) in rec.populated() {
                    self.mark_value(v);
                }
            }
            ObjKind::Fun(fun) => {
                if let Some(varg) = &fun.varg {
                    self.mark_obj(varg);
                }
                match &fun.kind {
                    crate::function::FunKind::Vir(v) => {
                        for c in v.consts.iter() {
                            self.mark_value(c);
                        }
                        if self.full {
                            if let Some(dbg) = &v.dbg {
                                self.mark_sym(dbg.func);
                                self.mark_sym(dbg.file);
                            }
                        }
                    }
                    crate::function::FunKind::Nat(n) => {
                        if self.full {
                            self.mark_sym(n.name);
                            for p in n.params.iter() {
                                self.mark_sym(*p);
                            }
                        }
                    }
                }
            }
            ObjKind::Cls(cls) => {
                self.mark_obj(&cls.fun);
                for upv in cls.upvals.iter() {
                    self.mark_obj(upv);
                }
                if let Some(dat) = &cls.dat {
                    self.mark_obj(dat);
                }
            }
            ObjKind::Upv(cell) => {
                let v = cell.borrow().clone();
                self.mark_value(&v);
            }
            ObjKind::Fib(fib) => {
                let fib = fib.borrow();
                for v in fib.stack.iter() {
                    self.mark_value(v);
                }
                for ar in fib.ars.iter() {
                    self.mark_obj(&ar.cls);
                }
                if let Some(cls) = &fib.regs.cls {
                    self.mark_obj(cls);
                }
                if let Some(entry) = &fib.entry {
                    self.mark_obj(entry);
                }
                if let Some(err) = &fib.err {
                    self.mark_value(&err.val);
                }
                if let Some(tag) = fib.tag {
                    self.mark_sym(tag);
                }
            }
            ObjKind::Dat(dat) => {
                let dat = dat.borrow();
                for m in dat.mems.iter() {
                    self.mark_value(m);
                }
                if self.full {
                    self.mark_sym(dat.info.type_sym);
                }
            }
        }
    }
}

/// Run one collection cycle over the instance.  No heap cell may be
/// borrowed when this is entered (safepoint discipline).
pub(crate) fn collect(state: &mut State) {
    state.gc_count += 1;
    let full = state.gc_count % 5 == 0;
    let before_objs = state.objs.len();
    let before_used = state.mem_used;

    {
        let mut marker = Marker::new(full, &state.syms, &state.ptrs);

        for fib in &state.fibers {
            marker.mark_obj(fib);
        }
        for slot in &state.env.slots {
            marker.mark_obj(slot);
        }
        marker.mark_value(&state.err_val);
        for v in &state.guards {
            marker.mark_value(v);
        }
        for obj in &state.pending {
            marker.mark_obj(obj);
        }
        for (_, scanner) in &state.scanners {
            scanner.scan(&mut marker);
        }

        if full {
            for sym in state.types.all() {
                marker.mark_sym(sym);
            }
            for (&name, _) in state.env.names.iter() {
                marker.mark_sym(name);
            }
            for info in &state.data_infos {
                marker.mark_sym(info.type_sym);
            }
            for info in &state.ptr_infos {
                marker.mark_sym(info.type_sym);
            }
            for (&name, _) in state.loaders.iter() {
                marker.mark_sym(name);
            }
        }

        marker.drain();
    }

    // Sweep the object list; destructing a dead object clears its
    // interior and runs host destructors.
    let objs = std::mem::take(&mut state.objs);
    let mut live = Vec::with_capacity(objs.len());
    for obj in objs {
        if obj.marked.get() {
            obj.marked.set(false);
            live.push(obj);
        } else {
            state.mem_used = state.mem_used.saturating_sub(obj.size.get());
            object::destruct(&obj);
        }
    }
    state.objs = live;

    // Pending allocations were treated as roots; clear their marks.
    for obj in &state.pending {
        obj.marked.set(false);
    }

    let (syms_freed, ptrs_freed) = if full {
        (state.syms.sweep(), state.ptrs.finish_cycle())
    } else {
        (0, 0)
    };

    let growth = 1.0 + state.config.mem_limit_growth;
    state.mem_limit = ((state.mem_used as f64 * growth) as usize).max(state.config.mem_limit_init);

    log::debug!(
        "gc cycle {} ({}): {} -> {} objects, {} -> {} bytes, {} syms freed, {} ptrs freed",
        state.gc_count,
        if full { "full" } else { "minor" },
        before_objs,
        state.objs.len(),
        before_used,
        state.mem_used,
        syms_freed,
        ptrs_freed,
    );
}
