//! Heap objects.
//!
//! Every heap value is an [`Obj`]: a mark bit, a size estimate for
//! the memory accounting, and the kind payload.  Objects are shared
//! through `Rc`; *liveness* however is decided by the tracing
//! collector, not by reference counts.  When the collector sweeps an
//! unreachable object it clears the object's interior (dropping its
//! outgoing `Rc` edges), which is what makes reference cycles —
//! closure ↔ upvalue, record ↔ index-key — collectable under `Rc`.
//!
//! Interior mutability is per kind: immutable payloads (strings,
//! functions, closures) are plain, mutable ones sit behind
//! `RefCell`.  No borrow is ever held across a collection; the
//! interpreter only collects at safepoints with all borrows
//! released.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::data::DataBox;
use crate::fiber::Fiber;
use crate::function::{FunKind, Function};
use crate::index::Index;
use crate::record::Record;
use crate::value::Value;

/// A closure: a function plus its captured environment.
///
/// Virtual closures carry one upvalue cell per capture; native
/// closures may carry a data object handed to the callback.
pub struct Closure {
    /// The underlying function object (kind `Fun`).
    pub fun: Rc<Obj>,
    /// Captured upvalue cells (kind `Upv`), slot-ordered.
    pub upvals: Box<[Rc<Obj>]>,
    /// Data attached to a native closure (kind `Dat`).
    pub dat: Option<Rc<Obj>>,
}

/// The kind payload of a heap object.
pub enum ObjKind {
    /// Immutable byte string.
    Str(Box<[u8]>),
    /// Shared key→locator map.
    Idx(RefCell<Index>),
    /// Keyed container over a shared index.
    Rec(RefCell<Record>),
    /// Immutable code artifact.
    Fun(Function),
    /// Function plus captures.
    Cls(Closure),
    /// Single-cell owner of a captured value.
    Upv(RefCell<Value>),
    /// Coroutine.
    Fib(RefCell<Fiber>),
    /// Host-owned buffer plus member values.
    Dat(RefCell<DataBox>),
}

/// A heap object header plus payload.
pub struct Obj {
    pub(crate) marked: Cell<bool>,
    /// Size estimate charged against the instance's memory
    /// accounting at allocation and released at sweep.
    pub(crate) size: Cell<usize>,
    pub kind: ObjKind,
}

impl Obj {
    /// The object's type name.  Function and closure names are
    /// distinct on purpose.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ObjKind::Str(_) => "str",
            ObjKind::Idx(_) => "idx",
            ObjKind::Rec(_) => "rec",
            ObjKind::Fun(_) => "fun",
            ObjKind::Cls(_) => "cls",
            ObjKind::Upv(_) => "upv",
            ObjKind::Fib(_) => "fib",
            ObjKind::Dat(_) => "dat",
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match &self.kind {
            ObjKind::Str(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_idx(&self) -> Option<&RefCell<Index>> {
        match &self.kind {
            ObjKind::Idx(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_rec(&self) -> Option<&RefCell<Record>> {
        match &self.kind {
            ObjKind::Rec(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_fun(&self) -> Option<&Function> {
        match &self.kind {
            ObjKind::Fun(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_cls(&self) -> Option<&Closure> {
        match &self.kind {
            ObjKind::Cls(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_upv(&self) -> Option<&RefCell<Value>> {
        match &self.kind {
            ObjKind::Upv(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_fib(&self) -> Option<&RefCell<Fiber>> {
        match &self.kind {
            ObjKind::Fib(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_dat(&self) -> Option<&RefCell<DataBox>> {
        match &self.kind {
            ObjKind::Dat(d) => Some(d),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Obj::{}@{:p}", self.kind_name(), self as *const _)
    }
}

/// Allocation-time size estimate for the memory accounting.  An
/// estimate is enough: the limit only schedules collections, it does
/// not bound the heap.
pub(crate) fn size_estimate(kind: &ObjKind) -> usize {
    let base = std::mem::size_of::<Obj>();
    base + match kind {
        ObjKind::Str(b) => b.len(),
        ObjKind::Idx(_) => 256,
        ObjKind::Rec(r) => r.borrow().vals_capacity() * std::mem::size_of::<Value>() + 64,
        ObjKind::Fun(f) => match &f.kind {
            FunKind::Vir(v) => {
                v.code.len() * 4 + v.consts.len() * std::mem::size_of::<Value>() + 64
            }
            FunKind::Nat(_) => 64,
        },
        ObjKind::Cls(c) => c.upvals.len() * std::mem::size_of::<Rc<Obj>>() + 32,
        ObjKind::Upv(_) => 32,
        ObjKind::Fib(_) => 512,
        ObjKind::Dat(d) => d.borrow().bytes.len() + 64,
    }
}

/// Clear a dead object's interior, dropping its outgoing references
/// so `Rc` cycles through it unravel.  Runs host destructors for
/// data objects.  Called only from the sweep, on objects the trace
/// proved unreachable.
pub(crate) fn destruct(obj: &Rc<Obj>) {
    match &obj.kind {
        ObjKind::Str(_) | ObjKind::Fun(_) | ObjKind::Cls(_) => {}
        ObjKind::Idx(idx) => idx.borrow_mut().clear(),
        ObjKind::Rec(rec) => rec.borrow_mut().clear(),
        ObjKind::Upv(cell) => *cell.borrow_mut() = Value::Nil,
        ObjKind::Fib(fib) => fib.borrow_mut().clear(),
        ObjKind::Dat(dat) => {
            let mut dat = dat.borrow_mut();
            if let Some(destr) = dat.info.destr.clone() {
                destr(&mut dat.bytes);
            }
            dat.mems.clear();
        }
    }
}
