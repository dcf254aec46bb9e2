//! The host embedding surface.
//!
//! Everything a host needs to drive an instance, as inherent methods
//! on [`State`]: value construction and inspection, tuple push/pop
//! against the current stack (the running fiber's, or the
//! environment's default stack when no fiber runs), globals,
//! compilation of sources into closures or fibers, synchronous
//! calls, fiber continuation, native callables, and data objects.
//!
//! # Value handles
//!
//! Hosts manipulate plain [`Value`]s (cheap clones).  A value held
//! only in host locals across a continuation or call boundary must
//! be kept visible to the collector with [`State::guard`]; values on
//! any runtime stack are already rooted.

use std::rc::Rc;

use rill_lex::Source;
use rill_util::Symbol;

use crate::compile::{compile, ComParams};
use crate::data::DataInfo;
use crate::error::{ErrKind, Result};
use crate::fiber::{self, FibError, FibState};
use crate::fmt::{stringify, FmtArg};
use crate::function::{FunKind, Function, NatFun, NativeFn};
use crate::interp;
use crate::object::{Closure, Obj, ObjKind};
use crate::state::State;
use crate::value::Value;

/// Scoping mode for compiled units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Free names resolve to fresh upvalue cells private to the
    /// unit.
    Local,
    /// Free names resolve to instance globals.
    Global,
}

/// A handle to a run of values on the current stack.
#[derive(Clone, Copy, Debug)]
pub struct Tup {
    off: usize,
    size: usize,
}

impl Tup {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl State {
    // ------------------------------------------------------------------
    // The current stack
    // ------------------------------------------------------------------

    fn with_stack<R>(&mut self, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        match self.fibers.last().cloned() {
            Some(fib) => {
                let cell = fib.as_fib().expect("fiber object");
                let mut fib = cell.borrow_mut();
                f(&mut fib.stack)
            }
            None => f(&mut self.env.stack),
        }
    }

    /// Push a tuple of `n` undefined slots onto the current stack.
    pub fn push_tup(&mut self, n: usize) -> Tup {
        self.with_stack(|stack| {
            let off = stack.len();
            stack.resize(off + n, Value::Udf);
            if n != 1 {
                stack.push(Value::Tup(n as u16));
            }
            Tup { off, size: n }
        })
    }

    /// Pop the top tuple off the current stack.
    pub fn pop_tup(&mut self) {
        self.with_stack(|stack| {
            match stack.last() {
                Some(Value::Tup(n)) => {
                    let n = *n as usize;
                    stack.truncate(stack.len() - 1 - n);
                }
                Some(_) => {
                    stack.pop();
                }
                None => {}
            };
        })
    }

    /// A handle to the top tuple of the current stack.
    pub fn top_tup(&mut self) -> Tup {
        self.with_stack(|stack| match stack.last() {
            Some(Value::Tup(n)) => Tup {
                off: stack.len() - 1 - *n as usize,
                size: *n as usize,
            },
            Some(_) => Tup {
                off: stack.len() - 1,
                size: 1,
            },
            None => Tup { off: 0, size: 0 },
        })
    }

    /// Read a tuple element.
    pub fn tup_at(&mut self, tup: &Tup, i: usize) -> Value {
        assert!(i < tup.size, "tuple index in range");
        self.with_stack(|stack| stack[tup.off + i].clone())
    }

    /// Write a tuple element.
    pub fn tup_set(&mut self, tup: &Tup, i: usize, v: Value) -> Result<()> {
        if !v.is_storable() {
            return Err(self.err_fmt(
                ErrKind::Tuple,
                "a tuple header is not a storable value",
                &[],
            ));
        }
        assert!(i < tup.size, "tuple index in range");
        self.with_stack(|stack| stack[tup.off + i] = v);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Globals
    // ------------------------------------------------------------------

    /// Define (or redefine) a global.
    pub fn def_global(&mut self, name: &str, v: Value) -> Result<()> {
        if !v.is_storable() {
            return Err(self.err_fmt(
                ErrKind::Tuple,
                "a tuple header is not a storable value",
                &[],
            ));
        }
        let sym = self.intern(name);
        let loc = self.env_add_global(sym);
        self.env_set_global_by_loc(loc, v);
        Ok(())
    }

    /// Assign an existing global; a missing one is an assignment
    /// fault.
    pub fn set_global(&mut self, name: &str, v: Value) -> Result<()> {
        let sym = self.intern(name);
        match self.env.global_by_name(sym) {
            Some(loc) => {
                if !v.is_storable() {
                    return Err(self.err_fmt(
                        ErrKind::Tuple,
                        "a tuple header is not a storable value",
                        &[],
                    ));
                }
                self.env_set_global_by_loc(loc, v);
                Ok(())
            }
            None => Err(self.err_fmt(
                ErrKind::Assign,
                "set of undefined global %s",
                &[FmtArg::S(name)],
            )),
        }
    }

    /// Read a global; `udf` when undefined.
    pub fn get_global(&mut self, name: &str) -> Value {
        let sym = self.intern(name);
        self.env_get_global_by_name(sym)
    }

    // ------------------------------------------------------------------
    // Type queries, equality, copies
    // ------------------------------------------------------------------

    /// The value's type symbol.  Data and pointer values report
    /// their descriptor's tag.
    pub fn type_sym(&mut self, v: &Value) -> Symbol {
        match v {
            Value::Udf => self.types.udf,
            Value::Nil => self.types.nil,
            Value::Log(_) => self.types.log,
            Value::Int(_) => self.types.int,
            Value::Dec(_) => self.types.dec,
            Value::Sym(_) => self.types.sym,
            Value::Ptr(p) => match self.ptr_info(*p) {
                Some(info) => info.type_sym,
                None => self.types.ptr,
            },
            Value::Obj(o) => match &o.kind {
                ObjKind::Str(_) => self.types.str_,
                ObjKind::Idx(_) => self.types.idx,
                ObjKind::Rec(_) => self.types.rec,
                ObjKind::Fun(_) => self.types.fun,
                ObjKind::Cls(_) => self.types.cls,
                ObjKind::Upv(_) => self.types.upv,
                ObjKind::Fib(_) => self.types.fib,
                ObjKind::Dat(cell) => cell.borrow().info.type_sym,
            },
            Value::Tup(_) | Value::Ref(_) => self.types.udf,
        }
    }

    /// Structural equality, as the language's `=` sees it (with udf
    /// permitted, as the host convenience).
    pub fn equal(&self, a: &Value, b: &Value) -> bool {
        crate::value::vals_equal(a, b)
    }

    /// Copy a value handle.
    pub fn copy(&self, v: &Value) -> Value {
        v.clone()
    }

    /// Render a value for display.
    pub fn render(&self, v: &Value, quote: bool) -> String {
        let mut out = String::new();
        stringify(&self.syms, &self.ptrs, &mut out, v, quote, 0);
        out
    }

    // ------------------------------------------------------------------
    // Constructors and inspectors
    // ------------------------------------------------------------------

    /// A symbol value.
    pub fn sym(&mut self, text: &str) -> Value {
        Value::Sym(self.intern(text))
    }

    /// The text of a symbol value.
    pub fn sym_text(&self, sym: Symbol) -> String {
        self.syms.text(sym).into_owned()
    }

    /// A string value.
    pub fn str_val(&mut self, text: &str) -> Value {
        self.new_str(text.as_bytes())
    }

    /// The bytes of a string value.
    pub fn str_bytes<'v>(&self, v: &'v Value) -> Option<&'v [u8]> {
        v.as_obj().and_then(|o| o.as_str())
    }

    /// The UTF-8 code point count of a string value; `None` for
    /// non-strings or invalid UTF-8.
    pub fn str_chars(&self, v: &Value) -> Option<usize> {
        let bytes = self.str_bytes(v)?;
        std::str::from_utf8(bytes).ok().map(|s| s.chars().count())
    }

    /// A fresh empty record over its own index.
    pub fn new_record(&mut self) -> Value {
        let idx = self.new_idx_obj();
        Value::Obj(self.new_rec_obj(idx))
    }

    /// Create a data object from a registered descriptor.
    pub fn new_data(&mut self, info: &Rc<DataInfo>) -> Value {
        Value::Obj(self.new_dat_obj(info.clone()))
    }

    /// Read a data member.
    pub fn data_member(&mut self, v: &Value, i: usize) -> Result<Value> {
        let Some(cell) = v.as_obj().and_then(|o| o.as_dat()) else {
            return Err(self.err_fmt(ErrKind::Type, "expected a data value, not %t", &[FmtArg::T(v)]));
        };
        let dat = cell.borrow();
        match dat.mems.get(i) {
            Some(m) => Ok(m.clone()),
            None => {
                drop(dat);
                Err(self.err_fmt(ErrKind::Type, "data member %u out of range", &[FmtArg::U(i as u64)]))
            }
        }
    }

    /// Write a data member.
    pub fn data_set_member(&mut self, v: &Value, i: usize, m: Value) -> Result<()> {
        if !m.is_storable() {
            return Err(self.err_fmt(
                ErrKind::Tuple,
                "a tuple header is not a storable value",
                &[],
            ));
        }
        let Some(cell) = v.as_obj().and_then(|o| o.as_dat()) else {
            return Err(self.err_fmt(ErrKind::Type, "expected a data value, not %t", &[FmtArg::T(v)]));
        };
        let mut dat = cell.borrow_mut();
        if i >= dat.mems.len() {
            drop(dat);
            return Err(self.err_fmt(ErrKind::Type, "data member %u out of range", &[FmtArg::U(i as u64)]));
        }
        dat.mems[i] = m;
        Ok(())
    }

    /// Run a closure over a data object's byte buffer.
    pub fn data_bytes<R>(&mut self, v: &Value, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let Some(cell) = v.as_obj().and_then(|o| o.as_dat()) else {
            return Err(self.err_fmt(ErrKind::Type, "expected a data value, not %t", &[FmtArg::T(v)]));
        };
        let mut dat = cell.borrow_mut();
        Ok(f(&mut dat.bytes))
    }

    /// A native callable with no attached data.
    pub fn native(&mut self, name: &str, params: &[&str], cb: NativeFn) -> Value {
        self.native_with_data(name, params, cb, None)
    }

    /// A native callable carrying a data object.
    pub fn native_with_data(
        &mut self,
        name: &str,
        params: &[&str],
        cb: NativeFn,
        dat: Option<Value>,
    ) -> Value {
        let name = self.intern(name);
        let params: Vec<Symbol> = params.iter().map(|p| self.intern(p)).collect();
        let nparams = params.len() as u16;
        let fun = self.new_fun_obj(Function {
            nparams,
            varg: None,
            kind: FunKind::Nat(NatFun {
                name,
                params: params.into_boxed_slice(),
                cb,
            }),
        });
        let dat = dat.and_then(|d| d.as_obj().cloned());
        let cls = self.new_cls_obj(Closure {
            fun,
            upvals: Box::new([]),
            dat,
        });
        Value::Obj(cls)
    }

    /// A variadic native callable: surplus arguments pack into a
    /// record through a dedicated shared index.
    pub fn native_variadic(&mut self, name: &str, params: &[&str], cb: NativeFn) -> Value {
        let name = self.intern(name);
        let params: Vec<Symbol> = params.iter().map(|p| self.intern(p)).collect();
        let nparams = params.len() as u16;
        let varg = self.new_idx_obj();
        let fun = self.new_fun_obj(Function {
            nparams,
            varg: Some(varg),
            kind: FunKind::Nat(NatFun {
                name,
                params: params.into_boxed_slice(),
                cb,
            }),
        });
        let cls = self.new_cls_obj(Closure {
            fun,
            upvals: Box::new([]),
            dat: None,
        });
        Value::Obj(cls)
    }

    // ------------------------------------------------------------------
    // Compilation and execution
    // ------------------------------------------------------------------

    /// Compile a single expression into a closure.
    pub fn compile_expr(&mut self, src: &mut dyn Source, scope: Scope) -> Result<Value> {
        self.compile_unit(src, scope, &[], false)
    }

    /// Compile a delimiter-separated script into a closure; the
    /// script's value is the empty tuple.
    pub fn compile_script(&mut self, src: &mut dyn Source, scope: Scope) -> Result<Value> {
        self.compile_unit(src, scope, &[], true)
    }

    /// Compile a unit with explicit parameters.  A trailing `...` on
    /// the last name makes the unit variadic.
    pub fn compile_unit(
        &mut self,
        src: &mut dyn Source,
        scope: Scope,
        params: &[&str],
        script: bool,
    ) -> Result<Value> {
        let debug = self.config.debug;
        let fun = compile(
            self,
            src,
            &ComParams {
                file: None,
                params,
                debug,
                global: scope == Scope::Global,
                script,
            },
        )?;
        Ok(Value::Obj(self.close_over(fun)))
    }

    /// Compile a unit and wrap it in a fresh fiber.
    pub fn compile_fiber(
        &mut self,
        src: &mut dyn Source,
        scope: Scope,
        script: bool,
        tag: Option<&str>,
    ) -> Result<Value> {
        let cls = self.compile_unit(src, scope, &[], script)?;
        let tag = tag.map(|t| self.intern(t));
        self.fib_new(&cls, tag)
    }

    /// Wrap a function object in a closure; unresolved upvalues get
    /// fresh undefined cells.
    fn close_over(&mut self, fun: Rc<Obj>) -> Rc<Obj> {
        let nupvals = match &fun.as_fun().expect("function object").kind {
            FunKind::Vir(v) => v.nupvals as usize,
            FunKind::Nat(_) => 0,
        };
        let mut upvals = Vec::with_capacity(nupvals);
        for _ in 0..nupvals {
            upvals.push(self.new_upv_obj(Value::Udf));
        }
        self.new_cls_obj(Closure {
            fun,
            upvals: upvals.into_boxed_slice(),
            dat: None,
        })
    }

    /// Create a fiber over a closure, optionally tagged.
    pub fn fib_new(&mut self, cls: &Value, tag: Option<Symbol>) -> Result<Value> {
        let Some(obj) = cls.as_obj().filter(|o| o.as_cls().is_some()) else {
            return Err(self.err_fmt(
                ErrKind::Fiber,
                "a fiber needs a closure entry, not %t",
                &[FmtArg::T(cls)],
            ));
        };
        Ok(Value::Obj(fiber::fib_new(self, obj, tag)))
    }

    /// Continue a fiber with arguments; returns what it yields.
    pub fn fib_cont(&mut self, fib: &Value, args: &[Value]) -> Result<Vec<Value>> {
        let Some(obj) = fib.as_obj().filter(|o| o.as_fib().is_some()) else {
            return Err(self.err_fmt(
                ErrKind::Fiber,
                "continued a %t value",
                &[FmtArg::T(fib)],
            ));
        };
        let obj = obj.clone();

        // The fiber and the returned values may be held only in host
        // locals; keep them visible to the collector across the
        // post-continuation safepoint.
        let mark = self.guard_mark();
        self.guard(fib.clone());
        let res = fiber::fib_cont(self, &obj, args);
        if let Ok(vals) = &res {
            for v in vals {
                self.guard(v.clone());
            }
        }
        self.safepoint();
        self.guard_reset(mark);
        res
    }

    /// A fiber's lifecycle state.
    pub fn fib_state(&mut self, fib: &Value) -> Result<FibState> {
        match fib.as_obj().and_then(|o| o.as_fib()) {
            Some(cell) => Ok(cell.borrow().state),
            None => Err(self.err_fmt(
                ErrKind::Fiber,
                "expected a fiber, not %t",
                &[FmtArg::T(fib)],
            )),
        }
    }

    /// The error absorbed by a Failed fiber.
    pub fn fib_err(&self, fib: &Value) -> Option<FibError> {
        fib.as_obj()
            .and_then(|o| o.as_fib())
            .and_then(|cell| cell.borrow().err.clone())
    }

    /// Call a closure synchronously with arguments.  Runs on the
    /// current fiber when one is running; otherwise a throwaway
    /// fiber hosts the call.
    pub fn call(&mut self, cls: &Value, args: &[Value]) -> Result<Vec<Value>> {
        if cls.as_obj().and_then(|o| o.as_cls()).is_none() {
            return Err(self.err_fmt(ErrKind::Call, "called a %t value", &[FmtArg::T(cls)]));
        }

        match self.fibers.last().cloned() {
            Some(fib) => {
                {
                    let cell = fib.as_fib().expect("fiber object");
                    let mut f = cell.borrow_mut();
                    f.stack.push(cls.clone());
                    for a in args {
                        f.stack.push(a.clone());
                    }
                    if args.len() != 1 {
                        f.stack.push(Value::Tup(args.len() as u16));
                    }
                }
                interp::run_call(self, &fib)
            }
            None => {
                let entry = cls.as_obj().expect("closure object").clone();
                let fib = fiber::fib_new(self, &entry, None);
                let vals = fiber::fib_cont(self, &fib, args)?;
                let state = fib
                    .as_fib()
                    .expect("fiber object")
                    .borrow()
                    .state;
                match state {
                    FibState::Finished => {
                        let mark = self.guard_mark();
                        for v in &vals {
                            self.guard(v.clone());
                        }
                        self.safepoint();
                        self.guard_reset(mark);
                        Ok(vals)
                    }
                    FibState::Stopped => Err(self.err_fmt(
                        ErrKind::Fiber,
                        "the callee yielded outside a fiber",
                        &[],
                    )),
                    FibState::Failed => {
                        let err = self
                            .fib_err(&Value::Obj(fib.clone()))
                            .expect("failed fiber holds its error");
                        Err(crate::error::Error {
                            kind: err.kind,
                            val: err.val,
                            text: err.text,
                            msg: None,
                            trace: err.trace,
                        })
                    }
                    other => Err(self.err_fmt(
                        ErrKind::Fiber,
                        "call fiber ended in its %s state",
                        &[FmtArg::S(other.name())],
                    )),
                }
            }
        }
    }

    /// Compile and immediately run a unit, returning its values.
    pub fn run(&mut self, src: &mut dyn Source, scope: Scope, script: bool) -> Result<Vec<Value>> {
        let cls = self.compile_unit(src, scope, &[], script)?;
        self.call(&cls, &[])
    }

    /// A fiber's tag symbol, if it was tagged at creation.
    pub fn fib_tag(&self, fib: &Value) -> Option<Symbol> {
        fib.as_obj()
            .and_then(|o| o.as_fib())
            .and_then(|cell| cell.borrow().tag)
    }
}
