//! The language instance.
//!
//! A [`State`] is one independent language instance: its heap and
//! collector, its symbol and pointer tables, its globals, its fiber
//! stack, its error slots, and its formatter.  There is deliberately
//! no process-wide runtime state; two `State`s never share anything.
//!
//! # Memory discipline
//!
//! Every allocation is charged against `mem_used`; crossing
//! `mem_limit` requests a collection, which runs at the next
//! *safepoint* — a point where no heap cell is borrowed (the
//! interpreter reaches one at every control edge, the API surface at
//! every entry).  After each collection the limit is reset to
//! `mem_used * (1 + growth)`.
//!
//! Allocations that need multi-step initialization go through the
//! pending list: a pending object is kept alive by the collector but
//! is not yet committed; erroring out of the initialization drops it
//! deterministically (its destructor still runs).  `commit` moves it
//! onto the ordinary object list.
//!
//! Deferred callbacks ([`State::install_defer`]) cover host
//! resources that must be released when an error unwinds to a catch
//! boundary; `Drop` handles the ordinary cases.  Scanners contribute
//! component-private roots (the compiler registers one for the
//! duration of a compilation); finalizers run once at instance
//! teardown.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use rill_util::{Symbol, SymbolTable};

use crate::config::Config;
use crate::data::{DataBox, DataInfo};
use crate::env::Env;
use crate::error::{ErrKind, Error, Result};
use crate::fmt::{Fmt, FmtArg};
use crate::function::Function;
use crate::gc::{self, Scan};
use crate::index::Index;
use crate::object::{self, Obj, ObjKind};
use crate::ptr::{PtrId, PtrInfo, PtrTable};
use crate::record::Record;
use crate::value::Value;

/// A registered module loader: given a module path, produce the
/// module's value.
pub type LoaderFn = Rc<dyn Fn(&mut State, &str) -> Result<Value>>;

/// A registered path translator for module loading.
pub type PathTranslator = Rc<dyn Fn(&str) -> String>;

/// Interned type-name symbols, cached per instance.  "function" and
/// "closure" are cached independently.
pub(crate) struct TypeSyms {
    pub udf: Symbol,
    pub nil: Symbol,
    pub log: Symbol,
    pub int: Symbol,
    pub dec: Symbol,
    pub sym: Symbol,
    pub ptr: Symbol,
    pub str_: Symbol,
    pub idx: Symbol,
    pub rec: Symbol,
    pub fun: Symbol,
    pub cls: Symbol,
    pub upv: Symbol,
    pub fib: Symbol,
    pub dat: Symbol,
}

impl TypeSyms {
    fn new(syms: &mut SymbolTable) -> Self {
        Self {
            udf: syms.intern_str("udf"),
            nil: syms.intern_str("nil"),
            log: syms.intern_str("log"),
            int: syms.intern_str("int"),
            dec: syms.intern_str("dec"),
            sym: syms.intern_str("sym"),
            ptr: syms.intern_str("ptr"),
            str_: syms.intern_str("str"),
            idx: syms.intern_str("idx"),
            rec: syms.intern_str("rec"),
            fun: syms.intern_str("fun"),
            cls: syms.intern_str("cls"),
            upv: syms.intern_str("upv"),
            fib: syms.intern_str("fib"),
            dat: syms.intern_str("dat"),
        }
    }

    pub(crate) fn all(&self) -> [Symbol; 15] {
        [
            self.udf, self.nil, self.log, self.int, self.dec, self.sym, self.ptr, self.str_,
            self.idx, self.rec, self.fun, self.cls, self.upv, self.fib, self.dat,
        ]
    }
}

/// One language instance.  See the module docs.
pub struct State {
    pub(crate) config: Config,

    // Heap.
    pub(crate) objs: Vec<Rc<Obj>>,
    pub(crate) pending: Vec<Rc<Obj>>,
    pub(crate) mem_used: usize,
    pub(crate) mem_limit: usize,
    pub(crate) gc_pending: bool,
    pub(crate) gc_count: u64,

    // Interning.
    pub(crate) syms: SymbolTable,
    pub(crate) ptrs: PtrTable,

    // Execution.
    pub(crate) env: Env,
    /// Active fibers, running fiber on top, waiting parents below.
    pub(crate) fibers: Vec<Rc<Obj>>,

    // Per-instance error slots; mirror the in-flight error so the
    // collector can reach its value.
    pub(crate) err_kind: ErrKind,
    pub(crate) err_val: Value,
    pub(crate) err_str: Option<&'static str>,

    // Host-visible root stack for values native code must keep alive
    // across continuation or call boundaries.
    pub(crate) guards: Vec<Value>,

    // Hooks.
    pub(crate) scanners: Vec<(u64, Rc<dyn Scan>)>,
    pub(crate) defers: Vec<(u64, Box<dyn FnMut(&mut State)>)>,
    pub(crate) finalizers: Vec<Box<dyn FnMut(&mut State)>>,
    next_hook_id: u64,

    // Registries.
    pub(crate) types: TypeSyms,
    pub(crate) data_infos: Vec<Rc<DataInfo>>,
    pub(crate) ptr_infos: Vec<Rc<PtrInfo>>,
    pub(crate) loaders: FxHashMap<Symbol, LoaderFn>,
    pub(crate) translator: Option<PathTranslator>,

    pub(crate) fmt: Fmt,
}

impl State {
    /// Create an instance with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let mut syms = SymbolTable::new();
        let types = TypeSyms::new(&mut syms);
        Ok(Self {
            mem_limit: config.mem_limit_init,
            config,
            objs: Vec::new(),
            pending: Vec::new(),
            mem_used: 0,
            gc_pending: false,
            gc_count: 0,
            syms,
            ptrs: PtrTable::new(),
            env: Env::new(),
            fibers: Vec::new(),
            err_kind: ErrKind::None,
            err_val: Value::Udf,
            err_str: None,
            guards: Vec::new(),
            scanners: Vec::new(),
            defers: Vec::new(),
            finalizers: Vec::new(),
            next_hook_id: 1,
            types,
            data_infos: Vec::new(),
            ptr_infos: Vec::new(),
            loaders: FxHashMap::default(),
            translator: None,
            fmt: Fmt::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The instance's symbol table.
    pub fn syms(&self) -> &SymbolTable {
        &self.syms
    }

    /// Intern text into the instance's symbol table.
    pub fn intern(&mut self, text: &str) -> Symbol {
        self.syms.intern_str(text)
    }

    /// Intern raw bytes.
    pub fn intern_bytes(&mut self, bytes: &[u8]) -> Symbol {
        self.syms.intern(bytes)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn charge(&mut self, size: usize) {
        self.mem_used += size;
        if self.mem_used > self.mem_limit {
            self.gc_pending = true;
        }
    }

    /// Allocate an object straight onto the live list.
    pub(crate) fn admit(&mut self, kind: ObjKind) -> Rc<Obj> {
        let size = object::size_estimate(&kind);
        self.charge(size);
        let obj = Rc::new(Obj {
            marked: Cell::new(false),
            size: Cell::new(size),
            kind,
        });
        self.objs.push(obj.clone());
        obj
    }

    /// Allocate an object onto the pending list: kept alive by the
    /// collector, not yet live.  Pair with [`State::commit`] or
    /// [`State::cancel`].
    pub fn alloc_pending(&mut self, kind: ObjKind) -> Rc<Obj> {
        let size = object::size_estimate(&kind);
        self.charge(size);
        let obj = Rc::new(Obj {
            marked: Cell::new(false),
            size: Cell::new(size),
            kind,
        });
        self.pending.push(obj.clone());
        obj
    }

    /// Move a pending object onto the live list.
    pub fn commit(&mut self, obj: &Rc<Obj>) {
        if let Some(pos) = self.pending.iter().position(|p| Rc::ptr_eq(p, obj)) {
            let obj = self.pending.remove(pos);
            self.objs.push(obj);
        }
    }

    /// Drop a pending object without ever making it live.  Its
    /// destructor runs.
    pub fn cancel(&mut self, obj: &Rc<Obj>) {
        if let Some(pos) = self.pending.iter().position(|p| Rc::ptr_eq(p, obj)) {
            let obj = self.pending.remove(pos);
            self.mem_used = self.mem_used.saturating_sub(obj.size.get());
            object::destruct(&obj);
        }
    }

    /// Drop every pending object; runs at catch boundaries after an
    /// error unwound past in-progress initializations.
    pub(crate) fn drop_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for obj in pending {
            self.mem_used = self.mem_used.saturating_sub(obj.size.get());
            object::destruct(&obj);
        }
    }

    pub fn new_str_obj(&mut self, bytes: &[u8]) -> Rc<Obj> {
        self.admit(ObjKind::Str(bytes.into()))
    }

    pub fn new_str(&mut self, bytes: &[u8]) -> Value {
        Value::Obj(self.new_str_obj(bytes))
    }

    pub fn new_idx_obj(&mut self) -> Rc<Obj> {
        self.admit(ObjKind::Idx(RefCell::new(Index::new())))
    }

    pub(crate) fn new_idx_from(&mut self, idx: Index) -> Rc<Obj> {
        self.admit(ObjKind::Idx(RefCell::new(idx)))
    }

    pub fn new_rec_obj(&mut self, idx: Rc<Obj>) -> Rc<Obj> {
        debug_assert!(idx.as_idx().is_some());
        self.admit(ObjKind::Rec(RefCell::new(Record::new(idx))))
    }

    pub(crate) fn new_fun_obj(&mut self, fun: Function) -> Rc<Obj> {
        self.admit(ObjKind::Fun(fun))
    }

    pub(crate) fn new_cls_obj(&mut self, cls: crate::object::Closure) -> Rc<Obj> {
        self.admit(ObjKind::Cls(cls))
    }

    pub(crate) fn new_upv_obj(&mut self, val: Value) -> Rc<Obj> {
        self.admit(ObjKind::Upv(RefCell::new(val)))
    }

    pub(crate) fn new_fib_obj(&mut self, fib: crate::fiber::Fiber) -> Rc<Obj> {
        self.admit(ObjKind::Fib(RefCell::new(fib)))
    }

    pub(crate) fn new_dat_obj(&mut self, info: Rc<DataInfo>) -> Rc<Obj> {
        self.admit(ObjKind::Dat(RefCell::new(DataBox::new(info))))
    }

    /// Intern an opaque pointer as a value.
    pub fn new_ptr(&mut self, addr: usize, info: Option<Rc<PtrInfo>>) -> Value {
        Value::Ptr(self.ptrs.intern(addr, info))
    }

    pub(crate) fn ptr_info(&self, id: PtrId) -> Option<Rc<PtrInfo>> {
        self.ptrs.info(id)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// True when a collection is due at the next safepoint.
    pub(crate) fn gc_ready(&self) -> bool {
        self.gc_pending || self.config.gc_stress
    }

    /// Run a due collection.  Callers guarantee no heap cell is
    /// borrowed.
    pub(crate) fn safepoint(&mut self) {
        if self.gc_ready() {
            self.collect_now();
        }
    }

    /// Unconditionally collect.  The host may call this; no heap
    /// borrow may be live.
    pub fn collect_now(&mut self) {
        gc::collect(self);
        self.gc_pending = false;
    }

    /// Bytes currently charged to the heap.
    pub fn mem_used(&self) -> usize {
        self.mem_used
    }

    /// Number of live heap objects.
    pub fn obj_count(&self) -> usize {
        self.objs.len()
    }

    // ------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------

    /// Root a value for the collector until the matching
    /// [`State::guard_reset`].  Native code must guard any value it
    /// holds only in Rust locals across a continuation or call.
    pub fn guard(&mut self, v: Value) {
        self.guards.push(v);
    }

    /// Current guard-stack watermark.
    pub fn guard_mark(&self) -> usize {
        self.guards.len()
    }

    /// Drop guards down to a watermark.
    pub fn guard_reset(&mut self, mark: usize) {
        self.guards.truncate(mark);
    }

    // ------------------------------------------------------------------
    // Formatter
    // ------------------------------------------------------------------

    /// Render a pattern into the shared formatter buffer.
    pub fn format(&mut self, append: bool, pattern: &str, args: &[FmtArg<'_>]) {
        self.fmt.format(&self.syms, &self.ptrs, append, pattern, args);
    }

    /// The shared formatter buffer.
    pub fn fmt_buf(&self) -> &str {
        self.fmt.buf()
    }

    /// The shared formatter buffer's length in bytes.
    pub fn fmt_len(&self) -> usize {
        self.fmt.len()
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Build an error through the formatter, mirroring it into the
    /// instance error slots.
    pub fn err_fmt(&mut self, kind: ErrKind, pattern: &str, args: &[FmtArg<'_>]) -> Error {
        self.fmt.format(&self.syms, &self.ptrs, false, pattern, args);
        let text = self.fmt.buf().to_string();
        self.err_msg(kind, text)
    }

    /// Build an error from pre-rendered text.
    pub fn err_msg(&mut self, kind: ErrKind, text: String) -> Error {
        let val = self.new_str(text.as_bytes());
        self.err_kind = kind;
        self.err_val = val.clone();
        self.err_str = None;
        Error {
            kind,
            val,
            text,
            msg: None,
            trace: Vec::new(),
        }
    }

    /// Clear the instance error slots; a catch boundary does this
    /// after absorbing the error.
    pub(crate) fn clear_err(&mut self) {
        self.err_kind = ErrKind::None;
        self.err_val = Value::Udf;
        self.err_str = None;
    }

    // ------------------------------------------------------------------
    // Hooks: defers, scanners, finalizers
    // ------------------------------------------------------------------

    fn next_id(&mut self) -> u64 {
        let id = self.next_hook_id;
        self.next_hook_id += 1;
        id
    }

    /// Install a deferred cleanup callback; it runs if an error
    /// unwinds to a catch boundary while it is installed, or when
    /// explicitly run.  Returns a handle for cancel/run.
    pub fn install_defer(&mut self, cb: Box<dyn FnMut(&mut State)>) -> u64 {
        let id = self.next_id();
        self.defers.push((id, cb));
        id
    }

    /// Remove a defer without running it (the success path).
    pub fn cancel_defer(&mut self, id: u64) {
        self.defers.retain(|(i, _)| *i != id);
    }

    /// Run a defer now and remove it.
    pub fn run_defer(&mut self, id: u64) {
        if let Some(pos) = self.defers.iter().position(|(i, _)| *i == id) {
            let (_, mut cb) = self.defers.remove(pos);
            cb(self);
        }
    }

    /// Watermark for [`State::unwind_defers`].
    pub(crate) fn defer_mark(&self) -> usize {
        self.defers.len()
    }

    /// Run and remove every defer installed since `mark`, newest
    /// first.  Catch boundaries call this on the error path.
    pub(crate) fn unwind_defers(&mut self, mark: usize) {
        while self.defers.len() > mark {
            let (_, mut cb) = self.defers.pop().expect("defer present above mark");
            cb(self);
        }
    }

    /// Register a root scanner; its `scan` runs in every collection.
    pub fn install_scanner(&mut self, scanner: Rc<dyn Scan>) -> u64 {
        let id = self.next_id();
        self.scanners.push((id, scanner));
        id
    }

    pub fn remove_scanner(&mut self, id: u64) {
        self.scanners.retain(|(i, _)| *i != id);
    }

    /// Register a teardown callback, run once when the instance
    /// drops.
    pub fn install_finalizer(&mut self, cb: Box<dyn FnMut(&mut State)>) {
        self.finalizers.push(cb);
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    /// Register a data descriptor.
    pub fn register_data_info(
        &mut self,
        type_name: &str,
        size: usize,
        n_mems: usize,
        destr: Option<Rc<dyn Fn(&mut [u8])>>,
    ) -> Rc<DataInfo> {
        let info = Rc::new(DataInfo {
            type_sym: self.intern(type_name),
            size,
            n_mems,
            destr,
        });
        self.data_infos.push(info.clone());
        info
    }

    /// Register a pointer descriptor.
    pub fn register_ptr_info(
        &mut self,
        type_name: &str,
        destr: Option<Rc<dyn Fn(usize)>>,
    ) -> Rc<PtrInfo> {
        let info = Rc::new(PtrInfo {
            type_sym: self.intern(type_name),
            destr,
        });
        self.ptr_infos.push(info.clone());
        info
    }

    /// Register a module loader for a module-type symbol.
    pub fn register_loader(&mut self, type_name: &str, loader: LoaderFn) {
        let sym = self.intern(type_name);
        self.loaders.insert(sym, loader);
    }

    /// Register the module path translator.
    pub fn set_path_translator(&mut self, translator: PathTranslator) {
        self.translator = Some(translator);
    }

    /// Look up a registered loader.
    pub fn loader(&self, type_sym: Symbol) -> Option<LoaderFn> {
        self.loaders.get(&type_sym).cloned()
    }

    /// Apply the registered path translator, if any.
    pub fn translate_path(&self, path: &str) -> String {
        match &self.translator {
            Some(t) => t(path),
            None => path.to_string(),
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        // Teardown: finalizers first, then destructors for every
        // object still on the heap, then pointer destructors.
        let fins = std::mem::take(&mut self.finalizers);
        for mut cb in fins {
            cb(self);
        }

        let objs = std::mem::take(&mut self.objs);
        for obj in &objs {
            object::destruct(obj);
        }
        self.drop_pending();
        self.ptrs.finish_cycle();
    }
}
