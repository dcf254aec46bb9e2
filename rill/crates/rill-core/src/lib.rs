//! rill-core - The Rill language runtime.
//!
//! Rill is a small dynamically-typed embeddable scripting language.
//! A host application creates one or more independent [`State`]
//! instances, compiles source text into callable closures, and
//! invokes them; scripts manipulate values drawn from a small fixed
//! type universe and can multiplex execution cooperatively through
//! first-class coroutines ("fibers").
//!
//! # Architecture
//!
//! The runtime is five interlocking subsystems:
//!
//! - **Values and objects** ([`value`], [`object`]): a tagged value
//!   carrying either an immediate (undefined, nil, logical, integer,
//!   decimal, symbol, opaque pointer, tuple header) or a shared
//!   reference to a heap object (string, index, record, function,
//!   closure, upvalue, fiber, data).
//! - **The collector** ([`gc`], [`state`]): a per-instance
//!   stop-the-world mark-sweep collector with registered root
//!   scanners, pending-allocation tracking, and a periodic full
//!   cycle that also sweeps interned symbols and pointer
//!   descriptors.
//! - **The compiler** ([`compile`]): a single-pass recursive-descent
//!   compiler that lexes, parses, and emits bytecode in one walk
//!   over the source, resolving variables into one of four scopes
//!   (local, closed-over, upvalue, global).
//! - **The interpreter** ([`interp`]): a match-dispatched loop over
//!   32-bit instructions with a value stack and a stack of virtual
//!   activation records; tail calls reuse their frame.
//! - **The fiber scheduler** ([`fiber`]): cooperative and
//!   single-threaded; each fiber owns its stacks, is resumed by its
//!   parent, suspends by yielding, and catches non-fatal errors at
//!   its boundary.
//!
//! # Threading
//!
//! A `State` is a single-mutator structure: callers must serialize
//! access to one instance.  Distinct instances are fully independent
//! — there is no process-wide runtime state.
//!
//! # Entry points
//!
//! The host surface lives in [`api`] as inherent methods on
//! [`State`]: compile sources, define globals, construct and inspect
//! values, continue fibers, register data and pointer descriptors.

pub mod api;
pub mod compile;
pub mod config;
pub mod data;
pub mod env;
pub mod error;
pub mod fiber;
pub mod fmt;
pub mod function;
pub mod gc;
pub mod index;
pub mod interp;
pub mod object;
pub mod opcode;
pub mod ptr;
pub mod record;
pub mod state;
pub mod value;

pub use api::Scope;
pub use config::Config;
pub use data::DataInfo;
pub use error::{ErrKind, Error, Result, TraceFrame};
pub use fiber::{FibError, FibState};
pub use object::{Obj, ObjKind};
pub use ptr::{PtrId, PtrInfo};
pub use state::State;
pub use value::Value;

// The lexer's source interface is part of the embedding contract;
// re-export it so hosts need only this crate.
pub use rill_lex::{FileSource, Source, StrSource};
pub use rill_util::{Symbol, SymbolTable};
