//! rill-util - Foundation types for the Rill runtime.
//!
//! This crate holds the small utility layer the rest of the runtime is
//! built on:
//!
//! - [`symbol`]: the per-instance byte-sequence interner.  Every
//!   identifier, keyword, and symbol literal in a running language
//!   instance is a compact [`symbol::Symbol`] handle into one of these
//!   tables, so equality is an integer compare regardless of payload
//!   length.  Unlike a compiler-wide interner, the table is owned by a
//!   single language instance and supports mark/sweep so symbols that
//!   become unreachable can be reclaimed on full collection cycles.
//! - [`index_vec`]: typed indices and the `IndexVec` wrapper, used to
//!   keep the compiler's separate slot namespaces (locals, upvalues,
//!   labels, constants) from being mixed up.
//!
//! Nothing in this crate knows about values, objects, or the
//! interpreter; it is deliberately a leaf.

pub mod index_vec;
pub mod symbol;

pub use index_vec::{Idx, IndexVec};
pub use symbol::{Symbol, SymbolTable};

// Re-export commonly used hash types so dependents agree on one
// hasher for identifier-shaped keys.
pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
