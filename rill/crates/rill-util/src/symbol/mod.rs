//! Symbols - interned byte sequences with O(1) equality.
//!
//! A [`Symbol`] is a 4-byte handle into a [`SymbolTable`].  Two
//! symbols drawn from the same table compare equal exactly when their
//! payload bytes are equal, so the runtime can compare identifiers and
//! symbol values with a single integer compare no matter how long the
//! underlying text is.
//!
//! # Per-instance tables
//!
//! Each language instance owns its own `SymbolTable`; there is no
//! process-global interner and no locking.  A `Symbol` is only
//! meaningful together with the table that produced it — handles from
//! different instances must never be mixed, and nothing here (or in
//! the runtime) ever does so.
//!
//! # Collection
//!
//! Interned symbols are not permanent.  On full collection cycles the
//! garbage collector calls [`SymbolTable::mark`] for every symbol it
//! can reach, then [`SymbolTable::sweep`]; unmarked entries are freed
//! and their ids recycled for future interns.  This keeps long-lived
//! instances from accumulating every identifier they have ever seen.
//!
//! # Hashing
//!
//! Lookup hashes the payload bytes (with `ahash`), never the handle,
//! so a re-interned sequence always finds its existing entry and the
//! hash of a symbol value observed by the rest of the runtime is a
//! content hash.

mod interner;

pub use interner::SymbolTable;

/// An interned byte sequence handle.
///
/// `Symbol` is `Copy` and 4 bytes; it is the identifier currency of
/// the whole runtime (variable names, record keys written as symbol
/// literals, type names, fiber tags).  Equality and ordering are by
/// id; content ordering is available through the owning table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(pub(crate) u32);

impl Symbol {
    /// The raw table id.  Only useful for debug output and
    /// serialization; the id is dense but may be recycled after a
    /// sweep frees the entry.
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }

    /// Rebuild a symbol from a raw id.
    ///
    /// The caller must guarantee the id names a live entry in the
    /// table the symbol will be used with.
    #[inline]
    pub fn from_id(id: u32) -> Self {
        Symbol(id)
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

static_assertions::assert_eq_size!(Symbol, u32);
static_assertions::assert_impl_all!(Symbol: Copy, Send, Sync);
