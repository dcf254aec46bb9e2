//! The value representation.
//!
//! A [`Value`] is the uniform tagged value scripts manipulate.  Most
//! tags are immediates; `Obj` is a shared reference into the
//! instance's heap.  Two tags never leave the value stack:
//!
//! - `Tup(n)` marks the top of a group of `n` values.  A group of
//!   any size other than one carries a header; storing a header into
//!   a record field, variable, or upvalue is a runtime fault.
//! - `Ref(_)` is a first-class assignment destination pushed by the
//!   `REF_*` opcodes and consumed by the assignment opcodes.
//!
//! # Equality
//!
//! Equality is structural: immediates by payload (decimals compare
//! *bitwise*, so NaN equals itself and `-0.0` differs from `0.0`),
//! symbols by interned identity (which is payload equality within an
//! instance), strings by content, all other heap objects by
//! identity.  Values of different tags are never equal.
//!
//! # Hashing
//!
//! Hashes are content hashes: a symbol hashes its payload bytes, not
//! its handle, so hashing requires the owning instance's symbol
//! table.

use std::cmp::Ordering;
use std::hash::Hasher;
use std::rc::Rc;

use ahash::AHasher;
use rill_util::{Symbol, SymbolTable};

use crate::object::{Obj, ObjKind};
use crate::ptr::PtrId;

/// A first-class assignment destination.
///
/// Stack-only; see the module docs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ref {
    Global(u16),
    Upval(u16),
    Local(u16),
    Closed(u16),
}

/// A tagged value.
#[derive(Clone)]
pub enum Value {
    /// The distinguished "undefined" marker: uninitialized locals,
    /// deleted record fields, sentinel returns.
    Udf,
    /// The script-visible null.
    Nil,
    /// A logical (boolean) value.
    Log(bool),
    /// A machine integer.
    Int(i64),
    /// A 64-bit decimal.
    Dec(f64),
    /// An interned symbol.
    Sym(Symbol),
    /// An opaque pointer, typed through the instance's pointer table.
    Ptr(PtrId),
    /// A heap object.
    Obj(Rc<Obj>),
    /// Stack-only tuple header: the size of the group beneath it.
    Tup(u16),
    /// Stack-only assignment reference.
    Ref(Ref),
}

impl Value {
    pub fn is_udf(&self) -> bool {
        matches!(self, Value::Udf)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_log(&self) -> bool {
        matches!(self, Value::Log(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_dec(&self) -> bool {
        matches!(self, Value::Dec(_))
    }

    pub fn is_sym(&self) -> bool {
        matches!(self, Value::Sym(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Value::Ptr(_))
    }

    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    pub fn is_tup(&self) -> bool {
        matches!(self, Value::Tup(_))
    }

    pub fn as_log(&self) -> Option<bool> {
        match self {
            Value::Log(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dec(&self) -> Option<f64> {
        match self {
            Value::Dec(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_sym(&self) -> Option<Symbol> {
        match self {
            Value::Sym(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<&Rc<Obj>> {
        match self {
            Value::Obj(o) => Some(o),
            _ => None,
        }
    }

    /// True for values legal in storable slots (record fields,
    /// variables, upvalues).  `Udf` is storable at this level; the
    /// places that forbid it check separately.
    pub fn is_storable(&self) -> bool {
        !matches!(self, Value::Tup(_) | Value::Ref(_))
    }

    /// Truthiness: `false` and `nil` are falsy, everything else is
    /// truthy.  `udf` has no truth value; testing it is a fault the
    /// caller raises.
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Udf => None,
            Value::Nil | Value::Log(false) => Some(false),
            _ => Some(true),
        }
    }

    /// The value's type name; data and pointer values refine this
    /// through their descriptors, which the [`crate::State`] layer
    /// handles.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Udf => "udf",
            Value::Nil => "nil",
            Value::Log(_) => "log",
            Value::Int(_) => "int",
            Value::Dec(_) => "dec",
            Value::Sym(_) => "sym",
            Value::Ptr(_) => "ptr",
            Value::Obj(o) => o.kind_name(),
            Value::Tup(_) => "tup",
            Value::Ref(_) => "ref",
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Udf => write!(f, "udf"),
            Value::Nil => write!(f, "nil"),
            Value::Log(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Dec(d) => write!(f, "{d:?}"),
            Value::Sym(s) => write!(f, "sym#{}", s.id()),
            Value::Ptr(p) => write!(f, "ptr#{}", p.id()),
            Value::Obj(o) => write!(f, "<{}>", o.kind_name()),
            Value::Tup(n) => write!(f, "tup({n})"),
            Value::Ref(r) => write!(f, "{r:?}"),
        }
    }
}

/// Structural equality; see the module docs.  `udf = udf` holds at
/// this level — call sites that forbid `udf` operands check first.
pub fn vals_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Udf, Value::Udf) => true,
        (Value::Nil, Value::Nil) => true,
        (Value::Log(x), Value::Log(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Dec(x), Value::Dec(y)) => x.to_bits() == y.to_bits(),
        (Value::Sym(x), Value::Sym(y)) => x == y,
        (Value::Ptr(x), Value::Ptr(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => match (&x.kind, &y.kind) {
            (ObjKind::Str(xs), ObjKind::Str(ys)) => xs == ys,
            _ => Rc::ptr_eq(x, y),
        },
        (Value::Tup(x), Value::Tup(y)) => x == y,
        (Value::Ref(x), Value::Ref(y)) => x == y,
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        vals_equal(self, other)
    }
}

/// Content hash of a value; consistent with [`vals_equal`].
pub fn hash_value(syms: &SymbolTable, v: &Value) -> u64 {
    let mut h = AHasher::default();
    match v {
        Value::Udf => h.write_u8(0),
        Value::Nil => h.write_u8(1),
        Value::Log(b) => {
            h.write_u8(2);
            h.write_u8(*b as u8);
        }
        Value::Int(i) => {
            h.write_u8(3);
            h.write_i64(*i);
        }
        Value::Dec(d) => {
            h.write_u8(4);
            h.write_u64(d.to_bits());
        }
        Value::Sym(s) => {
            h.write_u8(5);
            h.write(syms.bytes(*s));
        }
        Value::Ptr(p) => {
            h.write_u8(6);
            h.write_u32(p.id());
        }
        Value::Obj(o) => match &o.kind {
            ObjKind::Str(bytes) => {
                h.write_u8(7);
                h.write(bytes);
            }
            _ => {
                h.write_u8(8);
                h.write_usize(Rc::as_ptr(o) as usize);
            }
        },
        Value::Tup(n) => {
            h.write_u8(9);
            h.write_u16(*n);
        }
        Value::Ref(_) => h.write_u8(10),
    }
    h.finish()
}

/// Ordering for the comparison operators.  Numeric for Int/Dec with
/// promotion, lexicographic byte order for Sym/Sym and Str/Str.
/// Everything else has no defined order and returns `None`; the
/// interpreter raises an arithmetic fault there.
pub fn vals_order(syms: &SymbolTable, a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Dec(y)) => (*x as f64).partial_cmp(y),
        (Value::Dec(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Dec(x), Value::Dec(y)) => x.partial_cmp(y),
        (Value::Sym(x), Value::Sym(y)) => Some(syms.bytes(*x).cmp(syms.bytes(*y))),
        (Value::Obj(x), Value::Obj(y)) => match (&x.kind, &y.kind) {
            (ObjKind::Str(xs), ObjKind::Str(ys)) => Some(xs.cmp(ys)),
            _ => None,
        },
        _ => None,
    }
}

static_assertions::assert_impl_all!(Value: Clone);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert_eq!(Value::Nil.truthy(), Some(false));
        assert_eq!(Value::Log(false).truthy(), Some(false));
        assert_eq!(Value::Log(true).truthy(), Some(true));
        assert_eq!(Value::Int(0).truthy(), Some(true));
        assert_eq!(Value::Udf.truthy(), None);
    }

    #[test]
    fn dec_equality_is_bitwise() {
        let nan = Value::Dec(f64::NAN);
        assert!(vals_equal(&nan, &nan.clone()));
        assert!(!vals_equal(&Value::Dec(0.0), &Value::Dec(-0.0)));
        assert!(vals_equal(&Value::Dec(1.5), &Value::Dec(1.5)));
    }

    #[test]
    fn cross_tag_never_equal() {
        assert!(!vals_equal(&Value::Int(1), &Value::Dec(1.0)));
        assert!(!vals_equal(&Value::Nil, &Value::Udf));
        assert!(!vals_equal(&Value::Log(false), &Value::Nil));
    }

    #[test]
    fn sym_hash_is_content_hash() {
        let mut syms = SymbolTable::new();
        let a = syms.intern(b"alpha");
        let b = syms.intern(b"alpha");
        assert_eq!(
            hash_value(&syms, &Value::Sym(a)),
            hash_value(&syms, &Value::Sym(b))
        );
        let c = syms.intern(b"beta");
        assert_ne!(
            hash_value(&syms, &Value::Sym(a)),
            hash_value(&syms, &Value::Sym(c))
        );
    }

    #[test]
    fn numeric_ordering_promotes() {
        let syms = SymbolTable::new();
        assert_eq!(
            vals_order(&syms, &Value::Int(2), &Value::Dec(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            vals_order(&syms, &Value::Dec(3.0), &Value::Int(3)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn sym_ordering_is_byte_order() {
        let mut syms = SymbolTable::new();
        let a = syms.intern(b"abc");
        let b = syms.intern(b"abd");
        assert_eq!(
            vals_order(&syms, &Value::Sym(a), &Value::Sym(b)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn mixed_types_have_no_order() {
        let mut syms = SymbolTable::new();
        let s = syms.intern(b"x");
        assert_eq!(vals_order(&syms, &Value::Int(1), &Value::Sym(s)), None);
        assert_eq!(vals_order(&syms, &Value::Nil, &Value::Nil), None);
    }

    #[test]
    fn storability() {
        assert!(Value::Udf.is_storable());
        assert!(Value::Int(3).is_storable());
        assert!(!Value::Tup(2).is_storable());
        assert!(!Value::Ref(Ref::Local(0)).is_storable());
    }
}
