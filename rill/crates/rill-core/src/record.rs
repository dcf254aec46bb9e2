//! Records: the language's general keyed container.
//!
//! A record owns a densely-indexed value array and a reference to a
//! shared [`Index`] that maps keys to locators in that array.  All
//! records built from the same constructor share the constructor's
//! index, so defining a field on one makes the slot cheap for all of
//! them.
//!
//! # Separation
//!
//! A record flagged *separate* clones the index to a private one
//! before its next mutation would touch the shared mapping (binding
//! a key new to this record, or removing one).  Constructors flag
//! their records separate after the literal fields are defined, so a
//! record literal shares slots with its siblings until it diverges;
//! the `sep` operation exposes the same flag to scripts and hosts.
//! Plain overwrites of fields the record already has never touch the
//! index and never trigger separation.
//!
//! # The udf rules
//!
//! `udf` is not a value a field can hold: defining a field to `udf`
//! *removes* it, reading an absent field yields `udf`, and `udf` is
//! rejected as a key.  `set` differs from `def` in requiring the
//! field to already exist.

use std::rc::Rc;

use crate::error::{ErrKind, Result};
use crate::fmt::FmtArg;
use crate::object::Obj;
use crate::state::State;
use crate::value::Value;

/// Record payload; lives behind `RefCell` in [`crate::ObjKind::Rec`].
pub struct Record {
    /// The shared index (kind `Idx`).
    idx: Rc<Obj>,
    /// Separate-on-write flag.
    sep: bool,
    /// Field values addressed by locator; slots past the end are
    /// implicitly `udf`.  Never shrinks while the record is live.
    vals: Vec<Value>,
}

impl Record {
    pub(crate) fn new(idx: Rc<Obj>) -> Self {
        Self {
            idx,
            sep: false,
            vals: Vec::new(),
        }
    }

    pub fn idx_obj(&self) -> &Rc<Obj> {
        &self.idx
    }

    pub fn is_sep(&self) -> bool {
        self.sep
    }

    pub(crate) fn set_sep(&mut self) {
        self.sep = true;
    }

    pub(crate) fn vals_capacity(&self) -> usize {
        self.vals.len()
    }

    /// The value at a locator; `udf` past the array.
    pub(crate) fn val_at(&self, loc: u32) -> Value {
        self.vals.get(loc as usize).cloned().unwrap_or(Value::Udf)
    }

    fn put(&mut self, loc: u32, val: Value) {
        let i = loc as usize;
        if i >= self.vals.len() {
            self.vals.resize(i + 1, Value::Udf);
        }
        self.vals[i] = val;
    }

    /// Iterate populated `(locator, value)` pairs.
    pub(crate) fn populated(&self) -> impl Iterator<Item = (u32, &Value)> + '_ {
        self.vals
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_udf())
            .map(|(i, v)| (i as u32, v))
    }

    /// Release the record's index references and drop its values.
    /// Used by the sweep; tolerant of an already-cleared index.
    pub(crate) fn clear(&mut self) {
        if let Some(idx) = self.idx.as_idx() {
            if let Ok(mut idx) = idx.try_borrow_mut() {
                for (loc, _) in self
                    .vals
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| !v.is_udf())
                    .map(|(i, v)| (i as u32, v))
                {
                    idx.rem_by_loc(loc);
                }
            }
        }
        self.vals.clear();
    }
}

fn check_key(state: &mut State, key: &Value) -> Result<()> {
    if key.is_udf() {
        return Err(state.err_fmt(ErrKind::Record, "udf is not a valid record key", &[]));
    }
    if !key.is_storable() {
        return Err(state.err_fmt(
            ErrKind::Record,
            "%t is not a valid record key",
            &[FmtArg::T(key)],
        ));
    }
    Ok(())
}

fn check_val(state: &mut State, val: &Value) -> Result<()> {
    if !val.is_storable() {
        return Err(state.err_fmt(
            ErrKind::Tuple,
            "a tuple header is not a storable value",
            &[],
        ));
    }
    Ok(())
}

fn rec_cell(state: &mut State, recv: &Value) -> Result<Rc<Obj>> {
    match recv.as_obj() {
        Some(o) if o.as_rec().is_some() => Ok(o.clone()),
        _ => Err(state.err_fmt(
            ErrKind::Record,
            "expected a record, not %t",
            &[FmtArg::T(recv)],
        )),
    }
}

/// Clone the shared index into a private one holding exactly this
/// record's populated locators, then point the record at it.
fn separate(state: &mut State, rec_obj: &Rc<Obj>) {
    let new_idx = {
        let rec = rec_obj.as_rec().expect("record object").borrow();
        let idx = rec.idx.as_idx().expect("record index").borrow();
        let vals = &rec.vals;
        idx.sub(state.syms(), |loc| {
            vals.get(loc as usize).is_some_and(|v| !v.is_udf())
        })
    };

    // Release this record's references against the old index.
    {
        let rec = rec_obj.as_rec().expect("record object").borrow();
        let mut idx = rec.idx.as_idx().expect("record index").borrow_mut();
        for (loc, _) in rec.populated() {
            idx.rem_by_loc(loc);
        }
    }

    let new_idx_obj = state.new_idx_from(new_idx);
    let mut rec = rec_obj.as_rec().expect("record object").borrow_mut();
    rec.idx = new_idx_obj;
    rec.sep = false;
}

/// Define or overwrite a field; defining to `udf` removes.
pub fn rec_def(state: &mut State, recv: &Value, key: &Value, val: Value) -> Result<()> {
    check_key(state, key)?;
    check_val(state, &val)?;
    let rec_obj = rec_cell(state, recv)?;

    if val.is_udf() {
        return rec_remove(state, &rec_obj, key);
    }

    // Plain overwrite of a field this record already has touches
    // neither the index nor the separation flag.
    {
        let rec = rec_obj.as_rec().expect("record object").borrow();
        let idx = rec.idx.as_idx().expect("record index").borrow();
        if let Some(loc) = idx.get_by_key(state.syms(), key) {
            if !rec.val_at(loc).is_udf() {
                drop(idx);
                drop(rec);
                let mut rec = rec_obj.as_rec().expect("record object").borrow_mut();
                rec.put(loc, val);
                return Ok(());
            }
        }
    }

    // Binding a key new to this record mutates the shared mapping,
    // so a separate-flagged record clones it first.
    let is_sep = rec_obj.as_rec().expect("record object").borrow().is_sep();
    if is_sep {
        separate(state, &rec_obj);
    }

    let rec = rec_obj.as_rec().expect("record object");
    let loc = {
        let rec_ref = rec.borrow();
        let mut idx = rec_ref.idx.as_idx().expect("record index").borrow_mut();
        idx.add_by_key(state.syms(), key)
    };
    rec.borrow_mut().put(loc, val);
    Ok(())
}

fn rec_remove(state: &mut State, rec_obj: &Rc<Obj>, key: &Value) -> Result<()> {
    let existing = {
        let rec = rec_obj.as_rec().expect("record object").borrow();
        let idx = rec.idx.as_idx().expect("record index").borrow();
        idx.get_by_key(state.syms(), key)
            .filter(|&loc| !rec.val_at(loc).is_udf())
    };
    let Some(_) = existing else {
        return Ok(());
    };

    let is_sep = rec_obj.as_rec().expect("record object").borrow().is_sep();
    if is_sep {
        separate(state, rec_obj);
    }

    let rec = rec_obj.as_rec().expect("record object");
    let loc = {
        let rec_ref = rec.borrow();
        let idx = rec_ref.idx.as_idx().expect("record index").borrow();
        idx.get_by_key(state.syms(), key)
    };
    if let Some(loc) = loc {
        {
            let rec_ref = rec.borrow();
            let mut idx = rec_ref.idx.as_idx().expect("record index").borrow_mut();
            idx.rem_by_loc(loc);
        }
        rec.borrow_mut().put(loc, Value::Udf);
    }
    Ok(())
}

/// Overwrite an existing field; absent fields are an error.
pub fn rec_set(state: &mut State, recv: &Value, key: &Value, val: Value) -> Result<()> {
    check_key(state, key)?;
    check_val(state, &val)?;
    if val.is_udf() {
        return Err(state.err_fmt(
            ErrKind::Record,
            "cannot set a field to udf, use def to remove it",
            &[],
        ));
    }
    let rec_obj = rec_cell(state, recv)?;

    let loc = {
        let rec = rec_obj.as_rec().expect("record object").borrow();
        let idx = rec.idx.as_idx().expect("record index").borrow();
        idx.get_by_key(state.syms(), key)
            .filter(|&loc| !rec.val_at(loc).is_udf())
    };
    match loc {
        Some(loc) => {
            rec_obj
                .as_rec()
                .expect("record object")
                .borrow_mut()
                .put(loc, val);
            Ok(())
        }
        None => Err(state.err_fmt(
            ErrKind::Record,
            "set of undefined field %q",
            &[FmtArg::Q(key)],
        )),
    }
}

/// Read a field; absent fields read as `udf`.
pub fn rec_get(state: &mut State, recv: &Value, key: &Value) -> Result<Value> {
    check_key(state, key)?;
    let rec_obj = rec_cell(state, recv)?;

    let rec = rec_obj.as_rec().expect("record object").borrow();
    let idx = rec.idx.as_idx().expect("record index").borrow();
    Ok(match idx.get_by_key(state.syms(), key) {
        Some(loc) => rec.val_at(loc),
        None => Value::Udf,
    })
}

/// Flip the separate flag: the next index-touching mutation clones
/// the shared index to a private one.
pub fn rec_sep(state: &mut State, recv: &Value) -> Result<()> {
    let rec_obj = rec_cell(state, recv)?;
    rec_obj
        .as_rec()
        .expect("record object")
        .borrow_mut()
        .set_sep();
    Ok(())
}

/// Snapshot the record's `(key, value)` pairs in index slot order.
pub fn rec_pairs(state: &mut State, recv: &Value) -> Result<Vec<(Value, Value)>> {
    let rec_obj = rec_cell(state, recv)?;
    let rec = rec_obj.as_rec().expect("record object").borrow();
    let idx = rec.idx.as_idx().expect("record index").borrow();
    Ok(idx
        .iter()
        .filter_map(|(key, loc)| {
            let v = rec.val_at(loc);
            if v.is_udf() {
                None
            } else {
                Some((key.clone(), v))
            }
        })
        .collect())
}
