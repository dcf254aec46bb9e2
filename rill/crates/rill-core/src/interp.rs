//! The bytecode interpreter.
//!
//! A fetch/decode/execute loop with match dispatch over the current
//! frame's code.  The frame layout on the fiber's value stack, from
//! lowest to highest address, is:
//!
//! ```text
//! [closure][argument slots...][other local slots...][temporaries...]
//! ```
//!
//! `regs.lcl` indexes the closure slot; local `n` lives at
//! `lcl + 1 + n`.  Call results are copied down to the frame base on
//! return.  A `CALL` whose next instruction is `RETURN` is the tail
//! marker: the interpreter reuses the current frame, so tight tail
//! recursion consumes no native stack and no activation records.
//!
//! # Safepoints
//!
//! Collections requested by the allocator run only at safepoints —
//! the top of the frame loop, reached on every call, return, and
//! taken jump — where no heap cell is borrowed.  Inside the
//! instruction loop the running fiber stays mutably borrowed, which
//! is fine because nothing in there can trigger a trace.
//!
//! # Closed slots
//!
//! A local promoted to closed-over holds its upvalue cell directly
//! in the stack slot; reads and writes go through the cell, and
//! capture shares it.  Slot access is cell-transparent, so code
//! emitted before a capture promoted the slot stays correct.

use std::rc::Rc;

use crate::error::{ErrKind, Error, Result};
use crate::fiber::{Fiber, NatAr, VirAr};
use crate::fmt::FmtArg;
use crate::function::{FunKind, NatCall, NatOut};
use crate::object::{Closure, Obj};
use crate::opcode::OpCode;
use crate::record::{rec_def, rec_get, rec_pairs, rec_set};
use crate::state::State;
use crate::value::{vals_equal, vals_order, Ref, Value};

/// How a run of the interpreter ended.
pub(crate) enum RunEnd {
    /// The entry frame returned.
    Finished,
    /// A native yielded; the fiber is suspended.
    Yielded,
}

enum Entered {
    /// A virtual frame was set up; resume the dispatch loop.
    Vir,
    /// A native callback ran and its results are on the stack.
    NatRet,
    /// A native callback yielded.
    NatYield,
}

fn fib_cell(fib: &Rc<Obj>) -> &std::cell::RefCell<Fiber> {
    fib.as_fib().expect("fiber object")
}

/// Drive a fiber from a continuation: perform the staged entry call
/// on the first continuation, then run to completion or suspension.
pub(crate) fn run(state: &mut State, fib: &Rc<Obj>, first: bool) -> Result<RunEnd> {
    if first {
        match enter_call(state, fib, false)? {
            Entered::Vir => {}
            Entered::NatRet => return Ok(RunEnd::Finished),
            Entered::NatYield => return Ok(RunEnd::Yielded),
        }
    }
    loop_run(state, fib, 0)
}

/// Synchronous in-fiber call for the host surface: the stack already
/// holds `[closure][args...]` (with a tuple header for group sizes
/// other than one).  Returns the call's result values, popped.
pub(crate) fn run_call(state: &mut State, fib: &Rc<Obj>) -> Result<Vec<Value>> {
    let depth = fib_cell(fib).borrow().ars.len();
    match enter_call(state, fib, false)? {
        Entered::NatRet => {
            let mut f = fib_cell(fib).borrow_mut();
            Ok(pop_group(&mut f))
        }
        Entered::NatYield => Err(state.err_fmt(
            ErrKind::Fiber,
            "yield across a host call boundary",
            &[],
        )),
        Entered::Vir => match loop_run(state, fib, depth + 1)? {
            RunEnd::Yielded => Err(state.err_fmt(
                ErrKind::Fiber,
                "yield across a host call boundary",
                &[],
            )),
            RunEnd::Finished => {
                let mut f = fib_cell(fib).borrow_mut();
                let vals = pop_group(&mut f);
                // Restore the caller's frame if the call saved one
                // (a native entry frame has none to restore).
                if f.ars.len() > depth {
                    let ar = f.ars.pop().expect("caller frame saved by host call");
                    f.regs.ip = ar.ip;
                    f.regs.cls = Some(ar.cls);
                    f.regs.lcl = ar.lcl;
                }
                Ok(vals)
            }
        },
    }
}

/// The dispatch loop.  Runs frames until the frame at `base_depth`
/// returns, a native yields, or an error unwinds.
fn loop_run(state: &mut State, fib: &Rc<Obj>, base_depth: usize) -> Result<RunEnd> {
    'frames: loop {
        state.safepoint();

        let cls_rc = fib_cell(fib)
            .borrow()
            .regs
            .cls
            .clone()
            .expect("running fiber has a frame");
        let cur_cls = cls_rc.as_cls().expect("frame closure");
        let fun_rc = cur_cls.fun.clone();
        let vir = match &fun_rc.as_fun().expect("frame function").kind {
            FunKind::Vir(v) => v,
            FunKind::Nat(_) => unreachable!("virtual frames only"),
        };

        let mut f = fib_cell(fib).borrow_mut();
        loop {
            let instr = vir.code[f.regs.ip as usize];
            f.regs.ip += 1;
            let opr = instr.opr();
            let op = instr.op();

            match op {
                // ---- loads -------------------------------------------------
                OpCode::LoadNil => f.stack.push(Value::Nil),
                OpCode::LoadUdf => f.stack.push(Value::Udf),
                OpCode::LoadLog => f.stack.push(Value::Log(opr != 0)),
                OpCode::LoadInt => f.stack.push(Value::Int(opr as i64)),

                OpCode::GetConst => f.stack.push(vir.consts[opr as usize].clone()),
                OpCode::GetConst0
                | OpCode::GetConst1
                | OpCode::GetConst2
                | OpCode::GetConst3
                | OpCode::GetConst4
                | OpCode::GetConst5
                | OpCode::GetConst6
                | OpCode::GetConst7 => {
                    let i = (u8::from(op) - u8::from(OpCode::GetConst0)) as usize;
                    f.stack.push(vir.consts[i].clone());
                }

                // ---- variable access ---------------------------------------
                OpCode::GetLocal => {
                    let v = read_slot(&f, slot_at(&f, opr));
                    f.stack.push(v);
                }
                OpCode::GetLocal0
                | OpCode::GetLocal1
                | OpCode::GetLocal2
                | OpCode::GetLocal3
                | OpCode::GetLocal4
                | OpCode::GetLocal5
                | OpCode::GetLocal6
                | OpCode::GetLocal7 => {
                    let n = (u8::from(op) - u8::from(OpCode::GetLocal0)) as u16;
                    let v = read_slot(&f, slot_at(&f, n));
                    f.stack.push(v);
                }
                OpCode::GetClosed => {
                    let v = read_slot(&f, slot_at(&f, opr));
                    f.stack.push(v);
                }
                OpCode::GetClosed0
                | OpCode::GetClosed1
                | OpCode::GetClosed2
                | OpCode::GetClosed3
                | OpCode::GetClosed4
                | OpCode::GetClosed5
                | OpCode::GetClosed6
                | OpCode::GetClosed7 => {
                    let n = (u8::from(op) - u8::from(OpCode::GetClosed0)) as u16;
                    let v = read_slot(&f, slot_at(&f, n));
                    f.stack.push(v);
                }
                OpCode::GetUpval => {
                    let v = upval_get(cur_cls, opr);
                    f.stack.push(v);
                }
                OpCode::GetUpval0
                | OpCode::GetUpval1
                | OpCode::GetUpval2
                | OpCode::GetUpval3
                | OpCode::GetUpval4
                | OpCode::GetUpval5
                | OpCode::GetUpval6
                | OpCode::GetUpval7 => {
                    let n = (u8::from(op) - u8::from(OpCode::GetUpval0)) as u16;
                    let v = upval_get(cur_cls, n);
                    f.stack.push(v);
                }
                OpCode::GetGlobal => {
                    let v = state.env_get_global_by_loc(opr);
                    f.stack.push(v);
                }
                OpCode::GetField => {
                    let key = pop1(&mut f);
                    let rec = pop1(&mut f);
                    let v = rec_get(state, &rec, &key)?;
                    f.stack.push(v);
                }

                OpCode::RefLocal => f.stack.push(Value::Ref(Ref::Local(opr))),
                OpCode::RefClosed => f.stack.push(Value::Ref(Ref::Closed(opr))),
                OpCode::RefUpval => f.stack.push(Value::Ref(Ref::Upval(opr))),
                OpCode::RefGlobal => f.stack.push(Value::Ref(Ref::Global(opr))),

                // ---- assignment --------------------------------------------
                OpCode::DefOne | OpCode::SetOne => {
                    let val = pop_single(state, &mut f)?;
                    let r = pop_ref(&mut f);
                    assign_ref(state, &mut f, cur_cls, r, val)?;
                    f.stack.push(Value::Udf);
                }
                OpCode::DefTup | OpCode::SetTup => {
                    let group = pop_group(&mut f);
                    let refs = pop_refs(&mut f, opr as usize);
                    if group.len() != opr as usize {
                        return Err(state.err_fmt(
                            ErrKind::Tuple,
                            "tuple pattern of %u names got %u values",
                            &[FmtArg::U(opr as u64), FmtArg::U(group.len() as u64)],
                        ));
                    }
                    for (r, v) in refs.into_iter().zip(group) {
                        assign_ref(state, &mut f, cur_cls, r, v)?;
                    }
                    f.stack.push(Value::Udf);
                }
                OpCode::DefVtup | OpCode::SetVtup => {
                    let group = pop_group(&mut f);
                    let idx = pop_idx(&mut f);
                    let rest_ref = pop_ref(&mut f);
                    let refs = pop_refs(&mut f, opr as usize);
                    if group.len() < opr as usize {
                        return Err(state.err_fmt(
                            ErrKind::Tuple,
                            "tuple pattern needs at least %u values, got %u",
                            &[FmtArg::U(opr as u64), FmtArg::U(group.len() as u64)],
                        ));
                    }
                    let named = opr as usize;
                    for (r, v) in refs.into_iter().zip(group[..named].iter().cloned()) {
                        assign_ref(state, &mut f, cur_cls, r, v)?;
                    }
                    let rest = pack_ints(state, &idx, &group[named..])?;
                    assign_ref(state, &mut f, cur_cls, rest_ref, rest)?;
                    f.stack.push(Value::Udf);
                }
                OpCode::DefRec | OpCode::SetRec => {
                    let src = pop_single(state, &mut f)?;
                    let mut pairs = Vec::with_capacity(opr as usize);
                    for _ in 0..opr {
                        let key = pop1(&mut f);
                        let r = pop_ref(&mut f);
                        pairs.push((r, key));
                    }
                    pairs.reverse();
                    for (r, key) in pairs {
                        let v = rec_get(state, &src, &key)?;
                        assign_ref(state, &mut f, cur_cls, r, v)?;
                    }
                    f.stack.push(Value::Udf);
                }
                OpCode::DefVrec | OpCode::SetVrec => {
                    let src = pop_single(state, &mut f)?;
                    let idx = pop_idx(&mut f);
                    let rest_ref = pop_ref(&mut f);
                    let mut pairs = Vec::with_capacity(opr as usize);
                    for _ in 0..opr {
                        let key = pop1(&mut f);
                        let r = pop_ref(&mut f);
                        pairs.push((r, key));
                    }
                    pairs.reverse();

                    let mut named_keys = Vec::with_capacity(pairs.len());
                    for (r, key) in pairs {
                        let v = rec_get(state, &src, &key)?;
                        assign_ref(state, &mut f, cur_cls, r, v)?;
                        named_keys.push(key);
                    }

                    let rest_obj = state.new_rec_obj(idx);
                    let rest = Value::Obj(rest_obj);
                    for (key, val) in rec_pairs(state, &src)? {
                        if !named_keys.iter().any(|k| vals_equal(k, &key)) {
                            rec_def(state, &rest, &key, val)?;
                        }
                    }
                    assign_ref(state, &mut f, cur_cls, rest_ref, rest)?;
                    f.stack.push(Value::Udf);
                }
                OpCode::DefSig => {
                    let refs = pop_refs(&mut f, opr as usize);
                    let group = pop_group(&mut f);
                    if opr == 0 {
                        // A bare signal discards its payload.
                    } else if group.len() != opr as usize {
                        return Err(state.err_fmt(
                            ErrKind::Tuple,
                            "signal handler takes %u values, got %u",
                            &[FmtArg::U(opr as u64), FmtArg::U(group.len() as u64)],
                        ));
                    } else {
                        for (r, v) in refs.into_iter().zip(group) {
                            assign_ref(state, &mut f, cur_cls, r, v)?;
                        }
                    }
                }
                OpCode::DefVsig => {
                    let idx = pop_idx(&mut f);
                    let rest_ref = pop_ref(&mut f);
                    let refs = pop_refs(&mut f, opr as usize);
                    let group = pop_group(&mut f);
                    if group.len() < opr as usize {
                        return Err(state.err_fmt(
                            ErrKind::Tuple,
                            "signal handler takes at least %u values, got %u",
                            &[FmtArg::U(opr as u64), FmtArg::U(group.len() as u64)],
                        ));
                    }
                    let named = opr as usize;
                    for (r, v) in refs.into_iter().zip(group[..named].iter().cloned()) {
                        assign_ref(state, &mut f, cur_cls, r, v)?;
                    }
                    let rest = pack_ints(state, &idx, &group[named..])?;
                    assign_ref(state, &mut f, cur_cls, rest_ref, rest)?;
                }

                // ---- record-destination assignment -------------------------
                OpCode::RecDefOne | OpCode::RecSetOne => {
                    let src = pop_single(state, &mut f)?;
                    let key = pop1(&mut f);
                    let rec = pop1(&mut f);
                    if op == OpCode::RecDefOne {
                        rec_def(state, &rec, &key, src)?;
                    } else {
                        rec_set(state, &rec, &key, src)?;
                    }
                    f.stack.push(Value::Udf);
                }
                OpCode::RecDefTup | OpCode::RecSetTup => {
                    let group = pop_group(&mut f);
                    let mut keys = pop_vals(&mut f, opr as usize);
                    keys.reverse();
                    let rec = pop1(&mut f);
                    if group.len() != opr as usize {
                        return Err(state.err_fmt(
                            ErrKind::Tuple,
                            "key tuple of %u keys got %u values",
                            &[FmtArg::U(opr as u64), FmtArg::U(group.len() as u64)],
                        ));
                    }
                    for (key, v) in keys.into_iter().zip(group) {
                        if op == OpCode::RecDefTup {
                            rec_def(state, &rec, &key, v)?;
                        } else {
                            rec_set(state, &rec, &key, v)?;
                        }
                    }
                    f.stack.push(Value::Udf);
                }
                OpCode::RecDefVtup | OpCode::RecSetVtup => {
                    let group = pop_group(&mut f);
                    let idx = pop_idx(&mut f);
                    let rest_key = pop1(&mut f);
                    let mut keys = pop_vals(&mut f, opr as usize);
                    keys.reverse();
                    let rec = pop1(&mut f);
                    if group.len() < opr as usize {
                        return Err(state.err_fmt(
                            ErrKind::Tuple,
                            "key tuple needs at least %u values, got %u",
                            &[FmtArg::U(opr as u64), FmtArg::U(group.len() as u64)],
                        ));
                    }
                    let named = opr as usize;
                    for (key, v) in keys.into_iter().zip(group[..named].iter().cloned()) {
                        if op == OpCode::RecDefVtup {
                            rec_def(state, &rec, &key, v)?;
                        } else {
                            rec_set(state, &rec, &key, v)?;
                        }
                    }
                    let rest = pack_ints(state, &idx, &group[named..])?;
                    if op == OpCode::RecDefVtup {
                        rec_def(state, &rec, &rest_key, rest)?;
                    } else {
                        rec_set(state, &rec, &rest_key, rest)?;
                    }
                    f.stack.push(Value::Udf);
                }
                OpCode::RecDefRec | OpCode::RecSetRec => {
                    let src = pop_single(state, &mut f)?;
                    let mut pairs = Vec::with_capacity(opr as usize);
                    for _ in 0..opr {
                        let src_key = pop1(&mut f);
                        let dst_key = pop1(&mut f);
                        pairs.push((dst_key, src_key));
                    }
                    pairs.reverse();
                    let rec = pop1(&mut f);
                    for (dst_key, src_key) in pairs {
                        let v = rec_get(state, &src, &src_key)?;
                        if op == OpCode::RecDefRec {
                            rec_def(state, &rec, &dst_key, v)?;
                        } else {
                            rec_set(state, &rec, &dst_key, v)?;
                        }
                    }
                    f.stack.push(Value::Udf);
                }
                OpCode::RecDefVrec | OpCode::RecSetVrec => {
                    let src = pop_single(state, &mut f)?;
                    let idx = pop_idx(&mut f);
                    let rest_dst = pop1(&mut f);
                    let mut pairs = Vec::with_capacity(opr as usize);
                    for _ in 0..opr {
                        let src_key = pop1(&mut f);
                        let dst_key = pop1(&mut f);
                        pairs.push((dst_key, src_key));
                    }
                    pairs.reverse();
                    let rec = pop1(&mut f);

                    let mut src_keys = Vec::with_capacity(pairs.len());
                    for (dst_key, src_key) in pairs {
                        let v = rec_get(state, &src, &src_key)?;
                        if op == OpCode::RecDefVrec {
                            rec_def(state, &rec, &dst_key, v)?;
                        } else {
                            rec_set(state, &rec, &dst_key, v)?;
                        }
                        src_keys.push(src_key);
                    }

                    let rest_obj = state.new_rec_obj(idx);
                    let rest = Value::Obj(rest_obj);
                    for (key, val) in rec_pairs(state, &src)? {
                        if !src_keys.iter().any(|k| vals_equal(k, &key)) {
                            rec_def(state, &rest, &key, val)?;
                        }
                    }
                    if op == OpCode::RecDefVrec {
                        rec_def(state, &rec, &rest_dst, rest)?;
                    } else {
                        rec_set(state, &rec, &rest_dst, rest)?;
                    }
                    f.stack.push(Value::Udf);
                }

                // ---- builders ----------------------------------------------
                OpCode::MakeTup => f.stack.push(Value::Tup(opr)),
                OpCode::MakeVtup => {
                    let rec = pop1(&mut f);
                    let mut count = 0usize;
                    loop {
                        let v = rec_get(state, &rec, &Value::Int(count as i64))?;
                        if v.is_udf() {
                            break;
                        }
                        f.stack.push(v);
                        count += 1;
                    }
                    let total = opr as usize - 1 + count;
                    if total > u16::MAX as usize {
                        return Err(state.err_fmt(ErrKind::Tuple, "tuple too large", &[]));
                    }
                    if total != 1 {
                        f.stack.push(Value::Tup(total as u16));
                    }
                }
                OpCode::MakeRec | OpCode::MakeVrec => {
                    let mut pairs = Vec::with_capacity(opr as usize);
                    for _ in 0..opr {
                        let v = pop1(&mut f);
                        let k = pop1(&mut f);
                        pairs.push((k, v));
                    }
                    pairs.reverse();
                    let idx = pop_idx(&mut f);

                    let rec_obj = state.new_rec_obj(idx);
                    let recv = Value::Obj(rec_obj.clone());
                    let splice = (op == OpCode::MakeVrec).then(|| pairs.pop()).flatten();
                    for (k, v) in pairs {
                        rec_def(state, &recv, &k, v)?;
                    }
                    if let Some((base_key, src)) = splice {
                        let base = base_key.as_int().ok_or_else(|| {
                            Error::simple(
                                ErrKind::Record,
                                "record expansion needs an integer base key".into(),
                            )
                        })?;
                        let mut j = 0i64;
                        loop {
                            let v = rec_get(state, &src, &Value::Int(j))?;
                            if v.is_udf() {
                                break;
                            }
                            rec_def(state, &recv, &Value::Int(base + j), v)?;
                            j += 1;
                        }
                    }
                    rec_obj
                        .as_rec()
                        .expect("record object")
                        .borrow_mut()
                        .set_sep();
                    f.stack.push(recv);
                }
                OpCode::MakeCls => {
                    let refs = pop_refs(&mut f, opr as usize);
                    let fun_val = pop1(&mut f);
                    let fun_rc = match &fun_val {
                        Value::Obj(o) if o.as_fun().is_some() => o.clone(),
                        _ => unreachable!("closure construction over a function constant"),
                    };
                    let mut upvals = Vec::with_capacity(refs.len());
                    for r in refs {
                        upvals.push(capture(state, &mut f, cur_cls, r));
                    }
                    let cls = state.new_cls_obj(Closure {
                        fun: fun_rc,
                        upvals: upvals.into_boxed_slice(),
                        dat: None,
                    });
                    f.stack.push(Value::Obj(cls));
                }

                // ---- stack shuffling ---------------------------------------
                OpCode::Pop => {
                    pop_group(&mut f);
                }
                OpCode::Dup => {
                    let v = f.stack.last().expect("operand for dup").clone();
                    f.stack.push(v);
                }

                // ---- arithmetic --------------------------------------------
                OpCode::Neg => {
                    let a = pop1(&mut f);
                    let v = match a {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        Value::Dec(d) => Value::Dec(-d),
                        other => return Err(arith_unary_err(state, "negate", &other)),
                    };
                    f.stack.push(v);
                }
                OpCode::Not => {
                    let a = pop1(&mut f);
                    let v = match a {
                        Value::Int(i) => Value::Int(!i),
                        Value::Log(b) => Value::Log(!b),
                        other => return Err(arith_unary_err(state, "invert", &other)),
                    };
                    f.stack.push(v);
                }
                OpCode::Fix => {
                    let a = pop1(&mut f);
                    let v = match a {
                        Value::Int(i) => Value::Int(i),
                        Value::Dec(d) if d.is_finite() && d >= -(2f64.powi(62)) && d <= 2f64.powi(62) => {
                            Value::Int(d.trunc() as i64)
                        }
                        other => return Err(arith_unary_err(state, "fix", &other)),
                    };
                    f.stack.push(v);
                }
                OpCode::Pow
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Add
                | OpCode::Sub => {
                    let b = pop1(&mut f);
                    let a = pop1(&mut f);
                    let v = arith_bin(state, op, a, b)?;
                    f.stack.push(v);
                }
                OpCode::Lsl | OpCode::Lsr | OpCode::And | OpCode::Xor | OpCode::Or => {
                    let b = pop1(&mut f);
                    let a = pop1(&mut f);
                    let v = bits_bin(state, op, a, b)?;
                    f.stack.push(v);
                }

                // ---- comparisons -------------------------------------------
                OpCode::Imt | OpCode::Ilt | OpCode::Ime | OpCode::Ile => {
                    let b = pop1(&mut f);
                    let a = pop1(&mut f);
                    let ord = vals_order(state.syms(), &a, &b).ok_or_else(|| {
                        state.err_fmt(
                            ErrKind::Arith,
                            "values of %t and %t are not ordered",
                            &[FmtArg::T(&a), FmtArg::T(&b)],
                        )
                    })?;
                    let r = match op {
                        OpCode::Imt => ord.is_gt(),
                        OpCode::Ilt => ord.is_lt(),
                        OpCode::Ime => ord.is_ge(),
                        OpCode::Ile => ord.is_le(),
                        _ => unreachable!(),
                    };
                    f.stack.push(Value::Log(r));
                }
                OpCode::Iet | OpCode::Net => {
                    let b = pop1(&mut f);
                    let a = pop1(&mut f);
                    if a.is_udf() || b.is_udf() {
                        return Err(state.err_fmt(
                            ErrKind::Type,
                            "compared udf, use != for definedness tests",
                            &[],
                        ));
                    }
                    let eq = vals_equal(&a, &b);
                    f.stack
                        .push(Value::Log(if op == OpCode::Iet { eq } else { !eq }));
                }
                OpCode::Ietu => {
                    let b = pop1(&mut f);
                    let a = pop1(&mut f);
                    f.stack.push(Value::Log(vals_equal(&a, &b)));
                }

                // ---- control -----------------------------------------------
                OpCode::AndJump => {
                    let t = truth(state, f.stack.last().expect("operand for test"))?;
                    if !t {
                        f.regs.ip = vir.labels[opr as usize];
                    } else {
                        f.stack.pop();
                    }
                }
                OpCode::OrJump => {
                    let t = truth(state, f.stack.last().expect("operand for test"))?;
                    if t {
                        f.regs.ip = vir.labels[opr as usize];
                    } else {
                        f.stack.pop();
                    }
                }
                OpCode::UdfJump => {
                    let defined = !f.stack.last().expect("operand for test").is_udf();
                    if defined {
                        f.regs.ip = vir.labels[opr as usize];
                    } else {
                        f.stack.pop();
                    }
                }
                OpCode::AltJump => {
                    let v = pop1(&mut f);
                    if !truth(state, &v)? {
                        f.regs.ip = vir.labels[opr as usize];
                    }
                }
                OpCode::Jump => {
                    f.regs.ip = vir.labels[opr as usize];
                    if state.gc_ready() {
                        continue 'frames;
                    }
                }

                OpCode::Call => {
                    let tail = vir
                        .code
                        .get(f.regs.ip as usize)
                        .is_some_and(|i| i.op() == OpCode::Return);
                    drop(f);
                    match enter_call(state, fib, tail)? {
                        Entered::Vir | Entered::NatRet => continue 'frames,
                        Entered::NatYield => return Ok(RunEnd::Yielded),
                    }
                }
                OpCode::Return => {
                    let group = pop_group(&mut f);
                    let dst = f.regs.lcl as usize;
                    f.stack.truncate(dst);
                    push_group(&mut f, group);

                    if f.ars.len() > base_depth {
                        let ar = f.ars.pop().expect("caller frame");
                        f.regs.ip = ar.ip;
                        f.regs.cls = Some(ar.cls);
                        f.regs.lcl = ar.lcl;
                        continue 'frames;
                    }
                    return Ok(RunEnd::Finished);
                }
            }
        }
    }
}

/// Set up a call.  The stack holds `[closure][args...]` with a tuple
/// header for argument groups of size other than one.
fn enter_call(state: &mut State, fib: &Rc<Obj>, tail: bool) -> Result<Entered> {
    let mut f = fib_cell(fib).borrow_mut();

    let mut argc = 1usize;
    if let Some(Value::Tup(n)) = f.stack.last() {
        argc = *n as usize;
        f.stack.pop();
    }
    let mut base = f.stack.len() - argc - 1;

    let cls_rc = match &f.stack[base] {
        Value::Obj(o) if o.as_cls().is_some() => o.clone(),
        other => {
            let other = other.clone();
            return Err(state.err_fmt(ErrKind::Call, "called a %t value", &[FmtArg::T(&other)]));
        }
    };

    for i in 0..argc {
        if f.stack[base + 1 + i].is_udf() {
            return Err(state.err_fmt(
                ErrKind::Call,
                "passed udf for argument %u",
                &[FmtArg::U(i as u64)],
            ));
        }
    }

    let cls = cls_rc.as_cls().expect("closure object");
    let fun_rc = cls.fun.clone();
    let fun = fun_rc.as_fun().expect("function object");
    let parc = fun.nparams as usize;

    if argc < parc {
        let name = fun.name_text(state);
        return Err(state.err_fmt(
            ErrKind::Call,
            "too few arguments to `%s`",
            &[FmtArg::S(&name)],
        ));
    }
    if argc > parc {
        let Some(varg_idx) = fun.varg.clone() else {
            let name = fun.name_text(state);
            return Err(state.err_fmt(
                ErrKind::Call,
                "too many arguments to `%s`",
                &[FmtArg::S(&name)],
            ));
        };
        // Pack the surplus into a record keyed 0..k-1 through the
        // function's shared variadic index.
        let surplus: Vec<Value> = f.stack.split_off(base + 1 + parc);
        let rec = pack_ints(state, &varg_idx, &surplus)?;
        f.stack.push(rec);
        argc = parc + 1;
    }

    match &fun.kind {
        FunKind::Vir(vir) => {
            if tail {
                // Reuse the current frame: move the callee and its
                // arguments down to the frame base.
                let lcl = f.regs.lcl as usize;
                let moved = f.stack.split_off(base);
                f.stack.truncate(lcl);
                f.stack.extend(moved);
                base = lcl;
            } else if let Some(caller) = f.regs.cls.clone() {
                let (ip, lcl) = (f.regs.ip, f.regs.lcl);
                f.ars.push(VirAr {
                    cls: caller,
                    ip,
                    lcl,
                });
            }

            f.regs.cls = Some(cls_rc.clone());
            f.regs.ip = 0;
            f.regs.lcl = base as u32;

            let frame_top = base + 1 + vir.nlocals as usize;
            if f.stack.len() < frame_top {
                f.stack.resize(frame_top, Value::Udf);
            }
            f.stack.reserve(vir.ntemps as usize);
            Ok(Entered::Vir)
        }
        FunKind::Nat(nat) => {
            let name = state.syms().text(nat.name).into_owned();
            let (file, line) = match &f.regs.cls {
                Some(caller) => {
                    let caller_fun_rc = caller.as_cls().expect("closure object").fun.clone();
                    let caller_fun = caller_fun_rc.as_fun().expect("function object");
                    (
                        caller_fun
                            .file_text(state)
                            .unwrap_or_else(|| "<native>".to_string()),
                        caller_fun.line_at(f.regs.ip.saturating_sub(1)).unwrap_or(0),
                    )
                }
                None => ("<host>".to_string(), 0),
            };
            f.nats.push(NatAr {
                name: name.clone(),
                file,
                line,
            });

            let args = f.stack[base + 1..base + 1 + argc].to_vec();
            let dat = cls.dat.clone();
            let cb = nat.cb.clone();
            drop(f);

            let out = cb(state, NatCall { args, dat })?;

            let mut f = fib_cell(fib).borrow_mut();
            f.nats.pop();
            match out {
                NatOut::Ret(vals) => {
                    for v in &vals {
                        if !v.is_storable() {
                            return Err(state.err_fmt(
                                ErrKind::Tuple,
                                "a native callable returned a tuple header",
                                &[],
                            ));
                        }
                    }
                    f.stack.truncate(base);
                    push_group(&mut f, vals);
                    Ok(Entered::NatRet)
                }
                NatOut::Yield(vals) => {
                    if f.regs.cls.is_none() {
                        return Err(state.err_fmt(
                            ErrKind::Fiber,
                            "the fiber's entry callable yielded",
                            &[],
                        ));
                    }
                    f.yield_base = base as u32;
                    f.stack.truncate(base);
                    push_group(&mut f, vals);
                    Ok(Entered::NatYield)
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Stack helpers
// ----------------------------------------------------------------------

fn pop1(f: &mut Fiber) -> Value {
    f.stack.pop().expect("operand stack underflow")
}

/// Pop a group: a tuple header's worth of values, or a single value.
fn pop_group(f: &mut Fiber) -> Vec<Value> {
    match f.stack.last() {
        Some(Value::Tup(n)) => {
            let n = *n as usize;
            f.stack.pop();
            f.stack.split_off(f.stack.len() - n)
        }
        _ => vec![pop1(f)],
    }
}

/// Push a group, adding a header unless it is exactly one value.
fn push_group(f: &mut Fiber, vals: Vec<Value>) {
    let n = vals.len();
    f.stack.extend(vals);
    if n != 1 {
        f.stack.push(Value::Tup(n as u16));
    }
}

/// Pop exactly one storable value; a multi-value group is a fault.
fn pop_single(state: &mut State, f: &mut Fiber) -> Result<Value> {
    let v = pop1(f);
    if let Value::Tup(_) = v {
        return Err(state.err_fmt(
            ErrKind::Tuple,
            "a single value is required here, got a tuple",
            &[],
        ));
    }
    Ok(v)
}

fn pop_ref(f: &mut Fiber) -> Ref {
    match pop1(f) {
        Value::Ref(r) => r,
        _ => unreachable!("assignment consumes a reference"),
    }
}

fn pop_refs(f: &mut Fiber, n: usize) -> Vec<Ref> {
    let mut refs = Vec::with_capacity(n);
    for _ in 0..n {
        refs.push(pop_ref(f));
    }
    refs.reverse();
    refs
}

fn pop_vals(f: &mut Fiber, n: usize) -> Vec<Value> {
    let mut vals = Vec::with_capacity(n);
    for _ in 0..n {
        vals.push(pop1(f));
    }
    vals
}

fn pop_idx(f: &mut Fiber) -> Rc<Obj> {
    match pop1(f) {
        Value::Obj(o) if o.as_idx().is_some() => o,
        _ => unreachable!("variadic collector carries an index constant"),
    }
}

fn slot_at(f: &Fiber, n: u16) -> usize {
    f.regs.lcl as usize + 1 + n as usize
}

/// Read a local slot, transparently through an upvalue cell when the
/// slot was promoted by a capture.
fn read_slot(f: &Fiber, i: usize) -> Value {
    match &f.stack[i] {
        Value::Obj(o) => match o.as_upv() {
            Some(cell) => cell.borrow().clone(),
            None => f.stack[i].clone(),
        },
        v => v.clone(),
    }
}

/// Write a plain local slot.  The write is raw: a `def` reaching a
/// recycled slot replaces any promoted cell left there, so closures
/// over the old binding keep their own cell.
fn write_local(f: &mut Fiber, i: usize, val: Value) {
    f.stack[i] = val;
}

/// Write a closed-over slot through its upvalue cell, creating the
/// cell on first write.
fn write_closed(state: &mut State, f: &mut Fiber, i: usize, val: Value) {
    if let Value::Obj(o) = &f.stack[i] {
        if let Some(cell) = o.as_upv() {
            *cell.borrow_mut() = val;
            return;
        }
    }
    let upv = state.new_upv_obj(val);
    f.stack[i] = Value::Obj(upv);
}

fn upval_get(cls: &Closure, n: u16) -> Value {
    cls.upvals[n as usize]
        .as_upv()
        .expect("upvalue cell")
        .borrow()
        .clone()
}

/// Write a value through an assignment reference.
fn assign_ref(state: &mut State, f: &mut Fiber, cls: &Closure, r: Ref, val: Value) -> Result<()> {
    if !val.is_storable() {
        return Err(state.err_fmt(
            ErrKind::Tuple,
            "a tuple header is not a storable value",
            &[],
        ));
    }
    match r {
        Ref::Local(n) => write_local(f, slot_at(f, n), val),
        Ref::Closed(n) => write_closed(state, f, slot_at(f, n), val),
        Ref::Upval(n) => {
            *cls.upvals[n as usize]
                .as_upv()
                .expect("upvalue cell")
                .borrow_mut() = val;
        }
        Ref::Global(n) => state.env_set_global_by_loc(n, val),
    }
    Ok(())
}

/// Resolve a capture reference into the upvalue cell it shares,
/// promoting a raw local slot to a cell on first capture.
fn capture(state: &mut State, f: &mut Fiber, cls: &Closure, r: Ref) -> Rc<Obj> {
    match r {
        Ref::Local(n) | Ref::Closed(n) => {
            let i = slot_at(f, n);
            if let Value::Obj(o) = &f.stack[i] {
                if o.as_upv().is_some() {
                    return o.clone();
                }
            }
            let cur = f.stack[i].clone();
            let upv = state.new_upv_obj(cur);
            f.stack[i] = Value::Obj(upv.clone());
            upv
        }
        Ref::Upval(n) => cls.upvals[n as usize].clone(),
        Ref::Global(n) => state.env.slots[n as usize].clone(),
    }
}

/// Build a record over `idx` holding `vals` under contiguous integer
/// keys from zero.
fn pack_ints(state: &mut State, idx: &Rc<Obj>, vals: &[Value]) -> Result<Value> {
    let rec_obj = state.new_rec_obj(idx.clone());
    let recv = Value::Obj(rec_obj);
    for (i, v) in vals.iter().enumerate() {
        rec_def(state, &recv, &Value::Int(i as i64), v.clone())?;
    }
    Ok(recv)
}

// ----------------------------------------------------------------------
// Operator semantics
// ----------------------------------------------------------------------

fn truth(state: &mut State, v: &Value) -> Result<bool> {
    v.truthy()
        .ok_or_else(|| state.err_fmt(ErrKind::Type, "tested the truth of udf", &[]))
}

fn arith_unary_err(state: &mut State, verb: &str, v: &Value) -> Error {
    state.err_fmt(
        ErrKind::Arith,
        "cannot %s a %t value",
        &[FmtArg::S(verb), FmtArg::T(v)],
    )
}

fn arith_bin_err(state: &mut State, verb: &str, a: &Value, b: &Value) -> Error {
    state.err_fmt(
        ErrKind::Arith,
        "cannot %s %t and %t",
        &[FmtArg::S(verb), FmtArg::T(a), FmtArg::T(b)],
    )
}

/// Numeric dispatch for the arithmetic operators: (Int, Int) stays
/// integral, anything involving a Dec promotes, everything else is
/// an arithmetic fault.
fn arith_bin(state: &mut State, op: OpCode, a: Value, b: Value) -> Result<Value> {
    use OpCode::*;
    let verb = match op {
        Pow => "exponentiate",
        Mul => "multiply",
        Div => "divide",
        Mod => "modulo",
        Add => "add",
        Sub => "subtract",
        _ => unreachable!(),
    };
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            let v = match op {
                Pow => {
                    if y < 0 {
                        Value::Dec((x as f64).powf(y as f64))
                    } else {
                        Value::Int(x.wrapping_pow(y as u32))
                    }
                }
                Mul => Value::Int(x.wrapping_mul(y)),
                Div => {
                    if y == 0 {
                        return Err(state.err_fmt(ErrKind::Arith, "division by zero", &[]));
                    }
                    Value::Int(x.wrapping_div(y))
                }
                Mod => {
                    if y == 0 {
                        return Err(state.err_fmt(ErrKind::Arith, "modulo by zero", &[]));
                    }
                    Value::Int(x.wrapping_rem(y))
                }
                Add => Value::Int(x.wrapping_add(y)),
                Sub => Value::Int(x.wrapping_sub(y)),
                _ => unreachable!(),
            };
            Ok(v)
        }
        (Value::Int(_), Value::Dec(_)) | (Value::Dec(_), Value::Int(_))
        | (Value::Dec(_), Value::Dec(_)) => {
            let x = match &a {
                Value::Int(i) => *i as f64,
                Value::Dec(d) => *d,
                _ => unreachable!(),
            };
            let y = match &b {
                Value::Int(i) => *i as f64,
                Value::Dec(d) => *d,
                _ => unreachable!(),
            };
            let v = match op {
                Pow => x.powf(y),
                Mul => x * y,
                Div => x / y,
                Mod => x % y,
                Add => x + y,
                Sub => x - y,
                _ => unreachable!(),
            };
            Ok(Value::Dec(v))
        }
        _ => Err(arith_bin_err(state, verb, &a, &b)),
    }
}

/// Shift and bitwise operators: integral, with the logical operators
/// also defined over Log pairs.
fn bits_bin(state: &mut State, op: OpCode, a: Value, b: Value) -> Result<Value> {
    use OpCode::*;
    match (&a, &b, op) {
        (Value::Int(x), Value::Int(y), Lsl) => {
            Ok(Value::Int(((*x as u64).wrapping_shl(*y as u32)) as i64))
        }
        (Value::Int(x), Value::Int(y), Lsr) => {
            Ok(Value::Int(((*x as u64).wrapping_shr(*y as u32)) as i64))
        }
        (Value::Int(x), Value::Int(y), And) => Ok(Value::Int(x & y)),
        (Value::Int(x), Value::Int(y), Xor) => Ok(Value::Int(x ^ y)),
        (Value::Int(x), Value::Int(y), Or) => Ok(Value::Int(x | y)),
        (Value::Log(x), Value::Log(y), And) => Ok(Value::Log(*x && *y)),
        (Value::Log(x), Value::Log(y), Xor) => Ok(Value::Log(*x != *y)),
        (Value::Log(x), Value::Log(y), Or) => Ok(Value::Log(*x || *y)),
        _ => {
            let verb = match op {
                Lsl | Lsr => "shift",
                And => "and",
                Xor => "xor",
                Or => "or",
                _ => unreachable!(),
            };
            Err(arith_bin_err(state, verb, &a, &b))
        }
    }
}
