//! Fiber scheduling: continue/yield rendezvous, error localization,
//! state transitions.

mod common;

use common::{eval, eval1, install_yield, run_script, state};
use rill_core::{ErrKind, FibState, Scope, StrSource, Value};

#[test]
fn rendezvous_yields_then_finishes() {
    let mut s = state();
    install_yield(&mut s);

    let mut src = StrSource::new(
        "<test>",
        "[] do yield 10, yield 20 for udf",
    );
    let cls = s.compile_expr(&mut src, Scope::Global).expect("compiles");
    let cls = s.call(&cls, &[]).expect("builds the closure")[0].clone();
    let fib = s.fib_new(&cls, None).expect("fiber");

    let first = s.fib_cont(&fib, &[]).expect("first continuation");
    assert_eq!(first, vec![Value::Int(10)]);
    assert_eq!(s.fib_state(&fib).unwrap(), FibState::Stopped);

    let second = s.fib_cont(&fib, &[]).expect("second continuation");
    assert_eq!(second, vec![Value::Int(20)]);
    assert_eq!(s.fib_state(&fib).unwrap(), FibState::Stopped);

    let last = s.fib_cont(&fib, &[]).expect("final continuation");
    assert_eq!(last, vec![Value::Udf]);
    assert_eq!(s.fib_state(&fib).unwrap(), FibState::Finished);
}

#[test]
fn continuation_arguments_replace_yields() {
    let mut s = state();
    install_yield(&mut s);

    // The fiber echoes back transformed continuation arguments.
    let mut src = StrSource::new(
        "<test>",
        "[] do def got: yield 'ready' for yield (got + 1)",
    );
    let cls = s.compile_expr(&mut src, Scope::Global).expect("compiles");
    let cls = s.call(&cls, &[]).expect("builds the closure")[0].clone();
    let fib = s.fib_new(&cls, None).expect("fiber");

    let ready = s.fib_cont(&fib, &[]).expect("starts");
    assert_eq!(ready, vec![s.sym("ready")]);

    let answer = s.fib_cont(&fib, &[Value::Int(41)]).expect("resumes");
    assert_eq!(answer, vec![Value::Int(42)]);
}

#[test]
fn entry_arguments_reach_the_closure() {
    let mut s = state();
    let mut src = StrSource::new("<test>", "[a, b] a * b");
    let cls = s.compile_expr(&mut src, Scope::Global).expect("compiles");
    let cls = s.call(&cls, &[]).expect("builds the closure")[0].clone();
    let fib = s.fib_new(&cls, None).expect("fiber");

    let out = s
        .fib_cont(&fib, &[Value::Int(6), Value::Int(7)])
        .expect("runs");
    assert_eq!(out, vec![Value::Int(42)]);
    assert_eq!(s.fib_state(&fib).unwrap(), FibState::Finished);
}

#[test]
fn errors_localize_to_the_failing_fiber() {
    let mut s = state();
    let mut src = StrSource::new("<bad>", "[] 1 + 'x'");
    let cls = s.compile_expr(&mut src, Scope::Global).expect("compiles");
    let cls = s.call(&cls, &[]).expect("builds the closure")[0].clone();
    let tag = s.intern("worker");
    let fib = s.fib_new(&cls, Some(tag)).expect("fiber");

    // The parent continuation returns normally with an empty tuple.
    let out = s.fib_cont(&fib, &[]).expect("parent survives");
    assert!(out.is_empty());
    assert_eq!(s.fib_state(&fib).unwrap(), FibState::Failed);

    let err = s.fib_err(&fib).expect("failed fiber holds its error");
    assert_eq!(err.kind, ErrKind::Arith);
    assert!(!err.trace.is_empty());
    // The trace names the fiber's tag and the offending line.
    assert!(err.trace.iter().any(|f| f.unit.as_deref() == Some("worker")));
    assert!(err.trace.iter().any(|f| f.line == 1 && f.file == "<bad>"));
}

#[test]
fn failed_fibers_cannot_be_continued() {
    let mut s = state();
    let mut src = StrSource::new("<test>", "[] 1 + nil");
    let fib = s
        .compile_fiber(&mut src, Scope::Global, false, None)
        .expect("compiles");

    s.fib_cont(&fib, &[]).expect("absorbs the error");
    assert_eq!(s.fib_state(&fib).unwrap(), FibState::Failed);

    let err = s.fib_cont(&fib, &[]).unwrap_err();
    assert_eq!(err.kind, ErrKind::Fiber);
}

#[test]
fn finished_fibers_cannot_be_continued() {
    let mut s = state();
    let mut src = StrSource::new("<test>", "[] 7");
    let fib = s
        .compile_fiber(&mut src, Scope::Global, false, None)
        .expect("compiles");

    assert_eq!(s.fib_cont(&fib, &[]).expect("runs"), vec![Value::Int(7)]);
    let err = s.fib_cont(&fib, &[]).unwrap_err();
    assert_eq!(err.kind, ErrKind::Fiber);
}

#[test]
fn udf_continuation_arguments_are_rejected() {
    let mut s = state();
    let mut src = StrSource::new("<test>", "[x] x");
    let fib = s
        .compile_fiber(&mut src, Scope::Global, false, None)
        .expect("compiles");
    let err = s.fib_cont(&fib, &[Value::Udf]).unwrap_err();
    assert_eq!(err.kind, ErrKind::Call);
}

#[test]
fn fiber_tags_are_kept() {
    let mut s = state();
    let mut src = StrSource::new("<test>", "[] 1");
    let fib = s
        .compile_fiber(&mut src, Scope::Global, false, Some("ticker"))
        .expect("compiles");
    let tag = s.fib_tag(&fib).expect("tagged");
    assert_eq!(s.sym_text(tag), "ticker");
}

#[test]
fn script_defined_fiber_bodies_rendezvous() {
    let mut s = state();
    install_yield(&mut s);

    run_script(
        &mut s,
        "def child_body: [] do yield 1, yield 2 for udf",
    )
    .expect("compiles");

    let cls = eval(&mut s, "child_body").expect("closure")[0].clone();
    let child = s.fib_new(&cls, None).expect("fiber");

    assert_eq!(s.fib_cont(&child, &[]).expect("first"), vec![Value::Int(1)]);
    assert_eq!(s.fib_cont(&child, &[]).expect("second"), vec![Value::Int(2)]);
    assert_eq!(
        s.fib_cont(&child, &[]).expect("finish"),
        vec![Value::Udf]
    );
    assert_eq!(s.fib_state(&child).unwrap(), FibState::Finished);
}

#[test]
fn parent_state_is_restored_after_child_failure() {
    let mut s = state();

    // Drive a failing child from within a running parent fiber via a
    // native that performs the continuation.
    use rill_core::function::{NatOut, NativeFn};
    use std::rc::Rc;

    let cb: NativeFn = Rc::new(|state, call| {
        let child = call.args[0].clone();
        let out = state.fib_cont(&child, &[])?;
        assert!(out.is_empty());
        // The child failed but this fiber keeps running normally.
        Ok(NatOut::Ret(vec![Value::Int(99)]))
    });
    let pump = s.native("pump", &["fib"], cb);
    s.def_global("pump", pump).expect("storable");

    let mut src = StrSource::new("<test>", "[] 1 + 'x'");
    let child = s
        .compile_fiber(&mut src, Scope::Global, false, None)
        .expect("compiles");
    s.def_global("child", child.clone()).expect("storable");

    assert_eq!(eval1(&mut s, "pump child"), Value::Int(99));
    assert_eq!(s.fib_state(&child).unwrap(), FibState::Failed);
}
