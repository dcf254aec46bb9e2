//! The host embedding surface.

mod common;

use std::rc::Rc;

use common::{eval1, state};
use rill_core::function::{NatOut, NativeFn};
use rill_core::{ErrKind, Scope, StrSource, Value};

#[test]
fn primitive_round_trips() {
    let mut s = state();

    assert_eq!(Value::Int(42).as_int(), Some(42));
    assert_eq!(Value::Dec(1.5).as_dec(), Some(1.5));
    assert_eq!(Value::Log(true).as_log(), Some(true));

    let sym = s.sym("alpha");
    assert_eq!(s.sym_text(sym.as_sym().expect("symbol")), "alpha");

    let st = s.str_val("bytes");
    assert_eq!(s.str_bytes(&st), Some(b"bytes".as_ref()));
    assert_eq!(s.str_chars(&st), Some(5));
}

#[test]
fn type_symbols() {
    let mut s = state();
    let cases: Vec<(Value, &str)> = vec![
        (Value::Udf, "udf"),
        (Value::Nil, "nil"),
        (Value::Log(true), "log"),
        (Value::Int(1), "int"),
        (Value::Dec(1.0), "dec"),
    ];
    for (v, want) in cases {
        let sym = s.type_sym(&v);
        assert_eq!(s.sym_text(sym), want);
    }

    let r = s.new_record();
    let sym = s.type_sym(&r);
    assert_eq!(s.sym_text(sym), "rec");

    let st = s.str_val("x");
    let sym = s.type_sym(&st);
    assert_eq!(s.sym_text(sym), "str");
}

#[test]
fn function_and_closure_types_are_distinct() {
    let mut s = state();
    let cb: NativeFn = Rc::new(|_, _| Ok(NatOut::Ret(vec![Value::Nil])));
    let cls = s.native("probe", &[], cb);
    let sym = s.type_sym(&cls);
    assert_eq!(s.sym_text(sym), "cls");
}

#[test]
fn typed_pointers_report_their_descriptor() {
    let mut s = state();
    let info = s.register_ptr_info("Handle", None);
    let p = s.new_ptr(0x1234, Some(info));
    let sym = s.type_sym(&p);
    assert_eq!(s.sym_text(sym), "Handle");

    let untyped = s.new_ptr(0x1234, None);
    let sym = s.type_sym(&untyped);
    assert_eq!(s.sym_text(sym), "ptr");
    assert_ne!(p, untyped);

    // Same (address, descriptor) pair, same identity.
    let again = s.new_ptr(0x1234, None);
    assert_eq!(untyped, again);
}

#[test]
fn tuple_push_top_pop_on_the_default_stack() {
    let mut s = state();
    let tup = s.push_tup(3);
    assert_eq!(tup.size(), 3);
    s.tup_set(&tup, 0, Value::Int(1)).expect("set");
    s.tup_set(&tup, 1, Value::Int(2)).expect("set");
    s.tup_set(&tup, 2, Value::Int(3)).expect("set");

    let top = s.top_tup();
    assert_eq!(top.size(), 3);
    assert_eq!(s.tup_at(&top, 1), Value::Int(2));

    s.pop_tup();
    let single = s.push_tup(1);
    s.tup_set(&single, 0, Value::Nil).expect("set");
    let top = s.top_tup();
    assert_eq!(top.size(), 1);
    assert_eq!(s.tup_at(&top, 0), Value::Nil);
    s.pop_tup();
}

#[test]
fn globals_define_set_get() {
    let mut s = state();
    s.def_global("answer", Value::Int(41)).expect("def");
    s.set_global("answer", Value::Int(42)).expect("set");
    assert_eq!(s.get_global("answer"), Value::Int(42));
    assert_eq!(s.get_global("missing"), Value::Udf);

    let err = s.set_global("missing", Value::Int(1)).unwrap_err();
    assert_eq!(err.kind, ErrKind::Assign);

    // Scripts see host globals and vice versa.
    assert_eq!(eval1(&mut s, "answer"), Value::Int(42));
    common::run_script(&mut s, "set answer: answer + 1").expect("runs");
    assert_eq!(s.get_global("answer"), Value::Int(43));
}

#[test]
fn equality_and_copies() {
    let mut s = state();
    let a = s.str_val("same");
    let b = s.str_val("same");
    assert!(s.equal(&a, &b));

    let c = s.copy(&a);
    assert!(s.equal(&a, &c));

    let r1 = s.new_record();
    let r2 = s.new_record();
    assert!(!s.equal(&r1, &r2));
    assert!(s.equal(&r1, &s.copy(&r1)));
}

#[test]
fn native_callables_run_from_scripts() {
    let mut s = state();
    let cb: NativeFn = Rc::new(|_state, call| {
        let a = call.args[0].as_int().unwrap_or(0);
        let b = call.args[1].as_int().unwrap_or(0);
        Ok(NatOut::Ret(vec![Value::Int(a + b)]))
    });
    let add = s.native("add2", &["a", "b"], cb);
    s.def_global("add2", add).expect("storable");

    assert_eq!(eval1(&mut s, "add2 (40, 2)"), Value::Int(42));
}

#[test]
fn native_arity_is_enforced() {
    let mut s = state();
    let cb: NativeFn = Rc::new(|_, _| Ok(NatOut::Ret(vec![Value::Nil])));
    let one = s.native("one", &["a"], cb);
    s.def_global("one", one).expect("storable");

    let err = common::eval(&mut s, "one ()").unwrap_err();
    assert_eq!(err.kind, ErrKind::Call);
    let err = common::eval(&mut s, "one (1, 2)").unwrap_err();
    assert_eq!(err.kind, ErrKind::Call);
}

#[test]
fn native_errors_become_script_errors() {
    let mut s = state();
    let cb: NativeFn = Rc::new(|state, _| {
        Err(state.err_fmt(ErrKind::User, "refused", &[]))
    });
    let nope = s.native("nope", &[], cb);
    s.def_global("nope", nope).expect("storable");

    let err = common::eval(&mut s, "nope ()").unwrap_err();
    assert_eq!(err.kind, ErrKind::User);
    assert!(err.text.contains("refused"));
}

#[test]
fn data_objects_carry_members_and_bytes() {
    let mut s = state();
    let info = s.register_data_info("Pair", 4, 2, None);
    let d = s.new_data(&info);

    s.data_set_member(&d, 0, Value::Int(10)).expect("set");
    s.data_set_member(&d, 1, Value::Int(20)).expect("set");
    assert_eq!(s.data_member(&d, 0).expect("get"), Value::Int(10));
    assert_eq!(s.data_member(&d, 1).expect("get"), Value::Int(20));
    let err = s.data_member(&d, 2).unwrap_err();
    assert_eq!(err.kind, ErrKind::Type);

    s.data_bytes(&d, |bytes| {
        bytes[0] = 0xab;
    })
    .expect("bytes");
    let first = s.data_bytes(&d, |bytes| bytes[0]).expect("bytes");
    assert_eq!(first, 0xab);

    let sym = s.type_sym(&d);
    assert_eq!(s.sym_text(sym), "Pair");
}

#[test]
fn data_attached_to_natives_is_visible() {
    let mut s = state();
    let info = s.register_data_info("Counter", 0, 1, None);
    let d = s.new_data(&info);
    s.data_set_member(&d, 0, Value::Int(0)).expect("set");

    let cb: NativeFn = Rc::new(|state, call| {
        let dat = Value::Obj(call.dat.clone().expect("attached data"));
        let n = state.data_member(&dat, 0)?.as_int().unwrap_or(0);
        state.data_set_member(&dat, 0, Value::Int(n + 1))?;
        Ok(NatOut::Ret(vec![Value::Int(n + 1)]))
    });
    let tick = s.native_with_data("tick", &[], cb, Some(d.clone()));
    s.def_global("tick", tick).expect("storable");

    assert_eq!(eval1(&mut s, "tick ()"), Value::Int(1));
    assert_eq!(eval1(&mut s, "tick ()"), Value::Int(2));
    assert_eq!(s.data_member(&d, 0).expect("get"), Value::Int(2));
}

#[test]
fn compile_local_scope_is_isolated() {
    let mut s = state();
    s.def_global("shared", Value::Int(5)).expect("def");

    // Local units resolve free names to private cells, not globals.
    let mut src = StrSource::new("<local>", "do def shared: 1 for shared");
    let vals = s.run(&mut src, Scope::Local, false).expect("runs");
    assert_eq!(vals, vec![Value::Int(1)]);
    assert_eq!(s.get_global("shared"), Value::Int(5));
}

#[test]
fn compile_global_scope_reaches_globals() {
    let mut s = state();
    s.def_global("shared", Value::Int(5)).expect("def");
    let mut src = StrSource::new("<global>", "shared + 1");
    let vals = s.run(&mut src, Scope::Global, false).expect("runs");
    assert_eq!(vals, vec![Value::Int(6)]);
}

#[test]
fn unit_parameters() {
    let mut s = state();
    let mut src = StrSource::new("<unit>", "a + b");
    let cls = s
        .compile_unit(&mut src, Scope::Local, &["a", "b"], false)
        .expect("compiles");
    let out = s.call(&cls, &[Value::Int(30), Value::Int(12)]).expect("runs");
    assert_eq!(out, vec![Value::Int(42)]);
}

#[test]
fn variadic_unit_parameters() {
    let mut s = state();
    let mut src = StrSource::new("<unit>", "rest @ 1");
    let cls = s
        .compile_unit(&mut src, Scope::Local, &["first", "rest..."], false)
        .expect("compiles");
    let out = s
        .call(&cls, &[Value::Int(1), Value::Int(2), Value::Int(3)])
        .expect("runs");
    assert_eq!(out, vec![Value::Int(3)]);
}

#[test]
fn module_loader_registration() {
    let mut s = state();
    s.register_loader(
        "str",
        Rc::new(|state, path| {
            let text = format!("loaded:{path}");
            Ok(state.str_val(&text))
        }),
    );
    s.set_path_translator(Rc::new(|p| format!("lib/{p}")));

    let sym = s.intern("str");
    let loader = s.loader(sym).expect("registered");
    let path = s.translate_path("util");
    assert_eq!(path, "lib/util");
    let v = loader(&mut s, &path).expect("loads");
    assert_eq!(s.str_bytes(&v), Some(b"loaded:lib/util".as_ref()));
}

#[test]
fn render_quotes_values() {
    let mut s = state();
    let sym = s.sym("name");
    assert_eq!(s.render(&sym, false), "name");
    assert_eq!(s.render(&sym, true), "'name'");

    let st = s.str_val("hi");
    assert_eq!(s.render(&st, false), "hi");
    assert_eq!(s.render(&st, true), "\"hi\"");

    assert_eq!(s.render(&Value::Dec(2.0), true), "2.0");
    assert_eq!(s.render(&Value::Udf, true), "udf");
}
