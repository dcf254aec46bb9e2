//! Collector behavior: reachability across cycles, cycle
//! reclamation, full-cycle sweeps of symbols and pointers.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{eval, eval1, run_script, state, stress_state};
use rill_core::record::{rec_def, rec_get};
use rill_core::{Config, State, Value};

#[test]
fn everything_reachable_survives_collection() {
    let mut s = state();
    run_script(
        &mut s,
        "def r: {.a: \"alpha\", .b: {.nested: 'deep'}}\n\
         def f: [x] x + 1",
    )
    .expect("compiles");

    for _ in 0..10 {
        s.collect_now();
    }

    assert_eq!(eval1(&mut s, "f 41"), Value::Int(42));
    assert_eq!(eval1(&mut s, "r.b.nested"), eval1(&mut s, "'deep'"));
    assert_eq!(
        eval1(&mut s, "r.a = \"alpha\""),
        Value::Log(true)
    );
}

#[test]
fn garbage_is_reclaimed() {
    let mut s = state();
    run_script(&mut s, "def keep: {.k: 1}").expect("compiles");
    let baseline = {
        for _ in 0..6 {
            s.collect_now();
        }
        s.obj_count()
    };

    // Make a pile of unreachable records and strings.
    for _ in 0..50 {
        eval(&mut s, "do def t: {.x: \"temporary\", .y: {1, 2, 3}} for 0").expect("evaluates");
    }
    for _ in 0..6 {
        s.collect_now();
    }
    // Transient objects are gone again; the last `t` global still
    // holds one small record chain.
    assert!(s.obj_count() <= baseline + 16);
}

#[test]
fn reference_cycles_are_collected() {
    let mut s = state();
    // A record that contains itself through a field.
    let before = s.obj_count();
    for _ in 0..10 {
        let r = s.new_record();
        let key = s.sym("me");
        rec_def(&mut s, &r, &key, r.clone()).expect("def");
        drop(r);
    }
    for _ in 0..6 {
        s.collect_now();
    }
    assert!(s.obj_count() <= before + 2);
}

#[test]
fn guarded_values_survive() {
    let mut s = state();
    let v = s.str_val("precious");
    let mark = s.guard_mark();
    s.guard(v.clone());

    for _ in 0..10 {
        s.collect_now();
    }
    assert_eq!(
        s.str_bytes(&v).expect("still a string"),
        b"precious"
    );
    s.guard_reset(mark);
}

#[test]
fn unreferenced_symbols_sweep_on_full_cycles() {
    let mut s = state();
    // Intern a crowd of symbols reachable from nowhere.
    for i in 0..500 {
        let _ = s.intern(&format!("transient_{i}"));
    }
    let peak = s.syms().len();

    // Five cycles guarantee at least one full cycle.
    for _ in 0..10 {
        s.collect_now();
    }
    assert!(s.syms().len() < peak);

    // Symbols held by live values survive.
    run_script(&mut s, "def tag: 'durable'").expect("compiles");
    for _ in 0..10 {
        s.collect_now();
    }
    assert_eq!(eval1(&mut s, "tag = 'durable'"), Value::Log(true));
}

#[test]
fn pointer_descriptors_run_destructors_when_unreferenced() {
    let mut s = state();
    let dropped: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = dropped.clone();
    let info = s.register_ptr_info("Res", Some(Rc::new(move |addr| sink.borrow_mut().push(addr))));

    let keep = s.new_ptr(0xaa, Some(info.clone()));
    {
        let _lose = s.new_ptr(0xbb, Some(info.clone()));
    }
    s.guard(keep.clone());

    for _ in 0..10 {
        s.collect_now();
    }
    assert_eq!(*dropped.borrow(), vec![0xbb]);

    s.guard_reset(0);
    for _ in 0..10 {
        s.collect_now();
    }
    assert_eq!(*dropped.borrow(), vec![0xbb, 0xaa]);
}

#[test]
fn data_destructors_run_at_teardown() {
    let dropped: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    {
        let mut s = state();
        let sink = dropped.clone();
        let info = s.register_data_info(
            "Blob",
            8,
            1,
            Some(Rc::new(move |_bytes: &mut [u8]| {
                *sink.borrow_mut() += 1;
            })),
        );
        let d = s.new_data(&info);
        s.def_global("blob", d).expect("storable");
        // Instance dropped here with the data object live.
    }
    assert_eq!(*dropped.borrow(), 1);
}

#[test]
fn stress_mode_runs_whole_programs() {
    let mut s = stress_state();
    run_script(
        &mut s,
        "def make: [] {.a: 1, .b: 2}\n\
         def i: make ()\n\
         def j: make ()\n\
         def i @ 'c': 3\n\
         def count: [n] if n = 0: 0 else count (n - 1)",
    )
    .expect("compiles under stress");

    assert_eq!(eval1(&mut s, "i @ 'c'"), Value::Int(3));
    assert_eq!(eval1(&mut s, "j @ 'c'"), Value::Udf);
    assert_eq!(eval1(&mut s, "count 500"), Value::Int(0));
}

#[test]
fn stress_mode_preserves_fiber_stacks() {
    let mut s = stress_state();
    common::install_yield(&mut s);
    run_script(&mut s, "def body: [] do yield 'a', yield 'b' for udf").expect("compiles");

    let cls = eval(&mut s, "body").expect("closure")[0].clone();
    let fib = s.fib_new(&cls, None).expect("fiber");
    assert_eq!(s.fib_cont(&fib, &[]).expect("first"), vec![s.sym("a")]);
    assert_eq!(s.fib_cont(&fib, &[]).expect("second"), vec![s.sym("b")]);
}

#[test]
fn mem_limit_grows_after_collection() {
    let mut s = State::new(Config {
        mem_limit_init: 4096,
        ..Config::default()
    })
    .expect("valid config");

    // Allocating past the limit schedules a collection; the
    // interpreter's safepoints run it and usage settles.
    run_script(&mut s, "def pad: [] {\"xxxxxxxxxxxxxxxx\", \"yyyyyyyyyyyyyyyy\"}").expect("ok");
    for _ in 0..100 {
        eval(&mut s, "do def t: pad () for 0").expect("evaluates");
    }
    assert!(s.mem_used() < 1 << 22);
}

#[test]
fn values_in_records_keep_symbols_alive() {
    let mut s = state();
    let r = s.new_record();
    let key = s.sym("held_key");
    let val = s.sym("held_val");
    rec_def(&mut s, &r, &key, val.clone()).expect("def");
    s.def_global("holder", r.clone()).expect("storable");

    for _ in 0..10 {
        s.collect_now();
    }
    let got = rec_get(&mut s, &r, &key).expect("get");
    assert_eq!(got, val);
}
