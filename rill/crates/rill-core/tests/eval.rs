//! End-to-end evaluation: expressions through the compiler and
//! interpreter.

mod common;

use common::{eval, eval1, run_script, state};
use rill_core::{ErrKind, Value};

#[test]
fn arithmetic_precedence() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "3 + 4 * 2"), Value::Int(11));
    assert_eq!(eval1(&mut s, "(3 + 4) * 2"), Value::Int(14));
    assert_eq!(eval1(&mut s, "10 - 2 - 3"), Value::Int(5));
    assert_eq!(eval1(&mut s, "7 % 3"), Value::Int(1));
}

#[test]
fn expression_yields_a_single_value_tuple() {
    let mut s = state();
    let vals = eval(&mut s, "3 + 4 * 2").expect("evaluates");
    assert_eq!(vals, vec![Value::Int(11)]);
}

#[test]
fn decimal_promotion() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "1 + 0.5"), Value::Dec(1.5));
    assert_eq!(eval1(&mut s, "3.0 * 2"), Value::Dec(6.0));
    assert_eq!(eval1(&mut s, "1 / 2"), Value::Int(0));
    assert_eq!(eval1(&mut s, "1.0 / 2"), Value::Dec(0.5));
}

#[test]
fn exponent_is_right_associative() {
    let mut s = state();
    // 2 ^ (3 ^ 2) = 512, not (2 ^ 3) ^ 2 = 64.
    assert_eq!(eval1(&mut s, "2 ^ 3 ^ 2"), Value::Int(512));
}

#[test]
fn unary_operators() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "-3"), Value::Int(-3));
    assert_eq!(eval1(&mut s, "- -3"), Value::Int(3));
    assert_eq!(eval1(&mut s, "~true"), Value::Log(false));
    assert_eq!(eval1(&mut s, "!2.9"), Value::Int(2));
}

#[test]
fn shifts_and_bits() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "1 << 4"), Value::Int(16));
    assert_eq!(eval1(&mut s, "16 >> 2"), Value::Int(4));
    assert_eq!(eval1(&mut s, "6 & 3"), Value::Int(2));
    assert_eq!(eval1(&mut s, "6 \\ 3"), Value::Int(5));
    assert_eq!(eval1(&mut s, "6 | 3"), Value::Int(7));
    assert_eq!(eval1(&mut s, "true & false"), Value::Log(false));
    assert_eq!(eval1(&mut s, "true \\ true"), Value::Log(false));
}

#[test]
fn comparisons() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "1 < 2"), Value::Log(true));
    assert_eq!(eval1(&mut s, "2 <= 2"), Value::Log(true));
    assert_eq!(eval1(&mut s, "3 > 4"), Value::Log(false));
    assert_eq!(eval1(&mut s, "1 < 1.5"), Value::Log(true));
}

#[test]
fn symbol_equality_is_structural() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "('abc' = 'abc') = true"), Value::Log(true));
    assert_eq!(eval1(&mut s, "('abc' = 'abd') = false"), Value::Log(true));
    assert_eq!(eval1(&mut s, "'abc' < 'abd'"), Value::Log(true));
}

#[test]
fn string_equality_is_by_content() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "\"hi\" = \"hi\""), Value::Log(true));
    assert_eq!(eval1(&mut s, "\"hi\" ~= \"ho\""), Value::Log(true));
}

#[test]
fn mixed_types_never_equal() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "1 = 1.0"), Value::Log(false));
    assert_eq!(eval1(&mut s, "nil = false"), Value::Log(false));
}

#[test]
fn udf_tolerant_equality() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "udf != udf"), Value::Log(true));
    assert_eq!(eval1(&mut s, "1 != udf"), Value::Log(false));
    // Plain equality rejects udf operands.
    let err = eval(&mut s, "udf = udf").unwrap_err();
    assert_eq!(err.kind, ErrKind::Type);
}

#[test]
fn arith_on_non_numbers_faults() {
    let mut s = state();
    let err = eval(&mut s, "1 + 'x'").unwrap_err();
    assert_eq!(err.kind, ErrKind::Arith);
    let err = eval(&mut s, "1 / 0").unwrap_err();
    assert_eq!(err.kind, ErrKind::Arith);
    let err = eval(&mut s, "nil < 1").unwrap_err();
    assert_eq!(err.kind, ErrKind::Arith);
}

#[test]
fn short_circuit_operators() {
    let mut s = state();
    // The right side would fault if evaluated.
    assert_eq!(eval1(&mut s, "false &? boom ()"), Value::Log(false));
    assert_eq!(eval1(&mut s, "true |? boom ()"), Value::Log(true));
    assert_eq!(eval1(&mut s, "3 !? boom ()"), Value::Int(3));
    assert_eq!(eval1(&mut s, "udf !? 5"), Value::Int(5));
    assert_eq!(eval1(&mut s, "false |? 7"), Value::Int(7));
}

#[test]
fn truth_of_udf_faults() {
    let mut s = state();
    let err = eval(&mut s, "if udf: 1 else 2").unwrap_err();
    assert_eq!(err.kind, ErrKind::Type);
}

#[test]
fn if_expression() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "if 1 < 2: 'a' else 'b'"), eval1(&mut s, "'a'"));
    assert_eq!(eval1(&mut s, "if 1 > 2: 'a' else 'b'"), eval1(&mut s, "'b'"));
    // Multiple clauses.
    assert_eq!(
        eval1(&mut s, "if false: 1, true: 2 else 3"),
        Value::Int(2)
    );
    // Nil is falsy.
    assert_eq!(eval1(&mut s, "if nil: 1 else 2"), Value::Int(2));
}

#[test]
fn do_expression_sequences_and_scopes() {
    let mut s = state();
    assert_eq!(
        eval1(&mut s, "do def x: 5, set x: x + 1 for x"),
        Value::Int(6)
    );
}

#[test]
fn definitions_and_calls() {
    let mut s = state();
    run_script(&mut s, "def double: [n] n * 2").expect("compiles");
    assert_eq!(eval1(&mut s, "double 21"), Value::Int(42));
    assert_eq!(eval1(&mut s, "double (double 10)"), Value::Int(40));
}

#[test]
fn juxtaposition_applies_left_to_right() {
    let mut s = state();
    run_script(&mut s, "def add: [a] [b] a + b").expect("compiles");
    // `add 1 2` is `(add 1) 2`.
    assert_eq!(eval1(&mut s, "add 1 2"), Value::Int(3));
}

#[test]
fn call_arity_faults() {
    let mut s = state();
    run_script(&mut s, "def two: [a, b] a + b").expect("compiles");
    let err = eval(&mut s, "two 1").unwrap_err();
    assert_eq!(err.kind, ErrKind::Call);
    let err = eval(&mut s, "two (1, 2, 3)").unwrap_err();
    assert_eq!(err.kind, ErrKind::Call);
}

#[test]
fn udf_arguments_are_rejected() {
    let mut s = state();
    run_script(&mut s, "def id: [x] x").expect("compiles");
    let err = eval(&mut s, "id udf").unwrap_err();
    assert_eq!(err.kind, ErrKind::Call);
}

#[test]
fn calling_a_non_closure_faults() {
    let mut s = state();
    let err = eval(&mut s, "3 4").unwrap_err();
    assert_eq!(err.kind, ErrKind::Call);
}

#[test]
fn tuples_spread_into_arguments() {
    let mut s = state();
    run_script(&mut s, "def three: [a, b, c] a * 100 + b * 10 + c").expect("compiles");
    assert_eq!(eval1(&mut s, "three (1, 2, 3)"), Value::Int(123));
}

#[test]
fn multi_value_results() {
    let mut s = state();
    run_script(&mut s, "def pair: [] (1, 2)").expect("compiles");
    let vals = eval(&mut s, "pair ()").expect("evaluates");
    assert_eq!(vals, vec![Value::Int(1), Value::Int(2)]);
}

#[test]
fn empty_tuple_result() {
    let mut s = state();
    run_script(&mut s, "def none: [] ()").expect("compiles");
    let vals = eval(&mut s, "none ()").expect("evaluates");
    assert!(vals.is_empty());
}

#[test]
fn destructuring_tuple_pattern() {
    let mut s = state();
    assert_eq!(
        eval1(&mut s, "do def (a, b): (1, 2) for a * 10 + b"),
        Value::Int(12)
    );
}

#[test]
fn destructuring_with_rest() {
    let mut s = state();
    run_script(&mut s, "def (x, rest...): (1, 2, 3)").expect("compiles");
    assert_eq!(eval1(&mut s, "x"), Value::Int(1));
    assert_eq!(eval1(&mut s, "rest @ 0"), Value::Int(2));
    assert_eq!(eval1(&mut s, "rest @ 1"), Value::Int(3));
}

#[test]
fn record_destructuring() {
    let mut s = state();
    run_script(&mut s, "def {a: .x, b: .y}: {.x: 7, .y: 8}").expect("compiles");
    assert_eq!(eval1(&mut s, "a"), Value::Int(7));
    assert_eq!(eval1(&mut s, "b"), Value::Int(8));
}

#[test]
fn closures_capture_locals() {
    let mut s = state();
    assert_eq!(
        eval1(
            &mut s,
            "do def outer: [n] [] n + 1 for do def g: outer 41 for g ()"
        ),
        Value::Int(42)
    );
}

#[test]
fn captured_cells_are_shared() {
    let mut s = state();
    run_script(
        &mut s,
        "def mk: [n] { .get: [] n, .bump: [] set n: n + 1 }\n\
         def c: mk 5",
    )
    .expect("compiles");
    eval(&mut s, "c.bump ()").expect("bump");
    eval(&mut s, "c.bump ()").expect("bump");
    assert_eq!(eval1(&mut s, "c.get ()"), Value::Int(7));
}

#[test]
fn variadic_packing() {
    let mut s = state();
    run_script(&mut s, "def varg: [a, b...] b").expect("compiles");
    let rec = eval1(&mut s, "varg (1, 2, 3, 4)");
    let pairs = rill_core::record::rec_pairs(&mut s, &rec).expect("record");
    assert_eq!(
        pairs,
        vec![
            (Value::Int(0), Value::Int(2)),
            (Value::Int(1), Value::Int(3)),
            (Value::Int(2), Value::Int(4)),
        ]
    );
    assert_eq!(eval1(&mut s, "do def r: varg (1, 2, 3) for r @ 1"), Value::Int(3));
}

#[test]
fn variadic_observes_first_params() {
    let mut s = state();
    run_script(&mut s, "def first: [a, b...] a").expect("compiles");
    assert_eq!(eval1(&mut s, "first (9, 8, 7)"), Value::Int(9));
}

#[test]
fn signals_transfer_to_handlers() {
    let mut s = state();
    assert_eq!(
        eval1(&mut s, "when h(x): x + 1 in do sig h: 41 for 0"),
        Value::Int(42)
    );
    // The in-clause runs when no signal fires.
    assert_eq!(eval1(&mut s, "when h(x): x + 1 in 7"), Value::Int(7));
}

#[test]
fn signal_out_of_scope_is_a_compile_error() {
    let mut s = state();
    let err = eval(&mut s, "sig nope: 1").unwrap_err();
    assert_eq!(err.kind, ErrKind::Compile);
}

#[test]
fn tail_recursion_runs_deep() {
    let mut s = state();
    run_script(
        &mut s,
        "def count: [n] if n = 0: 'done' else count (n - 1)",
    )
    .expect("compiles");
    let done = eval1(&mut s, "'done'");
    assert_eq!(eval1(&mut s, "count 200000"), done);
}

#[test]
fn deep_non_tail_recursion_stays_on_the_heap() {
    let mut s = state();
    run_script(&mut s, "def sum: [n] if n = 0: 0 else n + sum (n - 1)").expect("compiles");
    assert_eq!(eval1(&mut s, "sum 10000"), Value::Int(50005000));
}

#[test]
fn comments_are_skipped() {
    let mut s = state();
    assert_eq!(eval1(&mut s, "1 `plus` + `one` 1"), Value::Int(2));
    assert_eq!(eval1(&mut s, "`| spanning\ncomment |` 5"), Value::Int(5));
}

#[test]
fn syntax_errors_surface() {
    let mut s = state();
    let err = eval(&mut s, "def : 1").unwrap_err();
    assert_eq!(err.kind, ErrKind::Syntax);
    let err = eval(&mut s, "(1, 2").unwrap_err();
    assert_eq!(err.kind, ErrKind::Syntax);
}

#[test]
fn script_units_return_the_empty_tuple() {
    let mut s = state();
    let vals = run_script(&mut s, "def a: 1\ndef b: 2\na + b").expect("script runs");
    assert!(vals.is_empty());
    assert_eq!(eval1(&mut s, "a + b"), Value::Int(3));
}
