//! Shared helpers for the integration tests.

use std::rc::Rc;

use rill_core::function::{NatOut, NativeFn};
use rill_core::{Config, Result, Scope, State, StrSource, Value};

/// A default instance.
pub fn state() -> State {
    State::new(Config::default()).expect("default config is valid")
}

/// An instance that collects at every safepoint.
pub fn stress_state() -> State {
    State::new(Config {
        gc_stress: true,
        ..Config::default()
    })
    .expect("stress config is valid")
}

/// Run a script (global scope) so its definitions persist.
pub fn run_script(state: &mut State, text: &str) -> Result<Vec<Value>> {
    let mut src = StrSource::new("<test>", text);
    state.run(&mut src, Scope::Global, true)
}

/// Evaluate one expression (global scope) and return its values.
pub fn eval(state: &mut State, text: &str) -> Result<Vec<Value>> {
    let mut src = StrSource::new("<test>", text);
    state.run(&mut src, Scope::Global, false)
}

/// Evaluate an expression expected to produce exactly one value.
pub fn eval1(state: &mut State, text: &str) -> Value {
    let vals = eval(state, text).expect("expression evaluates");
    assert_eq!(vals.len(), 1, "one value from {text:?}");
    vals.into_iter().next().expect("one value")
}

/// Install a `yield` callable that suspends the running fiber with
/// its arguments.  The callable is variadic, so its surplus
/// arguments arrive packed in a record; the callback unpacks them
/// back into a value group.
pub fn install_yield(state: &mut State) {
    let cb: NativeFn = Rc::new(|state: &mut State, call| {
        let mut vals = Vec::new();
        if let Some(rec) = call.args.first() {
            let mut i = 0i64;
            loop {
                let v = rill_core::record::rec_get(state, rec, &Value::Int(i))?;
                if v.is_udf() {
                    break;
                }
                vals.push(v);
                i += 1;
            }
        }
        Ok(NatOut::Yield(vals))
    });
    let v = state.native_variadic("yield", &[], cb);
    state.def_global("yield", v).expect("closure is storable");
}
