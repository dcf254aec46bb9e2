//! Fibers: first-class cooperative coroutines.
//!
//! Fibers form a tree rooted at the host entry; at any moment at
//! most one fiber per instance is Running, its ancestors Waiting.
//! Each fiber owns its value stack, its stack of virtual activation
//! records, and an intrusive list of native activation records used
//! purely for stack-trace construction.
//!
//! Control transfer is a strict rendezvous.  A parent *continues* a
//! Stopped fiber, handing it argument values and becoming Waiting; a
//! fiber *yields* values back, becoming Stopped.  On resumption the
//! previously yielded values are replaced on the stack by the new
//! continuation arguments, exactly where the suspended call expected
//! its results.  The entry closure is retained until the first
//! continuation performs the initial call.
//!
//! A non-Fatal error inside a fiber is localized: the fiber becomes
//! Failed, absorbing the error's kind, value, and trace; its stacks
//! are released; the parent's continuation returns an empty tuple.
//! Fatal errors pass through every boundary, each fiber appending
//! its frames to the trace on the way out.

use std::rc::Rc;

use rill_util::Symbol;

use crate::error::{ErrKind, Result, TraceFrame};
use crate::interp::{self, RunEnd};
use crate::object::Obj;
use crate::state::State;
use crate::value::Value;

/// Fiber lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FibState {
    /// Currently executing.
    Running,
    /// Continued a child and awaits its yield.
    Waiting,
    /// Suspended; may be continued.
    Stopped,
    /// The entry closure returned; terminal.
    Finished,
    /// An error was absorbed; terminal.
    Failed,
}

impl FibState {
    pub fn name(self) -> &'static str {
        match self {
            FibState::Running => "running",
            FibState::Waiting => "waiting",
            FibState::Stopped => "stopped",
            FibState::Finished => "finished",
            FibState::Failed => "failed",
        }
    }
}

/// The error captured by a Failed fiber.
#[derive(Clone, Debug)]
pub struct FibError {
    pub kind: ErrKind,
    pub val: Value,
    pub text: String,
    pub trace: Vec<TraceFrame>,
}

/// The execution registers of a fiber's current frame.
pub(crate) struct Regs {
    /// Next instruction, an index into the frame function's code.
    pub ip: u32,
    /// The frame's closure; `None` before the first call.
    pub cls: Option<Rc<Obj>>,
    /// Stack index of the frame base (the closure slot).
    pub lcl: u32,
}

/// A saved caller frame.
pub(crate) struct VirAr {
    pub cls: Rc<Obj>,
    pub ip: u32,
    pub lcl: u32,
}

/// A native activation record; trace construction only.
pub(crate) struct NatAr {
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// A coroutine.  Lives behind `RefCell` in [`crate::ObjKind::Fib`].
pub struct Fiber {
    pub state: FibState,
    pub tag: Option<Symbol>,
    pub(crate) stack: Vec<Value>,
    pub(crate) ars: Vec<VirAr>,
    pub(crate) nats: Vec<NatAr>,
    pub(crate) regs: Regs,
    /// Entry closure, consumed by the first continuation.
    pub(crate) entry: Option<Rc<Obj>>,
    /// Frame base of the call that yielded; resumption rebuilds the
    /// call's result there.
    pub(crate) yield_base: u32,
    pub err: Option<FibError>,
}

impl Fiber {
    pub(crate) fn new(entry: Rc<Obj>, tag: Option<Symbol>) -> Self {
        Self {
            state: FibState::Stopped,
            tag,
            stack: Vec::with_capacity(16),
            ars: Vec::with_capacity(8),
            nats: Vec::new(),
            regs: Regs {
                ip: 0,
                cls: None,
                lcl: 0,
            },
            entry: Some(entry),
            yield_base: 0,
            err: None,
        }
    }

    /// The top tuple: the group of values ending at the stack top.
    pub(crate) fn top_group(&self) -> Vec<Value> {
        match self.stack.last() {
            Some(Value::Tup(n)) => {
                let n = *n as usize;
                let end = self.stack.len() - 1;
                self.stack[end - n..end].to_vec()
            }
            Some(v) => vec![v.clone()],
            None => Vec::new(),
        }
    }

    /// Release the stacks; a failed fiber can never run again, and a
    /// dead one is being swept.
    pub(crate) fn clear(&mut self) {
        self.stack = Vec::new();
        self.ars = Vec::new();
        self.nats = Vec::new();
        self.regs = Regs {
            ip: 0,
            cls: None,
            lcl: 0,
        };
        self.entry = None;
        self.yield_base = 0;
    }
}

/// Create a fiber over an entry closure.
pub fn fib_new(state: &mut State, cls: &Rc<Obj>, tag: Option<Symbol>) -> Rc<Obj> {
    debug_assert!(cls.as_cls().is_some());
    state.new_fib_obj(Fiber::new(cls.clone(), tag))
}

/// Continue a Stopped fiber with arguments; returns the values it
/// yields (or returns).  See the module docs for the error contract.
pub fn fib_cont(state: &mut State, fib_obj: &Rc<Obj>, args: &[Value]) -> Result<Vec<Value>> {
    let cell = fib_obj.as_fib().expect("fiber object");

    let cur = cell.borrow().state;
    if cur != FibState::Stopped {
        return Err(state.err_fmt(
            ErrKind::Fiber,
            "continued a fiber in its %s state",
            &[crate::fmt::FmtArg::S(cur.name())],
        ));
    }
    for (i, a) in args.iter().enumerate() {
        if a.is_udf() {
            return Err(state.err_fmt(
                ErrKind::Call,
                "passed udf for continuation argument %u",
                &[crate::fmt::FmtArg::U(i as u64)],
            ));
        }
        if !a.is_storable() {
            return Err(state.err_fmt(
                ErrKind::Tuple,
                "a tuple header is not a continuation argument",
                &[],
            ));
        }
    }

    // Suspend the parent and install the child as the running fiber.
    let parent = state.fibers.last().cloned();
    if let Some(p) = &parent {
        p.as_fib().expect("fiber object").borrow_mut().state = FibState::Waiting;
    }
    state.fibers.push(fib_obj.clone());
    let defer_mark = state.defer_mark();

    let first = {
        let mut fib = cell.borrow_mut();
        fib.state = FibState::Running;
        match fib.entry.take() {
            Some(entry) => {
                // First continuation: stage the entry call.
                fib.stack.clear();
                fib.stack.push(Value::Obj(entry));
                for a in args {
                    fib.stack.push(a.clone());
                }
                if args.len() != 1 {
                    fib.stack.push(Value::Tup(args.len() as u16));
                }
                true
            }
            None => {
                // Resumption: the yielded values sit at the
                // suspended call's frame base; replace them with the
                // continuation arguments as the call's result.
                let base = fib.yield_base as usize;
                fib.stack.truncate(base);
                for a in args {
                    fib.stack.push(a.clone());
                }
                if args.len() != 1 {
                    fib.stack.push(Value::Tup(args.len() as u16));
                }
                false
            }
        }
    };

    let outcome = interp::run(state, fib_obj, first);

    // Restore the parent whichever way it went.
    state.fibers.pop();
    if let Some(p) = &parent {
        p.as_fib().expect("fiber object").borrow_mut().state = FibState::Running;
    }

    match outcome {
        Ok(RunEnd::Finished) => {
            let mut fib = cell.borrow_mut();
            fib.state = FibState::Finished;
            Ok(fib.top_group())
        }
        Ok(RunEnd::Yielded) => {
            let mut fib = cell.borrow_mut();
            fib.state = FibState::Stopped;
            Ok(fib.top_group())
        }
        Err(mut e) => {
            e.trace.extend(capture_trace(state, fib_obj));
            state.unwind_defers(defer_mark);
            state.drop_pending();
            state.clear_err();

            let mut fib = cell.borrow_mut();
            fib.state = FibState::Failed;
            fib.err = Some(FibError {
                kind: e.kind,
                val: e.val.clone(),
                text: e.text.clone(),
                trace: e.trace.clone(),
            });
            fib.clear();
            drop(fib);

            if e.is_fatal() {
                // Fatal errors pass the boundary; ancestors append
                // their own frames as it unwinds.
                Err(e)
            } else {
                Ok(Vec::new())
            }
        }
    }
}

/// Walk a fiber's activation records into trace frames, innermost
/// first.
pub(crate) fn capture_trace(state: &State, fib_obj: &Rc<Obj>) -> Vec<TraceFrame> {
    let fib = fib_obj.as_fib().expect("fiber object").borrow();
    let unit = fib.tag.map(|t| state.syms().text(t).into_owned());
    let mut frames = Vec::new();

    let frame_of = |cls: &Rc<Obj>, ip: u32| -> TraceFrame {
        let fun_rc = &cls.as_cls().expect("closure object").fun;
        let fun = fun_rc.as_fun().expect("function object");
        let file = fun
            .file_text(state)
            .unwrap_or_else(|| "<native>".to_string());
        let line = fun.line_at(ip.saturating_sub(1)).unwrap_or(0);
        TraceFrame {
            unit: unit
                .clone()
                .or_else(|| Some(fun.name_text(state)))
                .filter(|u| !u.is_empty()),
            file,
            line,
        }
    };

    if let Some(cls) = &fib.regs.cls {
        frames.push(frame_of(cls, fib.regs.ip));
    }
    for ar in fib.ars.iter().rev() {
        frames.push(frame_of(&ar.cls, ar.ip));
    }
    for nat in fib.nats.iter().rev() {
        frames.push(TraceFrame {
            unit: Some(nat.name.clone()),
            file: nat.file.clone(),
            line: nat.line,
        });
    }
    frames
}
