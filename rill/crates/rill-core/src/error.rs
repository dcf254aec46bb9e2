//! The error engine.
//!
//! Every fault in the runtime is an [`Error`]: a kind drawn from the
//! fixed surface taxonomy, a value (usually a heap string rendered
//! through the formatter), an optional static string for paths where
//! a value cannot be constructed, and a growing stack trace.
//!
//! Propagation is by `Result` and `?` from the faulting site to the
//! nearest catch boundary.  The two boundaries are fiber
//! continuation (non-fatal errors are absorbed into the failing
//! fiber and the parent resumes normally) and the host API surface.
//! [`ErrKind::Fatal`] passes through every fiber boundary and
//! reaches the host; each boundary it crosses appends its fiber's
//! frames to the trace.
//!
//! When an error is created the owning instance also stores the
//! kind/value in its per-instance error slots so the collector can
//! see the error value while the `Result` is in flight; absorbing
//! the error into a fiber clears the slots.

use thiserror::Error as ThisError;

use crate::value::Value;

/// The surface error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrKind {
    /// No error.  Present so cleared error slots have a kind.
    None,
    /// Unrecoverable; propagates past all fiber boundaries.
    Fatal,
    /// Host system failure (I/O and the like).
    System,
    /// Record misuse (bad key, set of an undefined field).
    Record,
    /// String misuse.
    String,
    /// Fiber misuse (continuing a running fiber, yield outside one).
    Fiber,
    /// Call protocol violation (arity, `udf` argument, non-callable).
    Call,
    /// Lexical or syntactic fault in source text.
    Syntax,
    /// A compile-time limit was exceeded (slot counts, operands).
    Limit,
    /// Other compilation fault.
    Compile,
    /// Host-raised error.
    User,
    /// Type fault outside arithmetic (bad truth test, `udf` compare).
    Type,
    /// Arithmetic fault (non-numeric operands, division by zero).
    Arith,
    /// Assignment fault (missing global, immutable destination).
    Assign,
    /// Tuple fault (pattern size mismatch, header misuse).
    Tuple,
    /// Script-raised panic.
    Panic,
    /// Failed assertion.
    Assert,
}

impl ErrKind {
    /// The kind's surface name.
    pub fn name(self) -> &'static str {
        match self {
            ErrKind::None => "none",
            ErrKind::Fatal => "fatal",
            ErrKind::System => "system",
            ErrKind::Record => "record",
            ErrKind::String => "string",
            ErrKind::Fiber => "fiber",
            ErrKind::Call => "call",
            ErrKind::Syntax => "syntax",
            ErrKind::Limit => "limit",
            ErrKind::Compile => "compile",
            ErrKind::User => "user",
            ErrKind::Type => "type",
            ErrKind::Arith => "arith",
            ErrKind::Assign => "assign",
            ErrKind::Tuple => "tuple",
            ErrKind::Panic => "panic",
            ErrKind::Assert => "assert",
        }
    }
}

impl std::fmt::Display for ErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One stack-trace frame: `(unit, file, line)`.
///
/// `unit` names the fiber tag or function; frames from native
/// activation records carry the native callable's name.  Trace text
/// is plain Rust strings so traces stay valid however long the error
/// outlives the instance's heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceFrame {
    pub unit: Option<String>,
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "{unit} ({}:{})", self.file, self.line),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

/// A runtime error.
#[derive(Clone, Debug, ThisError)]
#[error("{kind} error: {text}")]
pub struct Error {
    /// Surface kind.
    pub kind: ErrKind,
    /// The error value, usually a heap string.
    pub val: Value,
    /// Rendered message text.
    pub text: String,
    /// Static message for paths where no value can be built.
    pub msg: Option<&'static str>,
    /// Accumulated trace, innermost frame first.
    pub trace: Vec<TraceFrame>,
}

impl Error {
    /// An error with no heap value attached.
    pub fn simple(kind: ErrKind, text: String) -> Self {
        Self {
            kind,
            val: Value::Nil,
            text,
            msg: None,
            trace: Vec::new(),
        }
    }

    /// An error carrying only a static string; used where even the
    /// formatter must not run.
    pub fn fixed(kind: ErrKind, msg: &'static str) -> Self {
        Self {
            kind,
            val: Value::Nil,
            text: msg.to_string(),
            msg: Some(msg),
            trace: Vec::new(),
        }
    }

    /// True for errors that must cross fiber boundaries.
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrKind::Fatal
    }
}

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_have_names() {
        assert_eq!(ErrKind::Arith.name(), "arith");
        assert_eq!(ErrKind::Fatal.to_string(), "fatal");
    }

    #[test]
    fn display_carries_kind_and_text() {
        let e = Error::simple(ErrKind::Call, "too few arguments".into());
        let shown = e.to_string();
        assert!(shown.contains("call"));
        assert!(shown.contains("too few arguments"));
    }

    #[test]
    fn fixed_errors_keep_static_message() {
        let e = Error::fixed(ErrKind::Fatal, "out of memory");
        assert_eq!(e.msg, Some("out of memory"));
        assert!(e.is_fatal());
    }

    #[test]
    fn trace_frame_display() {
        let f = TraceFrame {
            unit: Some("worker".into()),
            file: "job.rl".into(),
            line: 12,
        };
        assert_eq!(f.to_string(), "worker (job.rl:12)");

        let g = TraceFrame {
            unit: None,
            file: "job.rl".into(),
            line: 3,
        };
        assert_eq!(g.to_string(), "job.rl:3");
    }
}
