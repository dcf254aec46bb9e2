//! The formatter.
//!
//! A shared string buffer plus a small `printf`-style pattern
//! language used for error messages and value display.  Beyond the
//! basics (`%s` `%i` `%u` `%f` `%c` `%%`) it knows the runtime's
//! values:
//!
//! - `%v` — bare stringification of a value
//! - `%q` — quoted-literal stringification (symbols and strings
//!   regain their quotes)
//! - `%t` — the type name of a value
//! - `%T` — a raw type-tag name passed as a string
//!
//! Record stringification snapshots through the record's cells with
//! `try_borrow`, so self-referencing records print `...` instead of
//! recursing forever; depth is capped for the same reason.

use rill_util::SymbolTable;

use crate::object::ObjKind;
use crate::ptr::PtrTable;
use crate::value::Value;

const MAX_DEPTH: usize = 16;

/// An argument to a format pattern.
pub enum FmtArg<'a> {
    /// `%v` — bare value.
    V(&'a Value),
    /// `%q` — quoted value.
    Q(&'a Value),
    /// `%t` — type name of a value.
    T(&'a Value),
    /// `%T` — raw tag name.
    Tag(&'a str),
    /// `%s`.
    S(&'a str),
    /// `%i`.
    I(i64),
    /// `%u`.
    U(u64),
    /// `%f`.
    F(f64),
    /// `%c`.
    C(char),
}

/// The shared formatter buffer.
pub struct Fmt {
    buf: String,
}

impl Fmt {
    pub fn new() -> Self {
        Self { buf: String::new() }
    }

    /// The current buffer contents.
    pub fn buf(&self) -> &str {
        &self.buf
    }

    /// The current buffer length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Render `pattern` with `args`, replacing the buffer or
    /// appending to it.  Directives and arguments are consumed in
    /// step; a missing or mismatched argument renders as `%!` rather
    /// than faulting, since the formatter runs inside error paths.
    pub fn format(
        &mut self,
        syms: &SymbolTable,
        ptrs: &PtrTable,
        append: bool,
        pattern: &str,
        args: &[FmtArg<'_>],
    ) {
        if !append {
            self.buf.clear();
        }

        let mut next = 0usize;
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                self.buf.push(c);
                continue;
            }
            let Some(dir) = chars.next() else {
                self.buf.push('%');
                break;
            };
            if dir == '%' {
                self.buf.push('%');
                continue;
            }

            let arg = args.get(next);
            next += 1;
            match (dir, arg) {
                ('v', Some(FmtArg::V(v))) => {
                    stringify(syms, ptrs, &mut self.buf, v, false, 0);
                }
                ('q', Some(FmtArg::Q(v))) => {
                    stringify(syms, ptrs, &mut self.buf, v, true, 0);
                }
                ('t', Some(FmtArg::T(v))) => {
                    self.buf.push_str(v.type_name());
                }
                ('T', Some(FmtArg::Tag(t))) => {
                    self.buf.push_str(t);
                }
                ('s', Some(FmtArg::S(s))) => {
                    self.buf.push_str(s);
                }
                ('i', Some(FmtArg::I(i))) => {
                    self.buf.push_str(&i.to_string());
                }
                ('u', Some(FmtArg::U(u))) => {
                    self.buf.push_str(&u.to_string());
                }
                ('f', Some(FmtArg::F(f))) => {
                    self.buf.push_str(&f.to_string());
                }
                ('c', Some(FmtArg::C(c))) => {
                    self.buf.push(*c);
                }
                _ => {
                    self.buf.push_str("%!");
                }
            }
        }
    }
}

impl Default for Fmt {
    fn default() -> Self {
        Self::new()
    }
}

/// Append a value's display form to `out`.
pub fn stringify(
    syms: &SymbolTable,
    ptrs: &PtrTable,
    out: &mut String,
    v: &Value,
    quote: bool,
    depth: usize,
) {
    if depth > MAX_DEPTH {
        out.push_str("...");
        return;
    }
    match v {
        Value::Udf => out.push_str("udf"),
        Value::Nil => out.push_str("nil"),
        Value::Log(true) => out.push_str("true"),
        Value::Log(false) => out.push_str("false"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Dec(d) => push_dec(out, *d),
        Value::Sym(s) => {
            let text = syms.text(*s);
            if quote {
                if text.contains('\'') || text.contains('\n') {
                    out.push_str("'|");
                    out.push_str(&text);
                    out.push_str("|'");
                } else {
                    out.push('\'');
                    out.push_str(&text);
                    out.push('\'');
                }
            } else {
                out.push_str(&text);
            }
        }
        Value::Ptr(p) => {
            let tag = ptrs
                .info(*p)
                .map(|i| syms.text(i.type_sym).into_owned())
                .unwrap_or_else(|| "ptr".to_string());
            out.push_str(&format!("<{tag}@{:#x}>", ptrs.addr(*p)));
        }
        Value::Obj(o) => match &o.kind {
            ObjKind::Str(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                if quote {
                    if text.contains('"') || text.contains('\n') {
                        out.push_str("\"|");
                        out.push_str(&text);
                        out.push_str("|\"");
                    } else {
                        out.push('"');
                        out.push_str(&text);
                        out.push('"');
                    }
                } else {
                    out.push_str(&text);
                }
            }
            ObjKind::Rec(cell) => {
                let Ok(rec) = cell.try_borrow() else {
                    out.push_str("{...}");
                    return;
                };
                let Ok(idx) = rec.idx_obj().as_idx().expect("record index").try_borrow() else {
                    out.push_str("{...}");
                    return;
                };
                out.push('{');
                let mut first = true;
                for (key, loc) in idx.iter() {
                    let val = rec.val_at(loc);
                    if val.is_udf() {
                        continue;
                    }
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    push_key(syms, ptrs, out, key, depth + 1);
                    out.push_str(": ");
                    stringify(syms, ptrs, out, &val, true, depth + 1);
                }
                out.push('}');
            }
            ObjKind::Idx(_) => out.push_str("<idx>"),
            ObjKind::Fun(_) => out.push_str("<fun>"),
            ObjKind::Cls(_) => out.push_str("<cls>"),
            ObjKind::Upv(_) => out.push_str("<upv>"),
            ObjKind::Fib(_) => out.push_str("<fib>"),
            ObjKind::Dat(cell) => match cell.try_borrow() {
                Ok(dat) => {
                    out.push('<');
                    out.push_str(&syms.text(dat.info.type_sym));
                    out.push('>');
                }
                Err(_) => out.push_str("<dat>"),
            },
        },
        Value::Tup(n) => out.push_str(&format!("<tup:{n}>")),
        Value::Ref(_) => out.push_str("<ref>"),
    }
}

fn push_dec(out: &mut String, d: f64) {
    if d.is_nan() {
        out.push_str("nan");
    } else if d.is_infinite() {
        out.push_str(if d > 0.0 { "inf" } else { "-inf" });
    } else if d.fract() == 0.0 && d.abs() < 1e15 {
        out.push_str(&format!("{d:.1}"));
    } else {
        out.push_str(&d.to_string());
    }
}

fn push_key(syms: &SymbolTable, ptrs: &PtrTable, out: &mut String, key: &Value, depth: usize) {
    // Identifier-shaped symbol keys print in field form.
    if let Value::Sym(s) = key {
        let bytes = syms.bytes(*s);
        let ident = !bytes.is_empty()
            && bytes[0].is_ascii_alphabetic()
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_');
        if ident {
            out.push('.');
            out.push_str(&String::from_utf8_lossy(bytes));
            return;
        }
    }
    out.push('@');
    stringify(syms, ptrs, out, key, true, depth);
}
