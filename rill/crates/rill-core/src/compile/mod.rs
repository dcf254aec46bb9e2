//! The compiler: a single-pass recursive-descent parser that emits
//! bytecode while it parses.
//!
//! The language is expression-oriented.  The essential grammar:
//!
//! ```text
//! expr    := assign | signal | conditional
//! assign  := ('def' | 'set') dst ':' expr
//! dst     := ident | vartuple | varrecord | fieldpath
//! signal  := 'sig' ident ':' expr
//! conditional := compare (('&?' | '|?' | '!?') compare)*
//! compare := logical (cmpop logical)*
//! logical := shift (('&' | '\' | '|') shift)*
//! shift   := sum (('<<' | '>>') sum)*
//! sum     := product (('+' | '-') product)*
//! product := unary (('*' | '/' | '%') unary)*
//! unary   := ('~' | '!' | '-')? exponent
//! exponent:= call ('^' exponent)?          -- right associative
//! call    := path path*                    -- juxtaposition applies
//! path    := prim ('.' ident | '@' prim)*
//! prim    := const | ident | tuple | record | closure
//!          | do-expr | if-expr | when-expr
//! ```
//!
//! Variables resolve at parse time into one of four scopes (local,
//! closed-over, upvalue, global); closures capture through upvalue
//! entries resolved against the parent generator when the closure
//! body finishes.  Signal handlers are lexically scoped labels; a
//! `sig` against a name with no handler in scope is a compile error.
//!
//! While a compilation runs, its generators' constants are kept
//! reachable through a registered root scanner.

pub(crate) mod gen;

use std::cell::RefCell;
use std::rc::Rc;

use rill_lex::{Lexer, Source, Token};
use rill_util::Symbol;

use crate::error::{ErrKind, Result};
use crate::gc::{Marker, Scan};
use crate::object::Obj;
use crate::opcode::OpCode;
use crate::state::State;
use crate::value::Value;

use gen::{finish, Gen};

/// Compilation parameters.
pub struct ComParams<'a> {
    /// Unit name for debug info; defaults to the source's name.
    pub file: Option<&'a str>,
    /// Parameter names for the unit; a trailing `...` on the last
    /// name makes the unit variadic.  Requires local scope.
    pub params: &'a [&'a str],
    /// Emit debug info (function/file symbols and a line table).
    pub debug: bool,
    /// Resolve free names as globals instead of upvalues.
    pub global: bool,
    /// Parse a delimiter-separated expression sequence instead of a
    /// single expression; a script unit's value is the empty tuple.
    pub script: bool,
}

impl Default for ComParams<'_> {
    fn default() -> Self {
        Self {
            file: None,
            params: &[],
            debug: true,
            global: false,
            script: false,
        }
    }
}

/// Roots held alive for the collector during a compilation.
pub(crate) struct GenRoots {
    vals: RefCell<Vec<Value>>,
}

impl GenRoots {
    fn new() -> Self {
        Self {
            vals: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn keep(&self, v: Value) {
        self.vals.borrow_mut().push(v);
    }
}

impl Scan for GenRoots {
    fn scan(&self, marker: &mut Marker<'_>) {
        for v in self.vals.borrow().iter() {
            marker.mark_value(v);
        }
    }
}

struct Com<'s> {
    lex: Lexer<'s>,
    tok: Token,
    line: u32,
    gens: Vec<Gen>,
    roots: Rc<GenRoots>,
    /// Naming hint for the next closure (set by `def name: [...]`).
    cls_name: Option<Symbol>,
}

/// Compile a source into a function object.
pub fn compile(state: &mut State, src: &mut dyn Source, params: &ComParams<'_>) -> Result<Rc<Obj>> {
    let roots = Rc::new(GenRoots::new());
    let scanner_id = state.install_scanner(roots.clone());
    let result = compile_inner(state, src, params, roots);
    state.remove_scanner(scanner_id);
    result
}

fn compile_inner(
    state: &mut State,
    src: &mut dyn Source,
    params: &ComParams<'_>,
    roots: Rc<GenRoots>,
) -> Result<Rc<Obj>> {
    let file_text = params.file.map(str::to_string).unwrap_or_else(|| {
        let name = src.name();
        if name.is_empty() {
            "<input>".to_string()
        } else {
            name.to_string()
        }
    });
    let file = intern_rooted(state, &roots, &file_text);
    let func = intern_rooted(state, &roots, "<unit>");

    let mut com = Com {
        lex: Lexer::new(src),
        tok: Token::End,
        line: 1,
        gens: vec![Gen::new(params.global, params.debug, func, file)],
        roots,
        cls_name: None,
    };
    advance(state, &mut com)?;

    if !params.params.is_empty() && params.global {
        return Err(state.err_msg(
            ErrKind::Compile,
            "unit parameters require local scope".into(),
        ));
    }
    let mut vpar = false;
    for name in params.params {
        if vpar {
            return Err(state.err_msg(
                ErrKind::Compile,
                "extra parameters after the variadic tail".into(),
            ));
        }
        let (name, is_vpar) = match name.strip_suffix("...") {
            Some(stripped) => (stripped, true),
            None => (*name, false),
        };
        vpar = is_vpar;
        let sym = intern_rooted(state, &com.roots, name);
        top(&mut com).add_param(state, sym, is_vpar)?;
    }

    if params.script {
        par_delim(state, &mut com)?;
        while com.tok != Token::End {
            par_expr(state, &mut com, false)?;
            top(&mut com).emit(OpCode::Pop, 0);
            if com.tok != Token::End && !par_delim(state, &mut com)? {
                return err_par(state, &com, "expected a delimiter between expressions");
            }
        }
        top(&mut com).emit(OpCode::MakeTup, 0);
        top(&mut com).emit(OpCode::Return, 0);
    } else {
        par_expr(state, &mut com, true)?;
        top(&mut com).emit(OpCode::Return, 0);
    }

    let roots = com.roots.clone();
    finish(state, &mut com.gens, &roots, false)
}

// ----------------------------------------------------------------------
// Plumbing
// ----------------------------------------------------------------------

fn top<'a>(com: &'a mut Com<'_>) -> &'a mut Gen {
    com.gens.last_mut().expect("an open generator")
}

fn intern_rooted(state: &mut State, roots: &GenRoots, text: &str) -> Symbol {
    let sym = state.intern(text);
    roots.keep(Value::Sym(sym));
    sym
}

fn advance(state: &mut State, com: &mut Com<'_>) -> Result<()> {
    let lexed = com
        .lex
        .next()
        .map_err(|e| state.err_msg(ErrKind::Syntax, e.to_string()))?;
    com.tok = lexed.tok;
    com.line = lexed.line;
    top(com).set_line(lexed.line);
    Ok(())
}

fn err_par<T>(state: &mut State, com: &Com<'_>, what: &str) -> Result<T> {
    Err(state.err_msg(
        ErrKind::Syntax,
        format!("line {}: {}, found {}", com.line, what, com.tok.describe()),
    ))
}

/// Skip delimiter tokens; true when at least one was skipped.
fn par_delim(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    if com.tok != Token::Delim {
        return Ok(false);
    }
    while com.tok == Token::Delim {
        advance(state, com)?;
    }
    Ok(true)
}

fn expect(state: &mut State, com: &mut Com<'_>, tok: Token, what: &str) -> Result<()> {
    if com.tok != tok {
        return err_par(state, com, what);
    }
    advance(state, com)
}

fn take_ident(state: &mut State, com: &mut Com<'_>) -> Result<Option<Symbol>> {
    match &com.tok {
        Token::Ident(name) => {
            let name = name.clone();
            let sym = intern_rooted(state, &com.roots, &name);
            advance(state, com)?;
            Ok(Some(sym))
        }
        _ => Ok(None),
    }
}

/// Emit the load of a constant value, preferring immediate forms.
fn gen_const(state: &mut State, com: &mut Com<'_>, v: Value) -> Result<()> {
    match &v {
        Value::Udf => {
            top(com).emit(OpCode::LoadUdf, 0);
            return Ok(());
        }
        Value::Nil => {
            top(com).emit(OpCode::LoadNil, 0);
            return Ok(());
        }
        Value::Log(b) => {
            top(com).emit(OpCode::LoadLog, *b as u16);
            return Ok(());
        }
        Value::Int(i) if (0..=u16::MAX as i64).contains(i) => {
            top(com).emit(OpCode::LoadInt, *i as u16);
            return Ok(());
        }
        _ => {}
    }
    com.roots.keep(v.clone());
    let gen = top(com);
    let ix = gen.add_const(state, &v)?;
    gen.emit_const_get(ix);
    Ok(())
}

/// Allocate a fresh index object into the constant pool and emit its
/// load; record literals and variadic collectors each get their own.
fn gen_index(state: &mut State, com: &mut Com<'_>) -> Result<()> {
    let idx = state.new_idx_obj();
    let v = Value::Obj(idx);
    com.roots.keep(v.clone());
    let gen = top(com);
    let ix = gen.add_const(state, &v)?;
    gen.emit_const_get(ix);
    Ok(())
}

// ----------------------------------------------------------------------
// Expressions
// ----------------------------------------------------------------------

fn par_expr(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    if par_assign(state, com)? {
        return Ok(());
    }
    if par_signal(state, com)? {
        return Ok(());
    }
    par_conditional(state, com, tail)
}

/// Short-circuit chain; the jumps keep the deciding value on the
/// stack when they fire.
fn par_conditional(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    par_compare(state, com, tail)?;

    let jump_of = |tok: &Token| match tok {
        Token::AmpQue => Some(OpCode::AndJump),
        Token::BarQue => Some(OpCode::OrJump),
        Token::BangQue => Some(OpCode::UdfJump),
        _ => None,
    };

    if jump_of(&com.tok).is_none() {
        return Ok(());
    }
    let exit_sym = intern_rooted(state, &com.roots, "$e");
    let exit = top(com).add_lbl(state, exit_sym)?;
    while let Some(op) = jump_of(&com.tok) {
        advance(state, com)?;
        par_delim(state, com)?;
        top(com).emit(op, exit.0);
        par_compare(state, com, tail)?;
    }
    let place = top(com).place();
    top(com).mov_lbl(exit, place);
    Ok(())
}

type SubParser = fn(&mut State, &mut Com<'_>, bool) -> Result<()>;

fn par_binary(
    state: &mut State,
    com: &mut Com<'_>,
    tail: bool,
    ops: &[(Token, OpCode)],
    sub: SubParser,
) -> Result<()> {
    sub(state, com, tail)?;
    loop {
        let Some(op) = ops.iter().find(|(t, _)| *t == com.tok).map(|(_, o)| *o) else {
            return Ok(());
        };
        advance(state, com)?;
        par_delim(state, com)?;
        sub(state, com, false)?;
        top(com).emit(op, 0);
    }
}

fn par_compare(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    par_binary(
        state,
        com,
        tail,
        &[
            (Token::Lt, OpCode::Ilt),
            (Token::Gt, OpCode::Imt),
            (Token::Le, OpCode::Ile),
            (Token::Ge, OpCode::Ime),
            (Token::Eq, OpCode::Iet),
            (Token::TildeEq, OpCode::Net),
            (Token::BangEq, OpCode::Ietu),
        ],
        par_logical,
    )
}

fn par_logical(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    par_binary(
        state,
        com,
        tail,
        &[
            (Token::Amp, OpCode::And),
            (Token::Bslash, OpCode::Xor),
            (Token::Bar, OpCode::Or),
        ],
        par_shift,
    )
}

fn par_shift(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    par_binary(
        state,
        com,
        tail,
        &[(Token::Shl, OpCode::Lsl), (Token::Shr, OpCode::Lsr)],
        par_sum,
    )
}

fn par_sum(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    par_binary(
        state,
        com,
        tail,
        &[(Token::Plus, OpCode::Add), (Token::Minus, OpCode::Sub)],
        par_product,
    )
}

fn par_product(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    par_binary(
        state,
        com,
        tail,
        &[
            (Token::Star, OpCode::Mul),
            (Token::Slash, OpCode::Div),
            (Token::Percent, OpCode::Mod),
        ],
        par_unary,
    )
}

fn par_unary(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    let op = match com.tok {
        Token::Tilde => Some(OpCode::Not),
        Token::Bang => Some(OpCode::Fix),
        Token::Minus => Some(OpCode::Neg),
        _ => None,
    };
    if let Some(op) = op {
        advance(state, com)?;
        par_delim(state, com)?;
        par_unary(state, com, false)?;
        top(com).emit(op, 0);
        Ok(())
    } else {
        par_exponent(state, com, tail)
    }
}

fn par_exponent(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    par_call(state, com, tail)?;
    if com.tok == Token::Caret {
        advance(state, com)?;
        par_delim(state, com)?;
        par_exponent(state, com, false)?;
        top(com).emit(OpCode::Pow, 0);
    }
    Ok(())
}

/// Juxtaposition is application.  In a tail context a call whose
/// value ends the expression gets a `RETURN` marker right after the
/// `CALL`, which the interpreter treats as a tail call.
fn par_call(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<()> {
    // A do/if/when in the leading path swallows the rest of the
    // expression, so it can safely inherit the tail context; paths
    // applied by juxtaposition cannot.
    if !par_path(state, com, tail)? {
        return err_par(state, com, "expected an expression");
    }
    let mut called = false;
    while par_path(state, com, false)? {
        top(com).emit(OpCode::Call, 0);
        called = true;
    }
    if called
        && tail
        && matches!(
            com.tok,
            Token::Delim | Token::End | Token::Else | Token::For | Token::In
        )
    {
        top(com).emit(OpCode::Return, 0);
    }
    Ok(())
}

fn par_path(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<bool> {
    if !par_prim(state, com, tail)? {
        return Ok(false);
    }
    loop {
        match com.tok {
            Token::Dot => {
                advance(state, com)?;
                let Some(sym) = take_ident(state, com)? else {
                    return err_par(state, com, "expected an identifier after '.'");
                };
                gen_const(state, com, Value::Sym(sym))?;
                top(com).emit(OpCode::GetField, 0);
            }
            Token::At => {
                advance(state, com)?;
                if !par_prim(state, com, false)? {
                    return err_par(state, com, "expected a primary expression after '@'");
                }
                top(com).emit(OpCode::GetField, 0);
            }
            _ => return Ok(true),
        }
    }
}

fn par_prim(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<bool> {
    Ok(par_const(state, com)?
        || par_get(state, com)?
        || par_tuple(state, com)?
        || par_record(state, com)?
        || par_closure(state, com)?
        || par_do(state, com, tail)?
        || par_if(state, com, tail)?
        || par_when(state, com, tail)?)
}

fn par_const(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    let v = match &com.tok {
        Token::Int(i) => Value::Int(*i),
        Token::Dec(d) => Value::Dec(*d),
        Token::Log(b) => Value::Log(*b),
        Token::Nil => Value::Nil,
        Token::Udf => Value::Udf,
        Token::Sym(text) => {
            let text = text.clone();
            let sym = state.intern(&text);
            Value::Sym(sym)
        }
        Token::Str(text) => {
            let text = text.clone();
            state.new_str(text.as_bytes())
        }
        _ => return Ok(false),
    };
    gen_const(state, com, v)?;
    advance(state, com)?;
    Ok(true)
}

fn par_get(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    let Token::Ident(_) = &com.tok else {
        return Ok(false);
    };
    let sym = take_ident(state, com)?.expect("identifier token");
    let var = top(com).get_var(state, sym)?;
    top(com).emit_get(var);
    Ok(true)
}

fn par_tuple(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    if com.tok != Token::LParen {
        return Ok(false);
    }
    advance(state, com)?;
    par_delim(state, com)?;

    let mut size: u16 = 0;
    let mut rexp = false;
    while com.tok != Token::RParen {
        if rexp {
            return err_par(state, com, "extra entries after a tuple expansion");
        }
        if size == u16::MAX {
            return Err(state.err_msg(ErrKind::Limit, "tuple entry count".into()));
        }
        size += 1;
        par_expr(state, com, false)?;
        if com.tok == Token::Ellipsis {
            rexp = true;
            advance(state, com)?;
        }
        if com.tok != Token::RParen && !par_delim(state, com)? {
            return err_par(state, com, "missing ')'");
        }
    }
    advance(state, com)?;

    if rexp {
        top(com).emit(OpCode::MakeVtup, size);
    } else if size != 1 {
        top(com).emit(OpCode::MakeTup, size);
    }
    Ok(true)
}

/// A record key in a constructor or pattern: `.ident` or `@prim`.
fn par_key(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    match com.tok {
        Token::Dot => {
            advance(state, com)?;
            let Some(sym) = take_ident(state, com)? else {
                return err_par(state, com, "expected an identifier after '.'");
            };
            gen_const(state, com, Value::Sym(sym))?;
            Ok(true)
        }
        Token::At => {
            advance(state, com)?;
            if !par_prim(state, com, false)? {
                return err_par(state, com, "expected a primary expression after '@'");
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn par_record(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    if com.tok != Token::LBrace {
        return Ok(false);
    }
    advance(state, com)?;
    par_delim(state, com)?;

    gen_index(state, com)?;

    let mut size: u16 = 0;
    let mut ikey: i64 = 0;
    let mut rexp = false;
    while com.tok != Token::RBrace {
        if rexp {
            return err_par(state, com, "extra entries after a record expansion");
        }
        if size == u16::MAX {
            return Err(state.err_msg(ErrKind::Limit, "record constructor entry count".into()));
        }
        size += 1;
        if par_key(state, com)? {
            expect(state, com, Token::Colon, "expected ':' after a record key")?;
            par_delim(state, com)?;
            par_expr(state, com, false)?;
        } else {
            gen_const(state, com, Value::Int(ikey))?;
            ikey += 1;
            par_expr(state, com, false)?;
            if com.tok == Token::Ellipsis {
                rexp = true;
                advance(state, com)?;
            }
        }
        if com.tok != Token::RBrace && !par_delim(state, com)? {
            return err_par(state, com, "missing '}'");
        }
    }
    advance(state, com)?;

    if rexp {
        top(com).emit(OpCode::MakeVrec, size);
    } else {
        top(com).emit(OpCode::MakeRec, size);
    }
    Ok(true)
}

fn par_closure(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    if com.tok != Token::LBracket {
        return Ok(false);
    }

    let func = match com.cls_name.take() {
        Some(name) => name,
        None => intern_rooted(state, &com.roots, "<anon>"),
    };
    let (debug, file) = {
        let g = top(com);
        (g.debug, g.file)
    };
    com.gens.push(Gen::new(false, debug, func, file));
    let line = com.line;
    top(com).set_line(line);

    advance(state, com)?;
    par_delim(state, com)?;
    let mut vpar = false;
    while com.tok != Token::RBracket {
        if vpar {
            return err_par(state, com, "extra parameters after the variadic tail");
        }
        let Some(sym) = take_ident(state, com)? else {
            return err_par(state, com, "expected a parameter name");
        };
        if com.tok == Token::Ellipsis {
            vpar = true;
            advance(state, com)?;
        }
        top(com).add_param(state, sym, vpar)?;
        if com.tok != Token::RBracket && !par_delim(state, com)? {
            return err_par(state, com, "missing ']'");
        }
    }
    advance(state, com)?;
    par_delim(state, com)?;

    par_expr(state, com, true)?;
    top(com).emit(OpCode::Return, 0);

    let roots = com.roots.clone();
    finish(state, &mut com.gens, &roots, true)?;
    Ok(true)
}

fn par_do(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<bool> {
    if com.tok != Token::Do {
        return Ok(false);
    }
    advance(state, com)?;
    top(com).open_scope();
    par_delim(state, com)?;

    while com.tok != Token::For {
        if com.tok == Token::End {
            return err_par(state, com, "missing 'for' to close the do expression");
        }
        par_expr(state, com, false)?;
        top(com).emit(OpCode::Pop, 0);
        if com.tok != Token::For && !par_delim(state, com)? {
            return err_par(state, com, "expected a delimiter between do clauses");
        }
    }
    advance(state, com)?;
    par_delim(state, com)?;

    par_expr(state, com, tail)?;
    top(com).close_scope();
    Ok(true)
}

fn par_if(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<bool> {
    if com.tok != Token::If {
        return Ok(false);
    }
    advance(state, com)?;
    top(com).open_scope();
    par_delim(state, com)?;

    let exit_sym = intern_rooted(state, &com.roots, "$e");
    let exit = top(com).add_lbl(state, exit_sym)?;

    let mut clause = 0u32;
    loop {
        clause += 1;
        let alt_sym = intern_rooted(state, &com.roots, &format!("${clause}"));
        let alt = top(com).add_lbl(state, alt_sym)?;

        par_expr(state, com, false)?;
        top(com).emit(OpCode::AltJump, alt.0);
        expect(state, com, Token::Colon, "expected ':' after the predicate")?;
        par_delim(state, com)?;
        par_expr(state, com, tail)?;
        top(com).emit(OpCode::Jump, exit.0);

        let place = top(com).place();
        top(com).mov_lbl(alt, place);

        if com.tok == Token::Else {
            break;
        }
        if !par_delim(state, com)? {
            return err_par(state, com, "expected 'else' or another clause");
        }
        if com.tok == Token::Else {
            break;
        }
    }
    advance(state, com)?;
    par_delim(state, com)?;

    par_expr(state, com, tail)?;
    let place = top(com).place();
    top(com).mov_lbl(exit, place);
    top(com).close_scope();
    Ok(true)
}

fn par_when(state: &mut State, com: &mut Com<'_>, tail: bool) -> Result<bool> {
    if com.tok != Token::When {
        return Ok(false);
    }
    advance(state, com)?;
    top(com).open_scope();
    par_delim(state, com)?;

    let exit_sym = intern_rooted(state, &com.roots, "$e");
    let exit = top(com).add_lbl(state, exit_sym)?;
    let in_sym = intern_rooted(state, &com.roots, "$i");
    let in_lbl = top(com).add_lbl(state, in_sym)?;

    // The handlers sit between here and the 'in' clause; they only
    // run when jumped to by a signal.
    top(com).emit(OpCode::Jump, in_lbl.0);

    while com.tok != Token::In {
        let Some(name) = take_ident(state, com)? else {
            return err_par(state, com, "expected a signal handler name");
        };
        top(com).add_lbl(state, name)?;
        top(com).open_scope();

        expect(state, com, Token::LParen, "expected a signal parameter list")?;
        par_delim(state, com)?;
        let mut size: u16 = 0;
        let mut vpar = false;
        while com.tok != Token::RParen {
            if vpar {
                return err_par(state, com, "extra parameters after the variadic tail");
            }
            let Some(sym) = take_ident(state, com)? else {
                return err_par(state, com, "expected a signal parameter name");
            };
            if com.tok == Token::Ellipsis {
                vpar = true;
                advance(state, com)?;
            }
            size += 1;
            let var = top(com).add_var(state, sym)?;
            top(com).emit_ref(var);
            if com.tok != Token::RParen && !par_delim(state, com)? {
                return err_par(state, com, "missing ')'");
            }
        }
        advance(state, com)?;

        if vpar {
            gen_index(state, com)?;
            top(com).emit(OpCode::DefVsig, size - 1);
        } else {
            top(com).emit(OpCode::DefSig, size);
        }

        expect(state, com, Token::Colon, "expected ':' after signal parameters")?;
        par_delim(state, com)?;
        par_expr(state, com, tail)?;
        top(com).emit(OpCode::Jump, exit.0);
        top(com).close_scope();

        if com.tok != Token::In && !par_delim(state, com)? {
            return err_par(state, com, "expected 'in' or another handler");
        }
    }
    advance(state, com)?;
    par_delim(state, com)?;

    let place = top(com).place();
    top(com).mov_lbl(in_lbl, place);
    par_expr(state, com, tail)?;
    let place = top(com).place();
    top(com).mov_lbl(exit, place);
    top(com).close_scope();
    Ok(true)
}

// ----------------------------------------------------------------------
// Assignment
// ----------------------------------------------------------------------

fn par_signal(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    if com.tok != Token::Sig {
        return Ok(false);
    }
    advance(state, com)?;
    let Some(name) = take_ident(state, com)? else {
        return err_par(state, com, "expected a signal name after 'sig'");
    };
    let Some(lbl) = top(com).get_lbl(name) else {
        let text = state.syms().text(name).into_owned();
        return Err(state.err_msg(
            ErrKind::Compile,
            format!("no signal handler for '{text}' in scope"),
        ));
    };
    expect(state, com, Token::Colon, "expected ':' after the signal name")?;
    par_expr(state, com, false)?;
    top(com).emit(OpCode::Jump, lbl.0);
    Ok(true)
}

fn par_assign(state: &mut State, com: &mut Com<'_>) -> Result<bool> {
    let def = match com.tok {
        Token::Def => true,
        Token::Set => false,
        _ => return Ok(false),
    };
    advance(state, com)?;

    let assign: (OpCode, u16) = match &com.tok {
        Token::LParen => par_var_tup(state, com, def)?,
        Token::LBrace => par_var_rec(state, com, def)?,
        Token::Ident(_) => {
            let sym = take_ident(state, com)?.expect("identifier token");
            if com.tok == Token::Colon {
                let var = if def {
                    top(com).add_var(state, sym)?
                } else {
                    top(com).get_var(state, sym)?
                };
                top(com).emit_ref(var);
                // Name the closure when one follows directly.
                com.cls_name = Some(sym);
                (if def { OpCode::DefOne } else { OpCode::SetOne }, 0)
            } else {
                let var = top(com).get_var(state, sym)?;
                top(com).emit_get(var);
                fin_field_dst(state, com, def)?
            }
        }
        _ => {
            if !par_prim(state, com, false)? {
                return err_par(state, com, "expected a variable or field pattern");
            }
            if com.tok == Token::Colon {
                return err_par(state, com, "expected a field pattern before ':'");
            }
            fin_field_dst(state, com, def)?
        }
    };

    expect(state, com, Token::Colon, "expected ':' after the assignment pattern")?;
    par_expr(state, com, false)?;
    com.cls_name = None;

    top(com).emit(assign.0, assign.1);
    Ok(true)
}

/// Variable tuple pattern `(a, b, rest...)`.
fn par_var_tup(state: &mut State, com: &mut Com<'_>, def: bool) -> Result<(OpCode, u16)> {
    advance(state, com)?;
    par_delim(state, com)?;

    let mut size: u16 = 0;
    let mut vtup = false;
    while com.tok != Token::RParen {
        if vtup {
            return err_par(state, com, "extra names after '...'");
        }
        let Some(sym) = take_ident(state, com)? else {
            return err_par(state, com, "expected a variable name");
        };
        size += 1;
        let var = if def {
            top(com).add_var(state, sym)?
        } else {
            top(com).get_var(state, sym)?
        };
        top(com).emit_ref(var);
        if com.tok == Token::Ellipsis {
            vtup = true;
            advance(state, com)?;
        }
        if com.tok != Token::RParen && !par_delim(state, com)? {
            return err_par(state, com, "missing ')'");
        }
    }
    advance(state, com)?;

    if vtup {
        gen_index(state, com)?;
        Ok((if def { OpCode::DefVtup } else { OpCode::SetVtup }, size - 1))
    } else {
        Ok((if def { OpCode::DefTup } else { OpCode::SetTup }, size))
    }
}

/// Variable record pattern `{a: .k, b, rest...}`.
fn par_var_rec(state: &mut State, com: &mut Com<'_>, def: bool) -> Result<(OpCode, u16)> {
    advance(state, com)?;
    par_delim(state, com)?;

    let mut size: u16 = 0;
    let mut ikey: i64 = 0;
    let mut vrec = false;
    while com.tok != Token::RBrace {
        if vrec {
            return err_par(state, com, "extra names after '...'");
        }
        let Some(sym) = take_ident(state, com)? else {
            return err_par(state, com, "expected a variable name");
        };
        size += 1;
        let var = if def {
            top(com).add_var(state, sym)?
        } else {
            top(com).get_var(state, sym)?
        };
        top(com).emit_ref(var);

        if com.tok == Token::Ellipsis {
            vrec = true;
            advance(state, com)?;
        } else if com.tok == Token::Colon {
            advance(state, com)?;
            if !par_key(state, com)? {
                return err_par(state, com, "expected a record key after ':'");
            }
        } else {
            gen_const(state, com, Value::Int(ikey))?;
            ikey += 1;
        }
        if com.tok != Token::RBrace && !par_delim(state, com)? {
            return err_par(state, com, "missing '}'");
        }
    }
    advance(state, com)?;

    if vrec {
        gen_index(state, com)?;
        Ok((if def { OpCode::DefVrec } else { OpCode::SetVrec }, size - 1))
    } else {
        Ok((if def { OpCode::DefRec } else { OpCode::SetRec }, size))
    }
}

/// Key tuple pattern `(.k1, .k2, .rest...)` against a record
/// destination.
fn par_key_tup(state: &mut State, com: &mut Com<'_>, def: bool) -> Result<(OpCode, u16)> {
    advance(state, com)?;
    par_delim(state, com)?;

    let mut size: u16 = 0;
    let mut vtup = false;
    while com.tok != Token::RParen {
        if vtup {
            return err_par(state, com, "extra keys after '...'");
        }
        if !par_key(state, com)? {
            return err_par(state, com, "expected a record key");
        }
        size += 1;
        if com.tok == Token::Ellipsis {
            vtup = true;
            advance(state, com)?;
        }
        if com.tok != Token::RParen && !par_delim(state, com)? {
            return err_par(state, com, "missing ')'");
        }
    }
    advance(state, com)?;

    if vtup {
        gen_index(state, com)?;
        Ok((
            if def {
                OpCode::RecDefVtup
            } else {
                OpCode::RecSetVtup
            },
            size - 1,
        ))
    } else {
        Ok((
            if def {
                OpCode::RecDefTup
            } else {
                OpCode::RecSetTup
            },
            size,
        ))
    }
}

/// Key record pattern `{.dst: .src, ...}` against a record
/// destination.
fn par_key_rec(state: &mut State, com: &mut Com<'_>, def: bool) -> Result<(OpCode, u16)> {
    advance(state, com)?;
    par_delim(state, com)?;

    let mut size: u16 = 0;
    let mut ikey: i64 = 0;
    let mut vrec = false;
    while com.tok != Token::RBrace {
        if vrec {
            return err_par(state, com, "extra keys after '...'");
        }
        if !par_key(state, com)? {
            return err_par(state, com, "expected a record key");
        }
        size += 1;

        if com.tok == Token::Ellipsis {
            vrec = true;
            advance(state, com)?;
        } else if com.tok == Token::Colon {
            advance(state, com)?;
            if !par_key(state, com)? {
                return err_par(state, com, "expected a record key after ':'");
            }
        } else {
            gen_const(state, com, Value::Int(ikey))?;
            ikey += 1;
        }
        if com.tok != Token::RBrace && !par_delim(state, com)? {
            return err_par(state, com, "missing '}'");
        }
    }
    advance(state, com)?;

    if vrec {
        gen_index(state, com)?;
        Ok((
            if def {
                OpCode::RecDefVrec
            } else {
                OpCode::RecSetVrec
            },
            size - 1,
        ))
    } else {
        Ok((
            if def {
                OpCode::RecDefRec
            } else {
                OpCode::RecSetRec
            },
            size,
        ))
    }
}

/// Finish a field-path destination.  The record is on the stack;
/// intermediate keys descend through `GET_FIELD`, and the terminal
/// is a single key, a key tuple, or a key record.
fn fin_field_dst(state: &mut State, com: &mut Com<'_>, def: bool) -> Result<(OpCode, u16)> {
    loop {
        // Stack: the destination record so far.
        match com.tok {
            Token::LParen => return par_key_tup(state, com, def),
            Token::LBrace => return par_key_rec(state, com, def),
            _ => {}
        }
        if !par_key(state, com)? {
            return err_par(state, com, "expected a field pattern");
        }
        // Stack: record and key.  Another step descends; anything
        // else is the single-key terminal.
        match com.tok {
            Token::Dot | Token::At | Token::LParen | Token::LBrace => {
                top(com).emit(OpCode::GetField, 0);
            }
            _ => {
                return Ok((
                    if def {
                        OpCode::RecDefOne
                    } else {
                        OpCode::RecSetOne
                    },
                    0,
                ));
            }
        }
    }
}
