//! The lexer.
//!
//! A pull lexer with one character of lookahead and a small pushback
//! stack.  The pushback exists for exactly one construct: a `.` seen
//! inside a numeric literal that turns out to begin an ellipsis
//! (`1...` lexes as the integer `1` followed by `...`), which needs
//! the dot returned to the stream.
//!
//! The lexer consumes a [`Source`] and produces [`Lexed`] tokens (a
//! [`Token`] plus the 1-based line it started on).  It never looks at
//! more than the next character, never buffers the whole input, and
//! reports errors with the line they occurred on.

use thiserror::Error;

use crate::source::Source;
use crate::token::Token;

/// A lexical error with its source line.
#[derive(Debug, Error)]
#[error("line {line}: {message}")]
pub struct LexError {
    /// 1-based line the error occurred on.
    pub line: u32,
    /// Human-readable description.
    pub message: String,
}

/// A token together with the line it started on.
#[derive(Clone, Debug, PartialEq)]
pub struct Lexed {
    pub tok: Token,
    pub line: u32,
}

/// Lexer over a character source.
pub struct Lexer<'s> {
    src: &'s mut dyn Source,
    /// One-character lookahead.
    cur: Option<char>,
    /// Pushed-back characters, returned before reading the source.
    pending: Vec<char>,
    /// Current 1-based line.
    line: u32,
}

impl<'s> Lexer<'s> {
    /// Create a lexer over `src` and prime the lookahead.
    pub fn new(src: &'s mut dyn Source) -> Self {
        let mut lexer = Self {
            src,
            cur: None,
            pending: Vec::new(),
            line: 1,
        };
        lexer.cur = lexer.src.next_char();
        lexer
    }

    /// The name of the underlying source.
    pub fn source_name(&self) -> &str {
        self.src.name()
    }

    /// The current line (of the lookahead character).
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Consume and return the lookahead character.
    fn take(&mut self) -> Option<char> {
        let c = self.cur;
        self.cur = self.pending.pop().or_else(|| self.src.next_char());
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    /// Consume the lookahead when it equals `want`.
    fn take_if(&mut self, want: char) -> bool {
        if self.cur == Some(want) {
            self.take();
            true
        } else {
            false
        }
    }

    /// Return `c` to the stream, in front of the current lookahead.
    fn unread(&mut self, c: char) {
        if let Some(cur) = self.cur {
            self.pending.push(cur);
        }
        self.cur = Some(c);
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, LexError> {
        Err(LexError {
            line: self.line,
            message: message.into(),
        })
    }

    /// Produce the next token.
    pub fn next(&mut self) -> Result<Lexed, LexError> {
        loop {
            // Blanks separate tokens; newlines are delimiters, not
            // blanks.
            while matches!(self.cur, Some(' ') | Some('\t')) {
                self.take();
            }

            if self.cur == Some('`') {
                self.take();
                self.skip_comment()?;
                continue;
            }

            let line = self.line;
            let tok = self.scan()?;
            return Ok(Lexed { tok, line });
        }
    }

    fn scan(&mut self) -> Result<Token, LexError> {
        let Some(c) = self.cur else {
            return Ok(Token::End);
        };

        match c {
            '\n' | '\r' => {
                self.take();
                Ok(Token::Delim)
            }
            ',' => {
                self.take();
                Ok(Token::Delim)
            }
            ':' => {
                self.take();
                Ok(Token::Colon)
            }
            '(' => {
                self.take();
                Ok(Token::LParen)
            }
            ')' => {
                self.take();
                Ok(Token::RParen)
            }
            '[' => {
                self.take();
                Ok(Token::LBracket)
            }
            ']' => {
                self.take();
                Ok(Token::RBracket)
            }
            '{' => {
                self.take();
                Ok(Token::LBrace)
            }
            '}' => {
                self.take();
                Ok(Token::RBrace)
            }
            '\'' => self.scan_sym(),
            '"' => self.scan_str(),
            c if c.is_ascii_alphabetic() => Ok(self.scan_word()),
            c if c.is_ascii_digit() => self.scan_number(),
            _ => self.scan_oper(),
        }
    }

    /// Identifier or keyword.
    fn scan_word(&mut self) -> Token {
        let mut text = String::new();
        while let Some(c) = self.cur {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.take();
            } else {
                break;
            }
        }

        match text.as_str() {
            "def" => Token::Def,
            "set" => Token::Set,
            "sig" => Token::Sig,
            "if" => Token::If,
            "else" => Token::Else,
            "do" => Token::Do,
            "for" => Token::For,
            "when" => Token::When,
            "in" => Token::In,
            "true" => Token::Log(true),
            "false" => Token::Log(false),
            "nil" => Token::Nil,
            "udf" => Token::Udf,
            _ => Token::Ident(text),
        }
    }

    /// Numeric literal.  Digits may be grouped with underscores; a
    /// single dot begins the fraction; a dot that turns out to start
    /// an ellipsis is returned to the stream.
    fn scan_number(&mut self) -> Result<Token, LexError> {
        let mut digits = String::new();
        self.scan_digits(&mut digits);

        if !self.take_if('.') {
            return self.parse_int(&digits);
        }

        if self.cur == Some('.') {
            // `N...` — the dot belongs to an ellipsis operator.
            self.unread('.');
            return self.parse_int(&digits);
        }

        digits.push('.');
        self.scan_digits(&mut digits);
        if digits.ends_with('.') {
            digits.push('0');
        }

        if self.cur == Some('.') {
            return self.err("extra decimal point");
        }

        match digits.parse::<f64>() {
            Ok(d) => Ok(Token::Dec(d)),
            Err(_) => self.err(format!("malformed decimal literal '{digits}'")),
        }
    }

    fn scan_digits(&mut self, out: &mut String) {
        while let Some(c) = self.cur {
            if c.is_ascii_digit() {
                out.push(c);
                self.take();
            } else if c == '_' {
                self.take();
            } else {
                break;
            }
        }
    }

    fn parse_int(&self, digits: &str) -> Result<Token, LexError> {
        match digits.parse::<i64>() {
            Ok(i) => Ok(Token::Int(i)),
            Err(_) => self.err(format!("integer literal '{digits}' out of range")),
        }
    }

    /// Symbol literal, quote already in the lookahead.
    fn scan_sym(&mut self) -> Result<Token, LexError> {
        self.take();
        let text = self.scan_quoted('\'', "symbol")?;
        Ok(Token::Sym(text))
    }

    /// String literal, quote already in the lookahead.
    fn scan_str(&mut self) -> Result<Token, LexError> {
        self.take();
        let text = self.scan_quoted('"', "string")?;
        Ok(Token::Str(text))
    }

    /// Body of a quoted literal.  The plain form runs to the closing
    /// quote on the same line; the block form `Q|...|Q` runs to the
    /// `|Q` pair and may span lines.
    fn scan_quoted(&mut self, quote: char, what: &str) -> Result<String, LexError> {
        let mut text = String::new();

        if self.take_if('|') {
            loop {
                match self.take() {
                    Some('|') if self.cur == Some(quote) => {
                        self.take();
                        return Ok(text);
                    }
                    Some(c) => text.push(c),
                    None => return self.err(format!("unexpected EOF in block {what}")),
                }
            }
        }

        loop {
            match self.cur {
                Some(c) if c == quote => {
                    self.take();
                    return Ok(text);
                }
                Some('\n') | Some('\r') | None => {
                    return self.err(format!("unterminated {what}"));
                }
                Some(c) => {
                    text.push(c);
                    self.take();
                }
            }
        }
    }

    /// Comment body, backtick already consumed.  The inline form runs
    /// to a closing backtick or the end of the line (the newline is
    /// left in the stream as a delimiter); the block form runs to the
    /// `` |` `` pair.
    fn skip_comment(&mut self) -> Result<(), LexError> {
        if self.take_if('|') {
            loop {
                match self.take() {
                    Some('|') if self.cur == Some('`') => {
                        self.take();
                        return Ok(());
                    }
                    Some(_) => {}
                    None => return self.err("unexpected EOF in block comment"),
                }
            }
        }

        loop {
            match self.cur {
                Some('`') => {
                    self.take();
                    return Ok(());
                }
                Some('\n') | Some('\r') | None => return Ok(()),
                Some(_) => {
                    self.take();
                }
            }
        }
    }

    /// Operator tokens.
    fn scan_oper(&mut self) -> Result<Token, LexError> {
        let c = self.take().expect("caller checked lookahead");
        let tok = match c {
            '@' => Token::At,
            '.' => {
                if self.take_if('.') {
                    if self.take_if('.') {
                        Token::Ellipsis
                    } else {
                        return self.err("incomplete ellipsis");
                    }
                } else {
                    Token::Dot
                }
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '!' => {
                if self.take_if('?') {
                    Token::BangQue
                } else if self.take_if('=') {
                    Token::BangEq
                } else {
                    Token::Bang
                }
            }
            '~' => {
                if self.take_if('=') {
                    Token::TildeEq
                } else {
                    Token::Tilde
                }
            }
            '^' => Token::Caret,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '<' => {
                if self.take_if('<') {
                    Token::Shl
                } else if self.take_if('=') {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if self.take_if('>') {
                    Token::Shr
                } else if self.take_if('=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '\\' => Token::Bslash,
            '|' => {
                if self.take_if('?') {
                    Token::BarQue
                } else {
                    Token::Bar
                }
            }
            '&' => {
                if self.take_if('?') {
                    Token::AmpQue
                } else {
                    Token::Amp
                }
            }
            '=' => Token::Eq,
            other => return self.err(format!("unexpected character '{other}'")),
        };
        Ok(tok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StrSource;

    fn lex_all(text: &str) -> Vec<Token> {
        let mut src = StrSource::new("<test>", text);
        let mut lexer = Lexer::new(&mut src);
        let mut out = Vec::new();
        loop {
            let lexed = lexer.next().expect("lexes cleanly");
            let end = lexed.tok == Token::End;
            out.push(lexed.tok);
            if end {
                break;
            }
        }
        out
    }

    fn lex_err(text: &str) -> LexError {
        let mut src = StrSource::new("<test>", text);
        let mut lexer = Lexer::new(&mut src);
        loop {
            match lexer.next() {
                Ok(Lexed {
                    tok: Token::End, ..
                }) => panic!("expected a lexical error"),
                Ok(_) => continue,
                Err(e) => return e,
            }
        }
    }

    #[test]
    fn integers_and_decimals() {
        assert_eq!(
            lex_all("12 1_000 2.5 7."),
            vec![
                Token::Int(12),
                Token::Int(1000),
                Token::Dec(2.5),
                Token::Dec(7.0),
                Token::End
            ]
        );
    }

    #[test]
    fn integer_before_ellipsis() {
        assert_eq!(
            lex_all("1..."),
            vec![Token::Int(1), Token::Ellipsis, Token::End]
        );
    }

    #[test]
    fn extra_decimal_point_is_an_error() {
        let e = lex_err("1.2.3");
        assert!(e.message.contains("decimal"));
    }

    #[test]
    fn incomplete_ellipsis_is_an_error() {
        let e = lex_err("a..b");
        assert!(e.message.contains("ellipsis"));
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            lex_all("def set sig if else do for when in foo f_1"),
            vec![
                Token::Def,
                Token::Set,
                Token::Sig,
                Token::If,
                Token::Else,
                Token::Do,
                Token::For,
                Token::When,
                Token::In,
                Token::Ident("foo".into()),
                Token::Ident("f_1".into()),
                Token::End
            ]
        );
    }

    #[test]
    fn constant_words() {
        assert_eq!(
            lex_all("true false nil udf"),
            vec![
                Token::Log(true),
                Token::Log(false),
                Token::Nil,
                Token::Udf,
                Token::End
            ]
        );
    }

    #[test]
    fn symbols_and_strings() {
        assert_eq!(
            lex_all("'abc' \"hi\""),
            vec![
                Token::Sym("abc".into()),
                Token::Str("hi".into()),
                Token::End
            ]
        );
    }

    #[test]
    fn block_symbol_keeps_quotes_and_newlines() {
        assert_eq!(
            lex_all("'|a'b\nc|'"),
            vec![Token::Sym("a'b\nc".into()), Token::End]
        );
    }

    #[test]
    fn block_string_keeps_bars() {
        assert_eq!(
            lex_all("\"|x | y|\""),
            vec![Token::Str("x | y".into()), Token::End]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let e = lex_err("\"oops\nmore");
        assert!(e.message.contains("unterminated"));
        assert_eq!(e.line, 1);
    }

    #[test]
    fn inline_comment_ends_at_newline() {
        assert_eq!(
            lex_all("1 ` note\n2"),
            vec![Token::Int(1), Token::Delim, Token::Int(2), Token::End]
        );
    }

    #[test]
    fn inline_comment_ends_at_backtick() {
        assert_eq!(
            lex_all("1 `note` 2"),
            vec![Token::Int(1), Token::Int(2), Token::End]
        );
    }

    #[test]
    fn block_comment_spans_lines() {
        assert_eq!(
            lex_all("1 `| a\nb |` 2"),
            vec![Token::Int(1), Token::Int(2), Token::End]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            lex_all("+ - ! ~ ^ * / % << >> & \\ | &? |? !? = ~= != < > <= >= . @ ..."),
            vec![
                Token::Plus,
                Token::Minus,
                Token::Bang,
                Token::Tilde,
                Token::Caret,
                Token::Star,
                Token::Slash,
                Token::Percent,
                Token::Shl,
                Token::Shr,
                Token::Amp,
                Token::Bslash,
                Token::Bar,
                Token::AmpQue,
                Token::BarQue,
                Token::BangQue,
                Token::Eq,
                Token::TildeEq,
                Token::BangEq,
                Token::Lt,
                Token::Gt,
                Token::Le,
                Token::Ge,
                Token::Dot,
                Token::At,
                Token::Ellipsis,
                Token::End
            ]
        );
    }

    #[test]
    fn newlines_and_commas_are_delimiters() {
        assert_eq!(
            lex_all("1,2\n3"),
            vec![
                Token::Int(1),
                Token::Delim,
                Token::Int(2),
                Token::Delim,
                Token::Int(3),
                Token::End
            ]
        );
    }

    #[test]
    fn lines_are_tracked() {
        let mut src = StrSource::new("<test>", "1\n  2\n3");
        let mut lexer = Lexer::new(&mut src);

        assert_eq!(lexer.next().unwrap().line, 1); // 1
        assert_eq!(lexer.next().unwrap().line, 1); // delim
        assert_eq!(lexer.next().unwrap().line, 2); // 2
        assert_eq!(lexer.next().unwrap().line, 2); // delim
        assert_eq!(lexer.next().unwrap().line, 3); // 3
    }

    #[test]
    fn unexpected_character() {
        let e = lex_err("#");
        assert!(e.message.contains("unexpected character"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn identifiers_round_trip(name in "[a-z][a-z0-9_]{0,12}") {
                // Skip names that collide with keywords.
                prop_assume!(!matches!(
                    name.as_str(),
                    "def" | "set" | "sig" | "if" | "else" | "do" | "for"
                        | "when" | "in" | "true" | "false" | "nil" | "udf"
                ));
                let toks = lex_all(&name);
                prop_assert_eq!(toks, vec![Token::Ident(name), Token::End]);
            }

            #[test]
            fn integers_round_trip(n in 0i64..=i64::MAX) {
                let toks = lex_all(&n.to_string());
                prop_assert_eq!(toks, vec![Token::Int(n), Token::End]);
            }

            #[test]
            fn string_bodies_round_trip(body in "[a-zA-Z0-9 ]{0,20}") {
                let toks = lex_all(&format!("\"{body}\""));
                prop_assert_eq!(toks, vec![Token::Str(body), Token::End]);
            }
        }
    }
}
