//! rill-lex - Tokenizer for the Rill language.
//!
//! This crate turns a pull-style character [`Source`] into the token
//! stream the single-pass compiler consumes.  It is deliberately
//! independent of the runtime: tokens carry plain Rust values
//! (`String` payloads for identifiers and literals), and the compiler
//! interns them into the owning language instance as it goes.
//!
//! # Token shape
//!
//! The surface language is expression-oriented and small:
//!
//! ```text
//! delimiters    ,  newline
//! punctuation   : ( ) [ ] { }
//! keywords      def set sig if else do for when in
//! constants     udf nil true false  123  1_000  2.5  'sym'  "str"
//! operators     . @ ...  + - ! ~ ^ * / %  << >>  & \ |  &? |? !?
//!               = ~= != < > <= >=
//! comments      `inline`   `|block|`
//! block forms   '|symbol with ' inside|'   "|string with " inside|"
//! ```
//!
//! Newlines are ordinary expression delimiters, interchangeable with
//! commas; the lexer never treats layout specially beyond that.
//!
//! # Errors
//!
//! Lexical errors ([`LexError`]) carry the 1-based line they occurred
//! on; the compiler maps them into its own diagnostic kind.

pub mod lexer;
pub mod source;
pub mod token;

pub use lexer::{LexError, Lexed, Lexer};
pub use source::{FileSource, Source, StrSource};
pub use token::Token;
