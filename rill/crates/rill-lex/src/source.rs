//! Character sources.
//!
//! A [`Source`] is the minimal pull interface the lexer reads from: a
//! name for error reporting and a `next_char` that yields `None` at
//! end of input.  Hosts can implement it over sockets, editors, or
//! anything else; the two concrete forms here cover the common cases
//! of in-memory text and files.

use std::fs;
use std::io;
use std::path::Path;

/// A pull-style character stream with a name.
pub trait Source {
    /// The unit name used in diagnostics and stack traces
    /// (a file path, `"<input>"`, etc).
    fn name(&self) -> &str;

    /// The next character, or `None` at end of input.
    fn next_char(&mut self) -> Option<char>;
}

/// A source over an in-memory string.
pub struct StrSource {
    name: String,
    text: String,
    pos: usize,
}

impl StrSource {
    /// Create a source over `text`, reported under `name`.
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            pos: 0,
        }
    }
}

impl Source for StrSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.text[self.pos..].chars().next()?;
        self.pos += c.len_utf8();
        Some(c)
    }
}

/// A source over a file's contents.
///
/// The file is read eagerly; script files are small and this keeps
/// the lexer free of incremental UTF-8 decoding.
pub struct FileSource {
    inner: StrSource,
}

impl FileSource {
    /// Open `path` and report it under its display name.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Ok(Self {
            inner: StrSource::new(path.display().to_string(), text),
        })
    }
}

impl Source for FileSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn next_char(&mut self) -> Option<char> {
        self.inner.next_char()
    }
}
