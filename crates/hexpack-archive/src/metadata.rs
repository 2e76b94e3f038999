//! Canonical term encoding for package metadata.
//!
//! Metadata travels as a sequence of term records, one per top-level key,
//! rendered in UTF-8 and terminated with `.`:
//!
//! ```text
//! {<<"app">>,<<"demo">>}.
//! {<<"version">>,<<"1.0.0">>}.
//! ```
//!
//! The value grammar is the subset actually used by package metadata: atoms,
//! binary strings, integers, lists, tuples and key-sorted maps. The renderer
//! is deterministic (records and map entries are emitted in sorted key
//! order), so rendering the same metadata always yields identical bytes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{ArchiveError, ArchiveResult};

/// A term value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A bare word, e.g. `mix`.
    Atom(String),
    /// A UTF-8 binary string, e.g. `<<"demo">>`.
    Binary(String),
    /// A signed integer.
    Int(i64),
    /// A list of terms.
    List(Vec<Term>),
    /// A tuple of terms. Metadata records are 2-tuples.
    Tuple(Vec<Term>),
    /// A map with binary-string keys, rendered in sorted key order.
    Map(BTreeMap<String, Term>),
}

impl Term {
    /// Convenience constructor for a binary string.
    pub fn binary(text: impl Into<String>) -> Term {
        Term::Binary(text.into())
    }

    /// Convenience constructor for an atom.
    pub fn atom(text: impl Into<String>) -> Term {
        Term::Atom(text.into())
    }

    /// The binary-string payload, if this term is one.
    pub fn as_binary(&self) -> Option<&str> {
        match self {
            Term::Binary(text) => Some(text),
            _ => None,
        }
    }
}

/// Package metadata: top-level keys mapped to term values.
///
/// `BTreeMap` keeps keys sorted, which is the canonical record order.
pub type Metadata = BTreeMap<String, Term>;

/// Render metadata as canonical term records.
pub fn render_metadata(metadata: &Metadata) -> String {
    let mut out = String::new();
    for (key, value) in metadata {
        render_term(&mut out, &Term::Tuple(vec![Term::binary(key), value.clone()]));
        out.push_str(".\n");
    }
    out
}

fn render_term(out: &mut String, term: &Term) {
    match term {
        Term::Atom(name) => render_atom(out, name),
        Term::Binary(text) => {
            out.push_str("<<\"");
            render_escaped(out, text);
            out.push_str("\">>");
        }
        Term::Int(value) => {
            let _ = write!(out, "{}", value);
        }
        Term::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_term(out, item);
            }
            out.push(']');
        }
        Term::Tuple(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_term(out, item);
            }
            out.push('}');
        }
        Term::Map(entries) => {
            out.push_str("#{");
            for (i, (key, value)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str("<<\"");
                render_escaped(out, key);
                out.push_str("\">> => ");
                render_term(out, value);
            }
            out.push('}');
        }
    }
}

fn render_atom(out: &mut String, name: &str) {
    let bare = !name.is_empty()
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@');
    if bare {
        out.push_str(name);
    } else {
        out.push('\'');
        render_escaped(out, name);
        out.push('\'');
    }
}

fn render_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
}

/// Parse canonical term records back into metadata.
///
/// Accepts exactly the subset the renderer emits. Every record must be a
/// 2-tuple whose first element is a binary-string key.
pub fn parse_metadata(text: &str) -> ArchiveResult<Metadata> {
    let mut metadata = Metadata::new();
    for term in parse_records(text)? {
        match term {
            Term::Tuple(items) if items.len() == 2 => {
                let mut items = items.into_iter();
                let key = items.next().expect("len checked");
                let value = items.next().expect("len checked");
                match key {
                    Term::Binary(key) => {
                        metadata.insert(key, value);
                    }
                    other => {
                        return Err(invalid(format!(
                            "record key must be a binary string, got {:?}",
                            other
                        )))
                    }
                }
            }
            other => {
                return Err(invalid(format!(
                    "metadata record must be a 2-tuple, got {:?}",
                    other
                )))
            }
        }
    }
    Ok(metadata)
}

/// Parse a sequence of `.`-terminated term records.
pub fn parse_records(text: &str) -> ArchiveResult<Vec<Term>> {
    let mut parser = Parser::new(text);
    let mut records = Vec::new();
    loop {
        parser.skip_whitespace();
        if parser.at_end() {
            return Ok(records);
        }
        let term = parser.term()?;
        parser.skip_whitespace();
        parser.expect('.')?;
        records.push(term);
    }
}

fn invalid(message: impl Into<String>) -> ArchiveError {
    ArchiveError::InvalidMetadata {
        message: message.into(),
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, expected: char) -> ArchiveResult<()> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(invalid(format!("expected {:?}, found {:?}", expected, c))),
            None => Err(invalid(format!("expected {:?}, found end of input", expected))),
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn term(&mut self) -> ArchiveResult<Term> {
        self.skip_whitespace();
        match self.peek() {
            Some('<') => self.binary(),
            Some('[') => self.list(),
            Some('{') => self.tuple(),
            Some('#') => self.map(),
            Some('\'') => self.quoted_atom(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.integer(),
            Some(c) if c.is_ascii_lowercase() => self.bare_atom(),
            Some(c) => Err(invalid(format!("unexpected character {:?}", c))),
            None => Err(invalid("unexpected end of input")),
        }
    }

    fn binary(&mut self) -> ArchiveResult<Term> {
        if !self.eat("<<\"") {
            return Err(invalid("expected binary string"));
        }
        let text = self.escaped_until('"')?;
        if !self.eat(">>") {
            return Err(invalid("unterminated binary string"));
        }
        Ok(Term::Binary(text))
    }

    fn quoted_atom(&mut self) -> ArchiveResult<Term> {
        self.expect('\'')?;
        let text = self.escaped_until('\'')?;
        Ok(Term::Atom(text))
    }

    fn escaped_until(&mut self, close: char) -> ArchiveResult<String> {
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(c) if c == close => return Ok(text),
                Some('\\') => match self.bump() {
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some('\'') => text.push('\''),
                    Some('n') => text.push('\n'),
                    Some('r') => text.push('\r'),
                    Some('t') => text.push('\t'),
                    Some(c) => return Err(invalid(format!("unknown escape \\{}", c))),
                    None => return Err(invalid("unterminated escape")),
                },
                Some(c) => text.push(c),
                None => return Err(invalid("unterminated string")),
            }
        }
    }

    fn integer(&mut self) -> ArchiveResult<Term> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        let text = &self.input[start..self.pos];
        text.parse()
            .map(Term::Int)
            .map_err(|_| invalid(format!("invalid integer {:?}", text)))
    }

    fn bare_atom(&mut self) -> ArchiveResult<Term> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '@'
        ) {
            self.bump();
        }
        Ok(Term::Atom(self.input[start..self.pos].to_string()))
    }

    fn list(&mut self) -> ArchiveResult<Term> {
        self.expect('[')?;
        let items = self.comma_separated(']')?;
        Ok(Term::List(items))
    }

    fn tuple(&mut self) -> ArchiveResult<Term> {
        self.expect('{')?;
        let items = self.comma_separated('}')?;
        Ok(Term::Tuple(items))
    }

    fn comma_separated(&mut self, close: char) -> ArchiveResult<Vec<Term>> {
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(close) {
            self.bump();
            return Ok(items);
        }
        loop {
            items.push(self.term()?);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(items),
                Some(c) => return Err(invalid(format!("expected ',' or {:?}, found {:?}", close, c))),
                None => return Err(invalid("unterminated collection")),
            }
        }
    }

    fn map(&mut self) -> ArchiveResult<Term> {
        if !self.eat("#{") {
            return Err(invalid("expected map"));
        }
        let mut entries = BTreeMap::new();
        self.skip_whitespace();
        if self.peek() == Some('}') {
            self.bump();
            return Ok(Term::Map(entries));
        }
        loop {
            self.skip_whitespace();
            let key = match self.binary()? {
                Term::Binary(key) => key,
                _ => unreachable!("binary() only returns Term::Binary"),
            };
            self.skip_whitespace();
            if !self.eat("=>") {
                return Err(invalid("expected '=>' in map entry"));
            }
            let value = self.term()?;
            entries.insert(key, value);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Term::Map(entries)),
                Some(c) => return Err(invalid(format!("expected ',' or '}}', found {:?}", c))),
                None => return Err(invalid("unterminated map")),
            }
        }
    }
}
