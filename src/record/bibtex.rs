//! Minimal BibTeX reader and writer.
//!
//! Reads `@type{key, field = value, ...}` entries with brace, quote, number
//! and macro values (joined with `#`). `@string` definitions are expanded,
//! `@comment` and `@preamble` blocks are skipped. Whitespace runs inside
//! values collapse to a single space so a parse/render cycle is stable.
//!
//! `render` relies on `Record` only admitting keys, names and values that
//! this reader accepts back.

use std::collections::HashMap;

use thiserror::Error;

use super::entry::{normalize_value, Record, RecordError, DEFAULT_ENTRY_TYPE, ENTRYTYPE_FIELD, ID_FIELD};

/// Month abbreviations every BibTeX style predefines.
const MONTHS: &[(&str, &str)] = &[
    ("jan", "January"),
    ("feb", "February"),
    ("mar", "March"),
    ("apr", "April"),
    ("may", "May"),
    ("jun", "June"),
    ("jul", "July"),
    ("aug", "August"),
    ("sep", "September"),
    ("oct", "October"),
    ("nov", "November"),
    ("dec", "December"),
];

/// BibTeX parse errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BibtexError {
    #[error("line {line}: expected '{expected}', found {found}")]
    Expected {
        line: usize,
        expected: char,
        found: String,
    },

    #[error("line {line}: unexpected end of input")]
    UnexpectedEof { line: usize },

    #[error("line {line}: entry has no citation key")]
    MissingKey { line: usize },

    #[error("line {line}: invalid record: {source}")]
    InvalidRecord { line: usize, source: RecordError },
}

pub type Result<T> = std::result::Result<T, BibtexError>;

/// Parse a whole bibliography file.
pub fn parse(input: &str) -> Result<Vec<Record>> {
    Parser::new(input).entries()
}

/// Render one record as a BibTeX entry (with trailing newline).
pub fn render(record: &Record) -> String {
    let entry_type = record.entry_type().unwrap_or(DEFAULT_ENTRY_TYPE);
    let body = record
        .fields()
        .filter(|(name, _)| *name != ID_FIELD && *name != ENTRYTYPE_FIELD)
        .map(|(name, value)| format!(" {} = {{{}}}", name, value))
        .collect::<Vec<_>>();

    if body.is_empty() {
        format!("@{}{{{}\n}}\n", entry_type, record.id())
    } else {
        format!("@{}{{{},\n{}\n}}\n", entry_type, record.id(), body.join(",\n"))
    }
}

/// Render a list of records separated by blank lines.
pub fn render_all<'a>(records: impl IntoIterator<Item = &'a Record>) -> String {
    records.into_iter().map(render).collect::<Vec<_>>().join("\n")
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    strings: HashMap<String, String>,
}

impl Parser {
    fn new(input: &str) -> Self {
        let strings = MONTHS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            chars: input.chars().collect(),
            pos: 0,
            line: 1,
            strings,
        }
    }

    fn entries(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();

        while self.skip_to_at() {
            self.bump();
            let kind = self.identifier().to_lowercase();
            self.skip_ws();

            match kind.as_str() {
                "comment" => self.skip_block()?,
                "preamble" => self.skip_block()?,
                "string" => self.string_definition()?,
                _ => records.push(self.entry(kind)?),
            }
        }

        Ok(records)
    }

    fn entry(&mut self, entry_type: String) -> Result<Record> {
        let start_line = self.line;
        let close = self.open_delimiter()?;
        self.skip_ws();

        let key = self.take_while(|c| c != ',' && c != close && !c.is_whitespace());
        if key.is_empty() {
            return Err(BibtexError::MissingKey { line: start_line });
        }

        let mut fields = vec![
            (ID_FIELD.to_string(), key),
            (ENTRYTYPE_FIELD.to_string(), entry_type),
        ];

        loop {
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(c) if c == close => {
                    self.bump();
                    break;
                }
                Some(_) => {
                    let (name, value) = self.field()?;
                    fields.push((name, value));
                }
                None => return Err(BibtexError::UnexpectedEof { line: self.line }),
            }
        }

        Record::from_fields(fields).map_err(|source| BibtexError::InvalidRecord {
            line: start_line,
            source,
        })
    }

    fn field(&mut self) -> Result<(String, String)> {
        let name = self.identifier();
        if name.is_empty() {
            return Err(self.expected('='));
        }
        self.skip_ws();
        if self.peek() != Some('=') {
            return Err(self.expected('='));
        }
        self.bump();
        let value = self.value()?;
        Ok((name, value))
    }

    fn string_definition(&mut self) -> Result<()> {
        let close = self.open_delimiter()?;
        self.skip_ws();
        let (name, value) = self.field()?;
        self.skip_ws();
        if self.peek() != Some(close) {
            return Err(self.expected(close));
        }
        self.bump();
        self.strings.insert(name.to_lowercase(), value);
        Ok(())
    }

    fn value(&mut self) -> Result<String> {
        let mut out = String::new();

        loop {
            self.skip_ws();
            match self.peek() {
                Some('{') => {
                    self.bump();
                    out.push_str(&self.braced()?);
                }
                Some('"') => {
                    self.bump();
                    out.push_str(&self.quoted()?);
                }
                Some(c) if c.is_ascii_digit() => {
                    out.push_str(&self.take_while(|c| c.is_ascii_digit()));
                }
                Some(_) => {
                    let name = self.identifier();
                    if name.is_empty() {
                        return Err(self.expected('{'));
                    }
                    let expanded = self
                        .strings
                        .get(&name.to_lowercase())
                        .cloned()
                        .unwrap_or(name);
                    out.push_str(&expanded);
                }
                None => return Err(BibtexError::UnexpectedEof { line: self.line }),
            }

            self.skip_ws();
            if self.peek() == Some('#') {
                self.bump();
            } else {
                break;
            }
        }

        Ok(normalize_value(&out))
    }

    /// Content of a `{...}` group; the opening brace is already consumed.
    fn braced(&mut self) -> Result<String> {
        let mut depth = 1usize;
        let mut out = String::new();

        while let Some(c) = self.bump() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                }
                _ => {}
            }
            out.push(c);
        }

        Err(BibtexError::UnexpectedEof { line: self.line })
    }

    /// Content of a `"..."` value; the opening quote is already consumed.
    fn quoted(&mut self) -> Result<String> {
        let mut depth = 0usize;
        let mut out = String::new();

        while let Some(c) = self.bump() {
            match c {
                '"' if depth == 0 => return Ok(out),
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                _ => {}
            }
            out.push(c);
        }

        Err(BibtexError::UnexpectedEof { line: self.line })
    }

    fn skip_block(&mut self) -> Result<()> {
        match self.peek() {
            Some('{') => {
                self.bump();
                self.braced().map(|_| ())
            }
            Some('(') => {
                self.bump();
                self.take_while(|c| c != ')');
                self.bump().map(|_| ()).ok_or(BibtexError::UnexpectedEof { line: self.line })
            }
            // `@comment` without a block comments out the rest of the line.
            _ => {
                self.take_while(|c| c != '\n');
                Ok(())
            }
        }
    }

    fn open_delimiter(&mut self) -> Result<char> {
        match self.bump() {
            Some('{') => Ok('}'),
            Some('(') => Ok(')'),
            Some(c) => Err(BibtexError::Expected {
                line: self.line,
                expected: '{',
                found: format!("'{}'", c),
            }),
            None => Err(BibtexError::UnexpectedEof { line: self.line }),
        }
    }

    fn identifier(&mut self) -> String {
        self.take_while(|c| c.is_alphanumeric() || "_-:.+/'".contains(c))
    }

    fn skip_to_at(&mut self) -> bool {
        self.take_while(|c| c != '@');
        self.peek().is_some()
    }

    fn skip_ws(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn expected(&self, expected: char) -> BibtexError {
        match self.peek() {
            Some(c) => BibtexError::Expected {
                line: self.line,
                expected,
                found: format!("'{}'", c),
            },
            None => BibtexError::UnexpectedEof { line: self.line },
        }
    }
}
