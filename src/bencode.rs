//! Codec for the bencoded wire format.
//!
//! Bencoding carries four shapes: integers `i42e`, byte strings `4:spam`,
//! lists `l...e` and dictionaries `d...e`. Torrent files, tracker responses
//! and the extension protocol all speak it.
//!
//! Dictionaries decode into a [`BTreeMap`] keyed by raw bytes, so re-encoding
//! always emits keys in lexicographic byte order. This is what makes
//! `encode(decode(x)) == x` hold for canonical inputs, and what allows an
//! info dictionary to be re-encoded without changing its SHA-1.
//!
//! The parser reports [`ParseError`]s carrying the byte offset of the
//! offending input, and [`dict_raw_entry`] exposes the exact source slice of
//! a top-level dictionary value, which callers use to hash the `info` value
//! as it appeared on disk.

use std::collections::BTreeMap;

use thiserror::Error;

pub type Dict = BTreeMap<Vec<u8>, Value>;

/// A single bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_utf8(&self) -> Option<&str> {
        self.as_str().and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Shorthand for string lookups on a dictionary value.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Str(v)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),
    #[error("invalid integer")]
    InvalidInt,
    #[error("invalid string length")]
    InvalidLength,
    #[error("dictionary key is not a byte string")]
    KeyNotString,
    #[error("trailing bytes after value")]
    TrailingBytes,
}

/// A bencode parse failure, pointing at the byte it happened on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bencode: {kind} at byte offset {offset}")]
pub struct ParseError {
    pub kind: ErrorKind,
    pub offset: usize,
}

/// Decode a complete bencoded buffer into a [`Value`].
///
/// The entire buffer must be consumed; trailing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Value, ParseError> {
    let mut parser = Parser::new(buf);
    let value = parser.parse_value()?;
    if parser.pos() != buf.len() {
        return Err(parser.err(ErrorKind::TrailingBytes));
    }
    Ok(value)
}

/// Encode a [`Value`] into its canonical bencoded form.
///
/// Dictionary keys come out in lexicographic byte order, which the map
/// ordering already guarantees.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(v) => {
            out.push(b'i');
            out.extend_from_slice(v.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Str(v) => {
            out.extend_from_slice(v.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(v);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, val) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Return the raw source slice of the value stored under `key` in a
/// top-level dictionary, without building the value tree.
///
/// The metainfo parser hashes the returned slice to produce the info_hash,
/// so the bytes must be exactly as they appear in `buf`.
pub fn dict_raw_entry<'a>(
    buf: &'a [u8],
    key: &[u8],
) -> Result<Option<&'a [u8]>, ParseError> {
    let mut parser = Parser::new(buf);
    parser.expect(b'd')?;

    loop {
        if parser.peek()? == b'e' {
            return Ok(None);
        }
        let entry_key = parser.parse_raw_str()?;
        let start = parser.pos();
        parser.skip_value()?;
        if entry_key == key {
            return Ok(Some(&buf[start..parser.pos()]));
        }
    }
}

/// Incremental bencode parser over a borrowed buffer.
///
/// [`Parser::pos`] is the cursor into the source, which doubles as the
/// payload boundary for formats that append raw bytes after a bencoded
/// header (the metadata extension does this).
pub struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn err(&self, kind: ErrorKind) -> ParseError {
        ParseError { kind, offset: self.pos }
    }

    fn peek(&self) -> Result<u8, ParseError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(self.err(ErrorKind::UnexpectedEof))
    }

    fn bump(&mut self) -> Result<u8, ParseError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        let b = self.peek()?;
        if b != byte {
            return Err(self.err(ErrorKind::UnexpectedByte(b)));
        }
        self.pos += 1;
        Ok(())
    }

    /// Parse the next complete value at the cursor.
    pub fn parse_value(&mut self) -> Result<Value, ParseError> {
        match self.peek()? {
            b'i' => self.parse_int().map(Value::Int),
            b'0'..=b'9' => self.parse_raw_str().map(|s| Value::Str(s.to_vec())),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse_value()?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = Dict::new();
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(self.err(ErrorKind::KeyNotString));
                    }
                    let key = self.parse_raw_str()?.to_vec();
                    let value = self.parse_value()?;
                    // duplicate keys: last one wins
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            b => Err(self.err(ErrorKind::UnexpectedByte(b))),
        }
    }

    /// Advance past the next complete value without building it.
    pub fn skip_value(&mut self) -> Result<(), ParseError> {
        match self.peek()? {
            b'i' => {
                self.parse_int()?;
            }
            b'0'..=b'9' => {
                self.parse_raw_str()?;
            }
            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(self.err(ErrorKind::KeyNotString));
                    }
                    self.parse_raw_str()?;
                    self.skip_value()?;
                }
                self.pos += 1;
            }
            b => return Err(self.err(ErrorKind::UnexpectedByte(b))),
        }
        Ok(())
    }

    fn parse_int(&mut self) -> Result<i64, ParseError> {
        let start = self.pos;
        self.expect(b'i')?;

        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }

        let digits_start = self.pos;
        let mut value: i64 = 0;
        while self.peek()?.is_ascii_digit() {
            let digit = (self.bump()? - b'0') as i64;
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(digit))
                .ok_or(ParseError {
                    kind: ErrorKind::InvalidInt,
                    offset: start,
                })?;
        }

        let digits = self.pos - digits_start;
        let invalid = digits == 0
            // leading zeros, except for plain `i0e`
            || (digits > 1 && self.buf[digits_start] == b'0')
            // `i-0e` and `i-0...e`
            || (negative && self.buf[digits_start] == b'0');

        if invalid {
            return Err(ParseError { kind: ErrorKind::InvalidInt, offset: start });
        }

        self.expect(b'e')?;
        Ok(if negative { -value } else { value })
    }

    fn parse_raw_str(&mut self) -> Result<&'a [u8], ParseError> {
        let start = self.pos;

        let mut len: usize = 0;
        let mut digits = 0;
        while self.peek()?.is_ascii_digit() {
            let digit = (self.bump()? - b'0') as usize;
            len = len
                .checked_mul(10)
                .and_then(|v| v.checked_add(digit))
                .ok_or(ParseError {
                    kind: ErrorKind::InvalidLength,
                    offset: start,
                })?;
            digits += 1;
        }
        if digits == 0 || (digits > 1 && self.buf[start] == b'0') {
            return Err(ParseError {
                kind: ErrorKind::InvalidLength,
                offset: start,
            });
        }

        self.expect(b':')?;

        if self.buf.len() - self.pos < len {
            return Err(self.err(ErrorKind::UnexpectedEof));
        }
        let content = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(content)
    }
}
