//! Length-prefixed serialization format used by the application to store
//! structured values in text columns (`s:5:"hello";`, `a:1:{...}`, ...).
//!
//! String lengths are byte lengths, so any replacement inside a structured
//! value must re-encode it rather than patch the text in place.

use std::fmt;

/// Containers and strings-holding-values nested deeper than this are not
/// decoded. Parsing and rewriting recurse once per level.
pub const MAX_DEPTH: usize = 512;

const TOO_DEEP: &str = "nesting too deep";

#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Kept as written so re-encoding does not change precision.
    Float(String),
    Str(Vec<u8>),
    Array(Vec<(SerializedValue, SerializedValue)>),
    Object {
        class: Vec<u8>,
        fields: Vec<(SerializedValue, SerializedValue)>,
    },
    /// `C:` custom-serialized object; the payload is opaque.
    Custom { class: Vec<u8>, payload: Vec<u8> },
    /// `r:` or `R:` back-reference.
    Reference { strong: bool, index: i64 },
    /// `E:` enum case.
    Enum(Vec<u8>),
}

/// Result of looking at a stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    PlainText,
    Structured(SerializedValue),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub offset: usize,
    pub reason: &'static str,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.reason, self.offset)
    }
}

impl std::error::Error for DecodeError {}

/// Structured only when the whole input is exactly one serialized value.
pub fn decode(input: &[u8]) -> Decoded {
    match parse(input) {
        Ok(value) => Decoded::Structured(value),
        Err(_) => Decoded::PlainText,
    }
}

pub fn parse(input: &[u8]) -> Result<SerializedValue, DecodeError> {
    parse_within(input, MAX_DEPTH)
}

fn parse_within(input: &[u8], depth_left: usize) -> Result<SerializedValue, DecodeError> {
    let mut parser = Parser {
        input,
        pos: 0,
        depth_left,
    };
    let value = parser.value()?;
    if parser.pos != input.len() {
        return Err(parser.error("trailing data"));
    }
    Ok(value)
}

pub fn encode(value: &SerializedValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value);
    out
}

/// Replace `from` with `to` in `input`, serialization-aware.
///
/// Returns `None` when nothing changed, so callers can leave the stored
/// bytes untouched. A value nested past [`MAX_DEPTH`] is also left as is:
/// a textual rewrite would break its length prefixes.
pub fn replace_in(input: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    replace_within(input, from, to, MAX_DEPTH)
}

fn replace_within(input: &[u8], from: &[u8], to: &[u8], depth_left: usize) -> Option<Vec<u8>> {
    if from.is_empty() {
        return None;
    }
    match parse_within(input, depth_left) {
        Ok(mut value) => {
            if value.replace_nested(from, to, depth_left) {
                Some(encode(&value))
            } else {
                None
            }
        }
        Err(e) if e.reason == TOO_DEEP => {
            tracing::warn!("Leaving serialized value unchanged: {}", e);
            None
        }
        Err(_) => replace_bytes(input, from, to),
    }
}

impl SerializedValue {
    /// Rewrite every string value in place. Array keys are left alone.
    pub fn replace(&mut self, from: &[u8], to: &[u8]) -> bool {
        self.replace_nested(from, to, MAX_DEPTH)
    }

    fn replace_nested(&mut self, from: &[u8], to: &[u8], depth_left: usize) -> bool {
        match self {
            SerializedValue::Str(bytes) => {
                let replaced = match depth_left.checked_sub(1) {
                    Some(inner_depth) => replace_within(bytes, from, to, inner_depth),
                    // a string holding yet another serialized value stays as is
                    None => match parse_within(bytes, 0) {
                        Ok(_) => None,
                        Err(e) if e.reason == TOO_DEEP => None,
                        Err(_) => replace_bytes(bytes, from, to),
                    },
                };
                match replaced {
                    Some(new) => {
                        *bytes = new;
                        true
                    }
                    None => false,
                }
            }
            SerializedValue::Array(entries) | SerializedValue::Object { fields: entries, .. } => {
                let Some(inner_depth) = depth_left.checked_sub(1) else {
                    return false;
                };
                let mut changed = false;
                for (_, value) in entries.iter_mut() {
                    changed |= value.replace_nested(from, to, inner_depth);
                }
                changed
            }
            _ => false,
        }
    }
}

/// Plain substring replacement; `None` if `from` does not occur.
pub fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    if from.is_empty() || haystack.len() < from.len() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    let mut found = false;
    while i < haystack.len() {
        if haystack[i..].starts_with(from) {
            out.extend_from_slice(to);
            i += from.len();
            found = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    found.then_some(out)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth_left: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &'static str) -> DecodeError {
        DecodeError {
            offset: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), DecodeError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error("unexpected byte"))
        }
    }

    /// Bytes up to (not including) `end`, consuming `end`.
    fn until(&mut self, end: u8) -> Result<&'a [u8], DecodeError> {
        let start = self.pos;
        let rest = &self.input[start..];
        let len = rest
            .iter()
            .position(|&b| b == end)
            .ok_or_else(|| self.error("unterminated token"))?;
        self.pos = start + len + 1;
        Ok(&rest[..len])
    }

    fn integer(&mut self, end: u8) -> Result<i64, DecodeError> {
        let raw = self.until(end)?;
        let text = std::str::from_utf8(raw).map_err(|_| self.error("bad integer"))?;
        let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(self.error("bad integer"));
        }
        text.parse().map_err(|_| self.error("integer out of range"))
    }

    fn length(&mut self, end: u8) -> Result<usize, DecodeError> {
        let n = self.integer(end)?;
        usize::try_from(n).map_err(|_| self.error("negative length"))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.input.len())
            .ok_or_else(|| self.error("length past end of input"))?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// `<len>:"<bytes>"`
    fn quoted(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.length(b':')?;
        self.expect(b'"')?;
        let bytes = self.take(len)?.to_vec();
        self.expect(b'"')?;
        Ok(bytes)
    }

    fn entries(&mut self, count: usize) -> Result<Vec<(SerializedValue, SerializedValue)>, DecodeError> {
        self.expect(b'{')?;
        if self.depth_left == 0 {
            return Err(self.error(TOO_DEEP));
        }
        self.depth_left -= 1;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = self.value()?;
            if !matches!(key, SerializedValue::Int(_) | SerializedValue::Str(_)) {
                return Err(self.error("invalid key"));
            }
            let value = self.value()?;
            entries.push((key, value));
        }
        self.expect(b'}')?;
        self.depth_left += 1;
        Ok(entries)
    }

    fn value(&mut self) -> Result<SerializedValue, DecodeError> {
        let tag = self.peek().ok_or_else(|| self.error("empty input"))?;
        self.pos += 1;
        if tag == b'N' {
            self.expect(b';')?;
            return Ok(SerializedValue::Null);
        }
        self.expect(b':')?;

        match tag {
            b'b' => match self.until(b';')? {
                b"0" => Ok(SerializedValue::Bool(false)),
                b"1" => Ok(SerializedValue::Bool(true)),
                _ => Err(self.error("bad boolean")),
            },
            b'i' => Ok(SerializedValue::Int(self.integer(b';')?)),
            b'd' => {
                let raw = self.until(b';')?;
                let text = std::str::from_utf8(raw).map_err(|_| self.error("bad float"))?;
                let valid = matches!(text, "INF" | "-INF" | "NAN") || text.parse::<f64>().is_ok();
                if !valid {
                    return Err(self.error("bad float"));
                }
                Ok(SerializedValue::Float(text.to_string()))
            }
            b's' => {
                let bytes = self.quoted()?;
                self.expect(b';')?;
                Ok(SerializedValue::Str(bytes))
            }
            b'a' => {
                let count = self.length(b':')?;
                Ok(SerializedValue::Array(self.entries(count)?))
            }
            b'O' => {
                let class = self.quoted()?;
                self.expect(b':')?;
                let count = self.length(b':')?;
                let fields = self.entries(count)?;
                Ok(SerializedValue::Object { class, fields })
            }
            b'C' => {
                let class = self.quoted()?;
                self.expect(b':')?;
                let len = self.length(b':')?;
                self.expect(b'{')?;
                let payload = self.take(len)?.to_vec();
                self.expect(b'}')?;
                Ok(SerializedValue::Custom { class, payload })
            }
            b'r' | b'R' => Ok(SerializedValue::Reference {
                strong: tag == b'R',
                index: self.integer(b';')?,
            }),
            b'E' => {
                let bytes = self.quoted()?;
                self.expect(b';')?;
                Ok(SerializedValue::Enum(bytes))
            }
            _ => Err(self.error("unknown type tag")),
        }
    }
}

fn write_quoted(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.extend_from_slice(b":\"");
    out.extend_from_slice(bytes);
    out.push(b'"');
}

fn write_entries(out: &mut Vec<u8>, entries: &[(SerializedValue, SerializedValue)]) {
    out.extend_from_slice(entries.len().to_string().as_bytes());
    out.extend_from_slice(b":{");
    for (key, value) in entries {
        write_value(out, key);
        write_value(out, value);
    }
    out.push(b'}');
}

fn write_value(out: &mut Vec<u8>, value: &SerializedValue) {
    match value {
        SerializedValue::Null => out.extend_from_slice(b"N;"),
        SerializedValue::Bool(b) => out.extend_from_slice(if *b { b"b:1;" } else { b"b:0;" }),
        SerializedValue::Int(i) => {
            out.extend_from_slice(b"i:");
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b';');
        }
        SerializedValue::Float(raw) => {
            out.extend_from_slice(b"d:");
            out.extend_from_slice(raw.as_bytes());
            out.push(b';');
        }
        SerializedValue::Str(bytes) => {
            out.extend_from_slice(b"s:");
            write_quoted(out, bytes);
            out.push(b';');
        }
        SerializedValue::Array(entries) => {
            out.extend_from_slice(b"a:");
            write_entries(out, entries);
        }
        SerializedValue::Object { class, fields } => {
            out.extend_from_slice(b"O:");
            write_quoted(out, class);
            out.push(b':');
            write_entries(out, fields);
        }
        SerializedValue::Custom { class, payload } => {
            out.extend_from_slice(b"C:");
            write_quoted(out, class);
            out.push(b':');
            out.extend_from_slice(payload.len().to_string().as_bytes());
            out.extend_from_slice(b":{");
            out.extend_from_slice(payload);
            out.push(b'}');
        }
        SerializedValue::Reference { strong, index } => {
            out.extend_from_slice(if *strong { b"R:" } else { b"r:" });
            out.extend_from_slice(index.to_string().as_bytes());
            out.push(b';');
        }
        SerializedValue::Enum(bytes) => {
            out.extend_from_slice(b"E:");
            write_quoted(out, bytes);
            out.push(b';');
        }
    }
}
