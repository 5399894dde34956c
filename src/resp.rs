// https://redis.io/docs/reference/protocol-spec

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::Bytes;

static CRLF: &[u8; 2] = b"\r\n";

/// Parses a decimal integer the way the wire grammar demands: an optional
/// leading `-` followed by at least one ASCII digit, nothing else.
pub(crate) fn parse_int(b: &[u8]) -> Option<i64> {
    let (negative, digits) = match b.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, b),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n: i64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((d - b'0') as i64)?;
    }
    Some(if negative { -n } else { n })
}

// Appends a "$3\r\n" style prefix, with a fast path for single digits.
fn append_prefix(buf: &mut Vec<u8>, marker: u8, n: i64) {
    if (0..=9).contains(&n) {
        buf.extend_from_slice(&[marker, b'0' + n as u8, b'\r', b'\n']);
    } else {
        buf.push(marker);
        buf.extend_from_slice(n.to_string().as_bytes());
        buf.extend_from_slice(CRLF);
    }
}

// Simple strings and errors are single-line by construction; any embedded
// CR or LF becomes a space.
fn strip_newlines(s: &str) -> Cow<'_, str> {
    if s.contains(['\r', '\n']) {
        Cow::Owned(s.replace(['\r', '\n'], " "))
    } else {
        Cow::Borrowed(s)
    }
}

/// Appends a simple string (`+...\r\n`).
pub fn append_simple_string(buf: &mut Vec<u8>, s: &str) {
    buf.push(b'+');
    buf.extend_from_slice(strip_newlines(s).as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Appends an error (`-...\r\n`).
pub fn append_error(buf: &mut Vec<u8>, msg: &str) {
    buf.push(b'-');
    buf.extend_from_slice(strip_newlines(msg).as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Appends a signed integer (`:n\r\n`).
pub fn append_int(buf: &mut Vec<u8>, n: i64) {
    append_prefix(buf, b':', n);
}

/// Appends an unsigned integer (`:n\r\n`).
pub fn append_uint(buf: &mut Vec<u8>, n: u64) {
    buf.push(b':');
    buf.extend_from_slice(n.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Appends an array header (`*n\r\n`). The caller is expected to append
/// the declared number of elements afterwards.
pub fn append_array(buf: &mut Vec<u8>, count: i64) {
    append_prefix(buf, b'*', count);
}

/// Appends a bulk (`$len\r\n<bytes>\r\n`). The payload may carry any
/// binary content, including CR and LF.
pub fn append_bulk(buf: &mut Vec<u8>, bulk: &[u8]) {
    append_prefix(buf, b'$', bulk.len() as i64);
    buf.extend_from_slice(bulk);
    buf.extend_from_slice(CRLF);
}

/// Appends a bulk over the string's bytes.
pub fn append_bulk_string(buf: &mut Vec<u8>, bulk: &str) {
    append_bulk(buf, bulk.as_bytes());
}

/// Appends a signed integer rendered as a bulk.
pub fn append_bulk_int(buf: &mut Vec<u8>, n: i64) {
    append_bulk(buf, n.to_string().as_bytes());
}

/// Appends an unsigned integer rendered as a bulk.
pub fn append_bulk_uint(buf: &mut Vec<u8>, n: u64) {
    append_bulk(buf, n.to_string().as_bytes());
}

/// Appends a float rendered as a bulk.
pub fn append_bulk_float(buf: &mut Vec<u8>, f: f64) {
    append_bulk(buf, f.to_string().as_bytes());
}

/// Appends the RESP2 null bulk (`$-1\r\n`).
pub fn append_null(buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"$-1\r\n");
}

/// Appends `+OK\r\n`.
pub fn append_ok(buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"+OK\r\n");
}

/// Appends a message in the length-prefixed native dialect
/// (`$len <bytes>\r\n`).
pub fn append_native(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

/// A dynamically typed reply value, rendered by [`append_any`].
///
/// Scalars other than [`Value::SimpleString`] and [`Value::SimpleInt`]
/// render as bulks, so arbitrary content survives the trip.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    /// An error line. `"ERR "` is prefixed when the first word is not
    /// already an uppercase error code.
    Error(String),
    SimpleString(String),
    SimpleInt(i64),
    Bulk(Bytes),
    Str(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    /// Rendered as a bulk `"0"` or `"1"`.
    Bool(bool),
    Array(Vec<Value>),
    /// Rendered as an array of alternating keys and values.
    Map(Vec<(Value, Value)>),
}

/// Appends any [`Value`] in its RESP rendition.
pub fn append_any(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => append_null(buf),
        Value::Error(msg) => {
            let first = msg.split(' ').next().unwrap_or("");
            if first != first.to_uppercase() {
                append_error(buf, &format!("ERR {msg}"));
            } else {
                append_error(buf, msg);
            }
        }
        Value::SimpleString(s) => append_simple_string(buf, s),
        Value::SimpleInt(n) => append_int(buf, *n),
        Value::Bulk(b) => append_bulk(buf, b),
        Value::Str(s) => append_bulk_string(buf, s),
        Value::Int(n) => append_bulk_int(buf, *n),
        Value::Uint(n) => append_bulk_uint(buf, *n),
        Value::Float(f) => append_bulk_float(buf, *f),
        Value::Bool(b) => append_bulk(buf, if *b { b"1" } else { b"0" }),
        Value::Array(items) => {
            append_array(buf, items.len() as i64);
            for item in items {
                append_any(buf, item);
            }
        }
        Value::Map(pairs) => {
            append_array(buf, pairs.len() as i64 * 2);
            for (key, val) in pairs {
                append_any(buf, key);
                append_any(buf, val);
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Value {
        Value::Uint(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Value {
        Value::Bulk(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bulk(Bytes::from(b))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Value {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Value {
        Value::Array(items)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RespKind {
    SimpleString, // '+'
    Error,        // '-'
    Integer,      // ':'
    Bulk,         // '$'
    Array,        // '*'
}

/// A single RESP value borrowed from its source buffer.
///
/// `data` is the payload for scalars and the concatenated inner elements
/// for arrays; it is `None` for the null bulk and null array. `raw` is the
/// exact encoded form, and `count` the declared element count of an array.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Resp<'a> {
    pub kind: RespKind,
    pub count: usize,
    pub data: Option<&'a [u8]>,
    pub raw: &'a [u8],
}

/// Reads one RESP value from the front of `input`, returning the number of
/// bytes consumed alongside it. Returns `None` when the input is
/// incomplete or malformed.
pub fn read_next_resp(input: &[u8]) -> Option<(usize, Resp<'_>)> {
    let kind = match input.first()? {
        b'+' => RespKind::SimpleString,
        b'-' => RespKind::Error,
        b':' => RespKind::Integer,
        b'$' => RespKind::Bulk,
        b'*' => RespKind::Array,
        _ => return None,
    };
    let nl = input.iter().position(|&b| b == b'\n')?;
    if nl < 2 || input[nl - 1] != b'\r' {
        return None;
    }
    let line = &input[1..nl - 1];
    let header_len = nl + 1;
    match kind {
        RespKind::SimpleString | RespKind::Error => Some((
            header_len,
            Resp {
                kind,
                count: 0,
                data: Some(line),
                raw: &input[..header_len],
            },
        )),
        RespKind::Integer => {
            parse_int(line)?;
            Some((
                header_len,
                Resp {
                    kind,
                    count: 0,
                    data: Some(line),
                    raw: &input[..header_len],
                },
            ))
        }
        RespKind::Bulk => {
            let len = parse_int(line)?;
            if len < 0 {
                // Null bulk: the header is the whole value.
                return Some((
                    header_len,
                    Resp {
                        kind,
                        count: 0,
                        data: None,
                        raw: &input[..header_len],
                    },
                ));
            }
            let len = len as usize;
            let end = header_len.checked_add(len)?;
            if input.len() < end + 2 {
                return None;
            }
            if input[end] != b'\r' || input[end + 1] != b'\n' {
                return None;
            }
            Some((
                end + 2,
                Resp {
                    kind,
                    count: 0,
                    data: Some(&input[header_len..end]),
                    raw: &input[..end + 2],
                },
            ))
        }
        RespKind::Array => {
            let count = parse_int(line)?;
            if count < 0 {
                return Some((
                    header_len,
                    Resp {
                        kind,
                        count: 0,
                        data: None,
                        raw: &input[..header_len],
                    },
                ));
            }
            let mut pos = header_len;
            for _ in 0..count {
                let (n, _) = read_next_resp(&input[pos..])?;
                pos += n;
            }
            Some((
                pos,
                Resp {
                    kind,
                    count: count as usize,
                    data: Some(&input[header_len..pos]),
                    raw: &input[..pos],
                },
            ))
        }
    }
}

impl<'a> Resp<'a> {
    /// Iterates over the elements of an array value. Empty for scalars.
    pub fn iter(&self) -> RespIter<'a> {
        RespIter {
            data: self.data.unwrap_or_default(),
            remaining: self.count,
        }
    }

    /// Interprets an array as alternating key/value pairs. A trailing key
    /// without a value is dropped.
    pub fn map(&self) -> HashMap<String, Resp<'a>> {
        let mut out = HashMap::new();
        let mut items = self.iter();
        while let Some(key) = items.next() {
            let Some(val) = items.next() else { break };
            out.insert(key.as_str().into_owned(), val);
        }
        out
    }

    /// The payload as a string, lossily decoded.
    pub fn as_str(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.data.unwrap_or_default())
    }

    /// The payload as an integer, if it parses as one.
    pub fn to_int(&self) -> Option<i64> {
        parse_int(self.data?)
    }
}

pub struct RespIter<'a> {
    data: &'a [u8],
    remaining: usize,
}

impl<'a> Iterator for RespIter<'a> {
    type Item = Resp<'a>;

    fn next(&mut self) -> Option<Resp<'a>> {
        if self.remaining == 0 {
            return None;
        }
        let (n, resp) = read_next_resp(self.data)?;
        self.data = &self.data[n..];
        self.remaining -= 1;
        Some(resp)
    }
}
