use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::resp::{self, parse_int};
use crate::{Error, Result};

const INITIAL_BUF: usize = 4096;

/// Malformed input on the wire. The messages are part of the protocol
/// surface: clients receive them verbatim behind an `ERR` prefix.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ProtocolError {
    #[error("unbalanced quotes in request")]
    UnbalancedQuotes,
    #[error("invalid bulk length")]
    InvalidBulkLength,
    #[error("invalid multibulk length")]
    InvalidMultibulkLength,
    #[error("invalid message")]
    InvalidMessage,
    #[error("expected '$', got '{0}'")]
    ExpectedDollar(char),
}

/// One parsed client command.
///
/// `raw` holds the command's RESP encoding: the exact wire bytes for
/// RESP-sourced commands, or a re-encoding for telnet and native-dialect
/// commands. Each element of `args` is a slice of `raw`, with `args[0]`
/// the command name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub raw: Bytes,
    pub args: Vec<Bytes>,
}

// How one command was recognized in the scan buffer.
enum Source {
    // RESP multibulk: args live at these ranges of the consumed bytes.
    Resp { marks: Vec<(usize, usize)> },
    // Telnet or native dialect: the re-encoded RESP form with arg ranges.
    Rewritten { raw: Vec<u8>, marks: Vec<(usize, usize)> },
    // Consumed input that produces no command (blank telnet line).
    Blank,
}

struct RawCommand {
    consumed: usize,
    source: Source,
}

// Recognizes the dialect from the first byte and parses one command.
// Ok(None) means the buffer ends mid-command and nothing was consumed.
fn next_command(buf: &[u8]) -> std::result::Result<Option<RawCommand>, ProtocolError> {
    match buf.first() {
        None => Ok(None),
        Some(b'*') => next_resp_command(buf),
        Some(b'$') => next_native_command(buf),
        Some(_) => next_telnet_command(buf),
    }
}

fn next_resp_command(buf: &[u8]) -> std::result::Result<Option<RawCommand>, ProtocolError> {
    let Some(nl) = find_newline(buf, 1) else {
        return Ok(None);
    };
    if buf[nl - 1] != b'\r' {
        return Err(ProtocolError::InvalidMultibulkLength);
    }
    let count = parse_int(&buf[1..nl - 1]).ok_or(ProtocolError::InvalidMultibulkLength)?;
    if count < 0 {
        return Err(ProtocolError::InvalidMultibulkLength);
    }
    let mut pos = nl + 1;
    // The count is untrusted; capacity grows only as bulks actually parse.
    let mut marks = Vec::with_capacity(16.min(count as usize));
    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(None);
        }
        if buf[pos] != b'$' {
            return Err(ProtocolError::ExpectedDollar(buf[pos] as char));
        }
        let Some(lnl) = find_newline(buf, pos + 1) else {
            return Ok(None);
        };
        if buf[lnl - 1] != b'\r' {
            return Err(ProtocolError::InvalidBulkLength);
        }
        let size = parse_int(&buf[pos + 1..lnl - 1]).ok_or(ProtocolError::InvalidBulkLength)?;
        if size < 0 {
            return Err(ProtocolError::InvalidBulkLength);
        }
        let data_start = lnl + 1;
        let data_end = data_start + size as usize;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
            return Err(ProtocolError::InvalidBulkLength);
        }
        marks.push((data_start, data_end));
        pos = data_end + 2;
    }
    Ok(Some(RawCommand {
        consumed: pos,
        source: Source::Resp { marks },
    }))
}

fn next_native_command(buf: &[u8]) -> std::result::Result<Option<RawCommand>, ProtocolError> {
    let Some(sp) = buf[1..].iter().position(|&b| b == b' ') else {
        return Ok(None);
    };
    let sp = sp + 1;
    let size = parse_int(&buf[1..sp]).ok_or(ProtocolError::InvalidMessage)?;
    if size < 0 {
        return Err(ProtocolError::InvalidMessage);
    }
    let payload_start = sp + 1;
    let payload_end = payload_start + size as usize;
    if buf.len() < payload_end + 2 {
        return Ok(None);
    }
    if buf[payload_end] != b'\r' || buf[payload_end + 1] != b'\n' {
        return Err(ProtocolError::InvalidMessage);
    }
    let consumed = payload_end + 2;

    let mut line = &buf[payload_start..payload_end];
    let mut args: Vec<Vec<u8>> = Vec::new();
    'reading: while !line.is_empty() {
        if line[0] == b'{' {
            // The dialect has no JSON boundary of its own, so a JSON value
            // is assumed to run to the end of the payload.
            args.push(line.to_vec());
            break;
        }
        if line.len() >= 2 && line[0] == b'"' && line[line.len() - 1] == b'"' {
            // Domain-specific shim, not general quoting: quotes delimit a
            // string value only in `SET ... STRING "..."`.
            if !args.is_empty()
                && args[0].eq_ignore_ascii_case(b"set")
                && args[args.len() - 1].eq_ignore_ascii_case(b"string")
            {
                args.push(line[1..line.len() - 1].to_vec());
                break;
            }
        }
        for i in 0..line.len() {
            if line[i] == b' ' {
                if i > 0 {
                    args.push(line[..i].to_vec());
                }
                line = &line[i + 1..];
                continue 'reading;
            }
        }
        args.push(line.to_vec());
        break;
    }

    if args.is_empty() {
        return Ok(Some(RawCommand {
            consumed,
            source: Source::Blank,
        }));
    }
    let (raw, marks) = encode_args(&args);
    Ok(Some(RawCommand {
        consumed,
        source: Source::Rewritten { raw, marks },
    }))
}

fn next_telnet_command(buf: &[u8]) -> std::result::Result<Option<RawCommand>, ProtocolError> {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let line = if nl > 0 && buf[nl - 1] == b'\r' {
        &buf[..nl - 1]
    } else {
        &buf[..nl]
    };
    let args = split_telnet_line(line)?;
    let consumed = nl + 1;
    if args.is_empty() {
        return Ok(Some(RawCommand {
            consumed,
            source: Source::Blank,
        }));
    }
    let (raw, marks) = encode_args(&args);
    Ok(Some(RawCommand {
        consumed,
        source: Source::Rewritten { raw, marks },
    }))
}

// Splits a telnet line into arguments with shell-style quoting: `"` or `'`
// opens a quoted span only at argument start, backslash escapes expand
// n/r/t inside quotes, and a closing quote must be followed by a space or
// the end of the line.
fn split_telnet_line(line: &[u8]) -> std::result::Result<Vec<Vec<u8>>, ProtocolError> {
    let mut line = line;
    let mut args: Vec<Vec<u8>> = Vec::new();
    let mut quote = false;
    let mut quotech = 0u8;
    let mut escape = false;
    'outer: loop {
        let mut arg: Vec<u8> = Vec::with_capacity(line.len());
        let mut i = 0;
        while i < line.len() {
            let mut c = line[i];
            if !quote {
                if c == b' ' {
                    if !arg.is_empty() {
                        args.push(arg);
                    }
                    line = &line[i + 1..];
                    continue 'outer;
                }
                if c == b'"' || c == b'\'' {
                    if i != 0 {
                        return Err(ProtocolError::UnbalancedQuotes);
                    }
                    quotech = c;
                    quote = true;
                    line = &line[i + 1..];
                    continue 'outer;
                }
            } else if escape {
                escape = false;
                c = match c {
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    other => other,
                };
            } else if c == quotech {
                quote = false;
                quotech = 0;
                args.push(arg);
                line = &line[i + 1..];
                if !line.is_empty() && line[0] != b' ' {
                    return Err(ProtocolError::UnbalancedQuotes);
                }
                continue 'outer;
            } else if c == b'\\' {
                escape = true;
                i += 1;
                continue;
            }
            arg.push(c);
            i += 1;
        }
        if quote {
            return Err(ProtocolError::UnbalancedQuotes);
        }
        if !arg.is_empty() {
            args.push(arg);
        }
        break;
    }
    Ok(args)
}

// Re-encodes telnet/native arguments into RESP, recording where each
// argument's payload landed.
fn encode_args(args: &[Vec<u8>]) -> (Vec<u8>, Vec<(usize, usize)>) {
    let mut raw = Vec::new();
    let mut marks = Vec::with_capacity(args.len());
    resp::append_array(&mut raw, args.len() as i64);
    for arg in args {
        resp::append_bulk(&mut raw, arg);
        marks.push((raw.len() - 2 - arg.len(), raw.len() - 2));
    }
    (raw, marks)
}

fn find_newline(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == b'\n').map(|i| from + i)
}

// Builds the command for the stream reader: the raw bytes are copied out
// of the scan buffer so it can be reused, and args slice into the copy.
fn materialize_copied(window: &[u8], raw: RawCommand) -> Option<Command> {
    match raw.source {
        Source::Blank => None,
        Source::Resp { marks } => {
            let raw_bytes = Bytes::copy_from_slice(&window[..raw.consumed]);
            let args = marks.iter().map(|&(a, b)| raw_bytes.slice(a..b)).collect();
            Some(Command {
                raw: raw_bytes,
                args,
            })
        }
        Source::Rewritten { raw, marks } => {
            let raw_bytes = Bytes::from(raw);
            let args = marks.iter().map(|&(a, b)| raw_bytes.slice(a..b)).collect();
            Some(Command {
                raw: raw_bytes,
                args,
            })
        }
    }
}

/// Parses exactly one command from a caller-owned buffer.
///
/// Unlike the stream [`Reader`], which copies each command out of its
/// internal buffer, a RESP-sourced command returned here aliases the
/// caller's allocation when a [`Bytes`] is passed in.
///
/// Errors with [`Error::IncompleteCommand`] when the input ends
/// mid-command and [`Error::TooMuchData`] when bytes trail the first
/// command.
pub fn parse(raw: impl Into<Bytes>) -> Result<Command> {
    let src = raw.into();
    let mut pos = 0;
    let mut found: Option<Command> = None;
    while pos < src.len() {
        match next_command(&src[pos..])? {
            None => break,
            Some(raw_cmd) => {
                let consumed = raw_cmd.consumed;
                match raw_cmd.source {
                    Source::Blank => {}
                    _ if found.is_some() => return Err(Error::TooMuchData),
                    Source::Resp { marks } => {
                        let raw_bytes = src.slice(pos..pos + consumed);
                        let args = marks.iter().map(|&(a, b)| raw_bytes.slice(a..b)).collect();
                        found = Some(Command {
                            raw: raw_bytes,
                            args,
                        });
                    }
                    Source::Rewritten { raw, marks } => {
                        let raw_bytes = Bytes::from(raw);
                        let args = marks.iter().map(|&(a, b)| raw_bytes.slice(a..b)).collect();
                        found = Some(Command {
                            raw: raw_bytes,
                            args,
                        });
                    }
                }
                pos += consumed;
            }
        }
    }
    match found {
        Some(cmd) if pos == src.len() => Ok(cmd),
        Some(_) => Err(Error::TooMuchData),
        None => Err(Error::IncompleteCommand),
    }
}

/// An incremental command reader over a byte stream.
///
/// The reader tolerates arbitrary chunking: partial commands stay in the
/// internal buffer until later reads complete them. The buffer starts at
/// 4 KiB, doubles when a command outgrows it, and shrinks back once
/// drained.
pub struct Reader<R> {
    rd: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    cmds: VecDeque<Command>,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(rd: R) -> Reader<R> {
        Reader {
            rd,
            buf: vec![0; INITIAL_BUF],
            start: 0,
            end: 0,
            cmds: VecDeque::new(),
        }
    }

    /// Reads the next command, in arrival order.
    pub async fn read_command(&mut self) -> Result<Command> {
        loop {
            if let Some(cmd) = self.cmds.pop_front() {
                return Ok(cmd);
            }
            let cmds = self.fill().await?;
            self.cmds.extend(cmds);
        }
    }

    /// Returns every command that is already fully buffered, reading from
    /// the stream only when the buffer yields none. Commands packed into
    /// one transport read are therefore returned together.
    pub async fn read_pipeline(&mut self) -> Result<Vec<Command>> {
        if !self.cmds.is_empty() {
            return Ok(self.cmds.drain(..).collect());
        }
        self.fill().await
    }

    // Scans the buffer for complete commands, refilling from the stream
    // until at least one is available.
    async fn fill(&mut self) -> Result<Vec<Command>> {
        loop {
            if self.start == self.end && self.buf.len() > INITIAL_BUF {
                self.buf.truncate(INITIAL_BUF);
                self.buf.shrink_to_fit();
                self.start = 0;
                self.end = 0;
            }

            let mut out = Vec::new();
            let mut offset = self.start;
            while offset < self.end {
                let window = &self.buf[offset..self.end];
                match next_command(window)? {
                    None => break,
                    Some(raw_cmd) => {
                        let consumed = raw_cmd.consumed;
                        if let Some(cmd) = materialize_copied(window, raw_cmd) {
                            out.push(cmd);
                        }
                        offset += consumed;
                    }
                }
            }
            self.start = offset;
            if !out.is_empty() {
                return Ok(out);
            }

            if self.end == self.buf.len() {
                if self.start == self.end {
                    self.start = 0;
                    self.end = 0;
                } else {
                    let grown = self.buf.len() * 2;
                    self.buf.resize(grown, 0);
                }
            }
            let n = self.rd.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                return Err(Error::Eof);
            }
            self.end += n;
        }
    }
}
