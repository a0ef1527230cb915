//! Client request stream parser.
//!
//! Incremental decoder for the two client-side framings: multi-bulk
//! (`*N\r\n` followed by N `$L\r\n<bytes>\r\n` arguments) and inline
//! (space-separated tokens terminated by `\n` or `\r\n`). The parser
//! records argument *spans* (offset + length) into the raw buffer; the
//! buffer itself is later forwarded to the upstream shard verbatim, so
//! argument bytes are never copied out.
//!
//! A single socket read can carry several pipelined commands. When a
//! second `*` header shows up after one command has been fully consumed,
//! the parser splits: the current buffer is truncated at the boundary and
//! the tail bytes are handed back so the caller can seed a successor
//! query. The caller is responsible for linking the two requests so the
//! scheduler can keep them ordered.

use bytes::BytesMut;
use memchr::memchr;

use crate::error::QueryError;

/// Argument span vectors grow by this many slots at a time.
const ARG_SPANS_MIN: usize = 10;

/// One argument's position inside the raw request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpan {
    pub offset: usize,
    pub len: usize,
}

/// Parser progress for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are needed; call [`Query::parse`] again after appending.
    Incomplete,
    /// The query is fully parsed and ready for routing.
    Ok,
    /// The byte stream violated the framing; the request must be failed.
    Error,
}

/// Outcome of one [`Query::parse`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    /// Need more bytes.
    Incomplete,
    /// The query is complete.
    Complete,
    /// The query is complete and the buffer held the start of another
    /// pipelined command; the tail bytes belong to a successor query.
    Split(BytesMut),
    /// Framing violation.
    Error(QueryError),
}

/// Which framing the first byte selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    MultiBulk,
    Inline,
}

/// Position within a multi-bulk parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MbState {
    /// Expecting a `*N\r\n` command header.
    Header,
    /// Expecting a `$L\r\n` argument length line.
    ArgLen,
    /// Expecting `bulk_len` data bytes plus the trailing `\r\n`.
    ArgData,
}

/// Incremental parse state for one client request.
#[derive(Debug)]
pub struct Query {
    buf: BytesMut,
    cursor: usize,
    framing: Option<Framing>,
    state: MbState,
    /// `*` headers consumed so far; a second one triggers a split.
    commands: u32,
    /// Arguments still expected in the current command.
    remaining_args: u64,
    /// Length of the bulk currently being read (valid in `ArgData`).
    bulk_len: usize,
    args: Vec<ArgSpan>,
    status: ParseStatus,
}

impl Query {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            cursor: 0,
            framing: None,
            state: MbState::Header,
            commands: 0,
            remaining_args: 0,
            bulk_len: 0,
            args: Vec::with_capacity(ARG_SPANS_MIN),
            status: ParseStatus::Incomplete,
        }
    }

    /// Builds the successor query for a pipeline split, seeded with the
    /// tail bytes returned by [`Parsed::Split`].
    pub fn from_tail(tail: BytesMut) -> Self {
        let mut query = Self::new();
        query.buf = tail;
        query
    }

    /// The raw buffer, for appending freshly read socket bytes.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// The raw request bytes exactly as they will be written upstream.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    pub fn status(&self) -> ParseStatus {
        self.status
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    pub fn args(&self) -> &[ArgSpan] {
        &self.args
    }

    /// Argument `i`'s bytes, borrowed from the raw buffer.
    pub fn arg(&self, i: usize) -> Option<&[u8]> {
        let span = self.args.get(i)?;
        self.buf.get(span.offset..span.offset + span.len)
    }

    /// The command name (first argument), lowercased.
    pub fn command_name(&self) -> Option<String> {
        let arg = self.arg(0)?;
        Some(String::from_utf8_lossy(arg).to_ascii_lowercase())
    }

    /// Advances the parse over any bytes appended since the last call.
    ///
    /// Once a terminal status is reached the call is idempotent.
    pub fn parse(&mut self) -> Parsed {
        match self.status {
            ParseStatus::Ok => return Parsed::Complete,
            ParseStatus::Error => return Parsed::Error(QueryError::MissingBulkMarker),
            ParseStatus::Incomplete => {}
        }
        if self.framing.is_none() {
            let Some(&first) = self.buf.first() else {
                return Parsed::Incomplete;
            };
            self.framing = Some(if first == b'*' {
                Framing::MultiBulk
            } else {
                Framing::Inline
            });
        }
        match self.framing {
            Some(Framing::MultiBulk) => self.parse_multi_bulk(),
            Some(Framing::Inline) => self.parse_inline(),
            None => unreachable!(),
        }
    }

    fn parse_multi_bulk(&mut self) -> Parsed {
        loop {
            match self.state {
                MbState::Header => {
                    if self.cursor >= self.buf.len() {
                        // A complete command followed by no extra bytes is
                        // a finished query.
                        if self.commands > 0 {
                            self.status = ParseStatus::Ok;
                            return Parsed::Complete;
                        }
                        return Parsed::Incomplete;
                    }
                    let b = self.buf[self.cursor];
                    if b != b'*' {
                        return self.fail(QueryError::ExpectedCommandHeader(b));
                    }
                    if self.commands > 0 {
                        // Two pipelined commands shared one read: truncate
                        // here and hand the tail to a successor query.
                        let tail = self.buf.split_off(self.cursor);
                        self.status = ParseStatus::Ok;
                        return Parsed::Split(tail);
                    }
                    let Some((count, next)) = self.int_line(self.cursor + 1) else {
                        return Parsed::Incomplete;
                    };
                    self.commands += 1;
                    self.cursor = next;
                    // Negative counts are normalized to zero arguments.
                    self.remaining_args = count.max(0) as u64;
                    self.state = if self.remaining_args == 0 {
                        MbState::Header
                    } else {
                        MbState::ArgLen
                    };
                }
                MbState::ArgLen => {
                    if self.cursor >= self.buf.len() {
                        return Parsed::Incomplete;
                    }
                    let b = self.buf[self.cursor];
                    if b != b'$' {
                        return self.fail(QueryError::MissingBulkMarker);
                    }
                    let Some((len, next)) = self.int_line(self.cursor + 1) else {
                        return Parsed::Incomplete;
                    };
                    self.cursor = next;
                    self.bulk_len = len.max(0) as usize;
                    self.state = MbState::ArgData;
                }
                MbState::ArgData => {
                    let end = self.cursor + self.bulk_len;
                    if end + 2 > self.buf.len() {
                        return Parsed::Incomplete;
                    }
                    if self.buf[end] != b'\r' {
                        return Parsed::Incomplete;
                    }
                    self.push_arg(self.cursor, self.bulk_len);
                    self.cursor = end + 2;
                    self.remaining_args -= 1;
                    self.state = if self.remaining_args == 0 {
                        MbState::Header
                    } else {
                        MbState::ArgLen
                    };
                }
            }
        }
    }

    fn parse_inline(&mut self) -> Parsed {
        let Some(nl) = memchr(b'\n', &self.buf) else {
            return Parsed::Incomplete;
        };
        let mut line_end = nl;
        let mut term = 1;
        if line_end > 0 && self.buf[line_end - 1] == b'\r' {
            line_end -= 1;
            term = 2;
        }
        let mut pos = 0;
        while pos < line_end {
            if self.buf[pos] == b' ' {
                pos += 1;
                continue;
            }
            let end = memchr(b' ', &self.buf[pos..line_end])
                .map(|i| pos + i)
                .unwrap_or(line_end);
            self.push_arg(pos, end - pos);
            pos = end;
        }
        // Drop anything past the terminator so stray bytes are never
        // forwarded upstream as part of this request.
        self.buf.truncate(line_end + term);
        self.cursor = self.buf.len();
        self.commands = 1;
        self.status = ParseStatus::Ok;
        Parsed::Complete
    }

    /// Reads an integer line starting at `start`, returning the value and
    /// the offset just past the `\r\n`. `None` means the line terminator
    /// has not arrived yet.
    fn int_line(&self, start: usize) -> Option<(i64, usize)> {
        if start >= self.buf.len() {
            return None;
        }
        let cr = start + memchr(b'\r', &self.buf[start..])?;
        if cr + 1 >= self.buf.len() || self.buf[cr + 1] != b'\n' {
            return None;
        }
        Some((ascii_to_i64(&self.buf[start..cr]), cr + 2))
    }

    fn push_arg(&mut self, offset: usize, len: usize) {
        if self.args.len() == self.args.capacity() {
            self.args.reserve_exact(ARG_SPANS_MIN);
        }
        self.args.push(ArgSpan { offset, len });
    }

    fn fail(&mut self, err: QueryError) -> Parsed {
        self.status = ParseStatus::Error;
        Parsed::Error(err)
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an optional sign plus leading ASCII digits, ignoring any
/// trailing bytes. Lines with no leading digits evaluate to zero.
fn ascii_to_i64(bytes: &[u8]) -> i64 {
    let (neg, digits) = match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        _ => (false, bytes),
    };
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((b - b'0') as i64);
    }
    if neg {
        -n
    } else {
        n
    }
}
