//! Upstream reply framing.
//!
//! Replies from shards are passed through to clients verbatim, so the
//! reader never builds values: it only needs to know where one complete
//! frame ends. Bytes accumulate in an internal buffer; [`ReplyReader::frame_len`]
//! reports the length of the frame at the front, the scheduler copies that
//! exact range into the owning client's output buffer, and
//! [`ReplyReader::consume`] compacts the buffer for the next frame.

use bytes::BytesMut;
use memchr::memchr;

use crate::error::ReplyError;

/// Maximum array nesting the scanner will follow. Deeper replies are
/// treated as a decode failure rather than a stack risk.
const MAX_NESTING_DEPTH: usize = 64;

/// Buffered reply scanner for one upstream connection.
#[derive(Debug, Default)]
pub struct ReplyReader {
    buf: BytesMut,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// The accumulation buffer, for appending freshly read socket bytes.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// The buffered bytes, starting at the front of the oldest frame.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Length of the complete reply frame at the front of the buffer, or
    /// `None` if more bytes are needed.
    pub fn frame_len(&self) -> Result<Option<usize>, ReplyError> {
        let mut pos = 0;
        if scan_frame(&self.buf, &mut pos, 0)? {
            Ok(Some(pos))
        } else {
            Ok(None)
        }
    }

    /// Drops `len` consumed bytes from the front and resets the cursor.
    pub fn consume(&mut self, len: usize) {
        let _ = self.buf.split_to(len);
    }

    /// Detaches the first `len` bytes, one complete frame as reported by
    /// [`frame_len`](Self::frame_len), compacting the buffer in the same
    /// step.
    pub fn take_frame(&mut self, len: usize) -> bytes::Bytes {
        self.buf.split_to(len).freeze()
    }

    /// Discards everything buffered. Used when the connection is reset and
    /// any partial frame can no longer be matched to a request.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Advances `pos` past one frame. Returns `Ok(false)` when the buffer
/// ends before the frame does.
fn scan_frame(buf: &[u8], pos: &mut usize, depth: usize) -> Result<bool, ReplyError> {
    let Some(&prefix) = buf.get(*pos) else {
        return Ok(false);
    };
    match prefix {
        b'+' | b'-' | b':' => Ok(skip_line(buf, pos)),
        b'$' => {
            let Some(len) = int_line(buf, pos)? else {
                return Ok(false);
            };
            if len < 0 {
                // Null bulk ($-1) carries no payload.
                return Ok(true);
            }
            let end = *pos + len as usize + 2;
            if end > buf.len() {
                return Ok(false);
            }
            *pos = end;
            Ok(true)
        }
        b'*' => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(ReplyError::NestingTooDeep(MAX_NESTING_DEPTH));
            }
            let Some(count) = int_line(buf, pos)? else {
                return Ok(false);
            };
            if count < 0 {
                // Null array.
                return Ok(true);
            }
            for _ in 0..count {
                if !scan_frame(buf, pos, depth + 1)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        other => Err(ReplyError::InvalidPrefix(other)),
    }
}

/// Advances `pos` past the `\r\n`-terminated line starting at `pos`.
fn skip_line(buf: &[u8], pos: &mut usize) -> bool {
    match find_crlf(buf, *pos + 1) {
        Some(end) => {
            *pos = end;
            true
        }
        None => false,
    }
}

/// Parses the integer line after a `$` or `*` prefix at `pos`, advancing
/// `pos` past its `\r\n`. `Ok(None)` means the line is incomplete.
fn int_line(buf: &[u8], pos: &mut usize) -> Result<Option<i64>, ReplyError> {
    let start = *pos + 1;
    let Some(end) = find_crlf(buf, start) else {
        return Ok(None);
    };
    let line = &buf[start..end - 2];
    let (neg, digits) = match line.first() {
        Some(b'-') => (true, &line[1..]),
        _ => (false, line),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ReplyError::InvalidInteger);
    }
    let mut n: i64 = 0;
    for &b in digits {
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add((b - b'0') as i64))
            .ok_or(ReplyError::InvalidInteger)?;
    }
    *pos = end;
    Ok(Some(if neg { -n } else { n }))
}

/// Returns the offset just past the next `\r\n` at or after `start`.
fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    let mut pos = start;
    while let Some(offset) = memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            return Some(cr + 2);
        }
        pos = cr + 1;
    }
    None
}
