//! Incremental request parser.
//!
//! Requests come either as a single space-separated line (`SET k v\r\n`) or
//! as a multi-bulk array (`*2\r\n$3\r\nGET\r\n$1\r\nk\r\n`). Bytes may arrive
//! in arbitrary fragments; [`QueryParser`] keeps its position across calls
//! and only consumes complete units from the [`Buffer`].

use std::mem;

use bytes::Bytes;

use crate::buffer::Buffer;
use crate::error::ProtocolError;

pub const MAX_INLINE: usize = 4096;
pub const MAX_BULK: usize = 4096;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Undetermined,
    Inline,
    MultiBulk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full command. May be empty (`*0\r\n` or a blank line).
    Complete(Vec<Bytes>),
    Incomplete,
}

#[derive(Debug, Default)]
pub struct QueryParser {
    mode: Mode,
    /// Bulk strings still expected for the current array; 0 until the
    /// `*<n>` header has been read.
    bulk_num: usize,
    bulk_len: Option<usize>,
    args: Vec<Bytes>,
}

impl QueryParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Consumes bytes for at most one command. Parser state is kept on
    /// `Incomplete` and reset after a complete command or an error.
    pub fn parse(&mut self, buf: &mut Buffer) -> Result<ParseStatus, ProtocolError> {
        if self.mode == Mode::Undetermined {
            self.mode = match buf.first() {
                None => return Ok(ParseStatus::Incomplete),
                Some(b'*') => Mode::MultiBulk,
                Some(_) => Mode::Inline,
            };
        }

        let result = if self.mode == Mode::MultiBulk {
            self.parse_multibulk(buf)
        } else {
            self.parse_inline(buf)
        };

        if !matches!(result, Ok(ParseStatus::Incomplete)) {
            self.reset();
        }
        result
    }

    pub fn reset(&mut self) {
        self.mode = Mode::Undetermined;
        self.bulk_num = 0;
        self.bulk_len = None;
        self.args.clear();
    }

    fn parse_inline(&mut self, buf: &mut Buffer) -> Result<ParseStatus, ProtocolError> {
        let Some(idx) = find_line(buf)? else {
            return Ok(ParseStatus::Incomplete);
        };

        let args = buf[..idx]
            .split(|b| *b == b' ')
            .filter(|token| !token.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        buf.consume(idx + 2);
        Ok(ParseStatus::Complete(args))
    }

    fn parse_multibulk(&mut self, buf: &mut Buffer) -> Result<ParseStatus, ProtocolError> {
        if self.bulk_num == 0 {
            let Some(idx) = find_line(buf)? else {
                return Ok(ParseStatus::Incomplete);
            };
            let count = parse_length(&buf[1..idx])?;
            buf.consume(idx + 2);

            if count <= 0 {
                return Ok(ParseStatus::Complete(Vec::new()));
            }
            self.bulk_num = count as usize;
            self.args = Vec::with_capacity(self.bulk_num.min(64));
        }

        while self.bulk_num > 0 {
            let len = match self.bulk_len {
                Some(len) => len,
                None => {
                    let Some(idx) = find_line(buf)? else {
                        return Ok(ParseStatus::Incomplete);
                    };
                    if buf[0] != b'$' {
                        return Err(ProtocolError::ExpectedBulkLength);
                    }
                    let len = parse_length(&buf[1..idx])?;
                    if len < 0 {
                        return Err(ProtocolError::InvalidLength(len.to_string()));
                    }
                    let len = len as usize;
                    if len > MAX_BULK {
                        return Err(ProtocolError::TooBigBulk(len));
                    }
                    buf.consume(idx + 2);
                    self.bulk_len = Some(len);
                    len
                }
            };

            if buf.len() < len + 2 {
                return Ok(ParseStatus::Incomplete);
            }
            if &buf[len..len + 2] != b"\r\n" {
                return Err(ProtocolError::MissingCrlf);
            }

            self.args.push(Bytes::copy_from_slice(&buf[..len]));
            buf.consume(len + 2);
            self.bulk_len = None;
            self.bulk_num -= 1;
        }

        Ok(ParseStatus::Complete(mem::take(&mut self.args)))
    }
}

// Offset of the next CRLF, or `None` if more bytes are needed.
fn find_line(buf: &Buffer) -> Result<Option<usize>, ProtocolError> {
    match buf.find_crlf() {
        Some(idx) if idx <= MAX_INLINE => Ok(Some(idx)),
        Some(_) => Err(ProtocolError::TooLongInline),
        None if buf.len() > MAX_INLINE => Err(ProtocolError::TooLongInline),
        None => Ok(None),
    }
}

fn parse_length(digits: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidLength(String::from_utf8_lossy(digits).into_owned()))
}
