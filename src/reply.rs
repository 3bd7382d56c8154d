//! Outgoing replies.
//!
//! Every client owns a [`ReplyQueue`]: an ordered list of byte chunks plus
//! how much of the head chunk has already been written. Bulk payloads are
//! queued as the stored `Bytes` themselves, so a GET never copies the value.

use std::io::{self, ErrorKind, Write};

use bytes::Bytes;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};

const CRLF: &[u8] = b"\r\n";

struct ReplyNode {
    link: LinkedListLink,
    payload: Bytes,
}

intrusive_adapter!(ReplyAdapter = Box<ReplyNode>: ReplyNode { link: LinkedListLink });

pub struct ReplyQueue {
    chunks: LinkedList<ReplyAdapter>,
    sent_len: usize,
    pending: usize,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self {
            chunks: LinkedList::new(ReplyAdapter::new()),
            sent_len: 0,
            pending: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes still waiting to be written.
    pub fn pending_bytes(&self) -> usize {
        self.pending - self.sent_len
    }

    pub fn push(&mut self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        self.pending += payload.len();
        self.chunks.push_back(Box::new(ReplyNode {
            link: LinkedListLink::new(),
            payload,
        }));
    }

    pub fn out_ok(&mut self) {
        self.push(Bytes::from_static(b"+OK\r\n"));
    }

    pub fn out_err(&mut self, msg: &str) {
        self.push(Bytes::from(format!("-ERR: {}\r\n", msg)));
    }

    pub fn out_int(&mut self, val: i64) {
        self.push(Bytes::from(format!(":{}\r\n", val)));
    }

    pub fn out_nil(&mut self) {
        self.push(Bytes::from_static(b"$-1\r\n"));
    }

    pub fn out_arr(&mut self, n: usize) {
        self.push(Bytes::from(format!("*{}\r\n", n)));
    }

    /// Queues a bulk string; `payload` is shared, not copied.
    pub fn out_str(&mut self, payload: Bytes) {
        self.push(Bytes::from(format!("${}\r\n", payload.len())));
        self.push(payload);
        self.push(Bytes::from_static(CRLF));
    }

    /// Writes as much as `w` accepts. Stops quietly on `WouldBlock`; any
    /// other error is returned and the queue is left as it was.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut written = 0;

        while let Some(node) = self.chunks.front().get() {
            match w.write(&node.payload[self.sent_len..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    written += n;
                    self.sent_len += n;
                    if self.sent_len == node.payload.len() {
                        self.pending -= self.sent_len;
                        self.sent_len = 0;
                        self.chunks.pop_front();
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyQueue")
            .field("chunks", &self.chunks.iter().count())
            .field("sent_len", &self.sent_len)
            .field("pending", &self.pending_bytes())
            .finish()
    }
}
