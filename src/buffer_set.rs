//! Buffers owned by one connector.

use std::ops::Range;

use crate::error::{Error, Result};

/// Messages larger than this are treated as corrupt framing.
const MAX_MESSAGE_LEN: usize = 1 << 30;

const READ_CHUNK: usize = 8192;

/// Staging buffer between the socket and the message parsers.
///
/// Bytes are appended by the transport and handed out one complete backend
/// message at a time. A message is only consumed once all of its bytes have
/// arrived, so an interrupted read never loses a partial frame.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl ReadBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Bytes already received but not yet handed out.
    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take the next complete message, returning its type byte and payload range.
    ///
    /// The range stays valid until the next call to [`ReadBuffer::spare`].
    pub fn next_frame(&mut self) -> Result<Option<(u8, Range<usize>)>> {
        let data = &self.buf[self.pos..];
        let Some((&type_byte, rest)) = data.split_first() else {
            return Ok(None);
        };
        let Some((len, _)) = rest.split_first_chunk::<4>() else {
            return Ok(None);
        };
        let len = i32::from_be_bytes(*len);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(Error::Protocol(format!(
                "invalid length {} for message '{}'",
                len, type_byte as char
            )));
        }

        let total = 1 + len as usize;
        if data.len() < total {
            return Ok(None);
        }
        let start = self.pos + 5;
        let end = self.pos + total;
        self.pos = end;
        Ok(Some((type_byte, start..end)))
    }

    /// Payload bytes of a frame returned by [`ReadBuffer::next_frame`].
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Compact consumed bytes and reserve room for the next transport read.
    pub fn spare(&mut self) -> &mut Vec<u8> {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.reserve(READ_CHUNK);
        &mut self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

/// Buffer set reused across the lifetime of a connector.
#[derive(Debug)]
pub struct BufferSet {
    /// Incoming bytes
    pub read: ReadBuffer,
    /// Outgoing messages, flushed at message boundaries
    pub write_buffer: Vec<u8>,
    /// COPY row staging
    pub copy_buffer: Vec<u8>,
}

impl BufferSet {
    pub fn new() -> Self {
        Self {
            read: ReadBuffer::with_capacity(READ_CHUNK),
            write_buffer: Vec::with_capacity(READ_CHUNK),
            copy_buffer: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write_buffer.clear();
        self.copy_buffer.clear();
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![type_byte];
        out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_partial_frame_is_not_consumed() {
        let mut read = ReadBuffer::default();
        let bytes = frame(b'Z', b"I");

        read.spare().extend_from_slice(&bytes[..3]);
        assert!(read.next_frame().unwrap().is_none());
        assert_eq!(read.available(), 3);

        read.spare().extend_from_slice(&bytes[3..]);
        let (type_byte, range) = read.next_frame().unwrap().unwrap();
        assert_eq!(type_byte, b'Z');
        assert_eq!(read.slice(range), b"I");
        assert_eq!(read.available(), 0);
    }

    #[test]
    fn test_multiple_frames() {
        let mut read = ReadBuffer::default();
        let buf = read.spare();
        buf.extend(frame(b'C', b"SELECT 1\0"));
        buf.extend(frame(b'Z', b"T"));

        let (t1, r1) = read.next_frame().unwrap().unwrap();
        assert_eq!((t1, read.slice(r1)), (b'C', &b"SELECT 1\0"[..]));
        let (t2, r2) = read.next_frame().unwrap().unwrap();
        assert_eq!((t2, read.slice(r2)), (b'Z', &b"T"[..]));
        assert!(read.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_compaction_keeps_pending_bytes() {
        let mut read = ReadBuffer::default();
        let first = frame(b'2', b"");
        let second = frame(b'Z', b"I");
        let buf = read.spare();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..2]);

        assert_eq!(read.next_frame().unwrap().unwrap().0, b'2');
        read.spare().extend_from_slice(&second[2..]);
        assert_eq!(read.next_frame().unwrap().unwrap().0, b'Z');
    }

    #[test]
    fn test_bad_length_is_protocol_error() {
        let mut read = ReadBuffer::default();
        read.spare().extend_from_slice(&[b'D', 0, 0, 0, 2]);
        assert!(matches!(read.next_frame(), Err(Error::Protocol(_))));
    }
}
