//! Frame codec for the v3 wire protocol.
//!
//! Every message is `[tag: u8][len: i32 BE, counts itself][payload]`, except
//! the startup message which has no tag byte.
//!
//! [`MessageWriter`] appends frontend messages into one growable buffer and
//! back-patches each length field when the message ends. [`FrameBuffer`]
//! accumulates socket bytes and slices off complete backend frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Initial writer capacity.
const INITIAL_CAPACITY: usize = 4096;

/// Largest backend frame we accept (1 GiB, the server's own field limit).
const MAX_FRAME_LEN: usize = 1 << 30;

// ============================================================================
// Writer
// ============================================================================

/// Appends frontend messages to a reusable buffer.
#[derive(Debug)]
pub struct MessageWriter {
    buf: BytesMut,
    /// Offset of the current message's length field.
    message_start: usize,
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            message_start: 0,
        }
    }

    /// Grow geometrically: double the capacity plus what was asked for.
    #[inline]
    fn ensure(&mut self, additional: usize) {
        if self.buf.capacity() - self.buf.len() < additional {
            let grow = self.buf.capacity() + additional;
            self.buf.reserve(grow);
        }
    }

    /// Start a message. `None` for the untagged startup message.
    pub fn begin_message(&mut self, tag: Option<u8>) -> &mut Self {
        self.ensure(5);
        if let Some(tag) = tag {
            self.buf.put_u8(tag);
        }
        self.message_start = self.buf.len();
        self.buf.put_i32(0);
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.ensure(1);
        self.buf.put_u8(value);
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.ensure(2);
        self.buf.put_i16(value);
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.ensure(4);
        self.buf.put_i32(value);
        self
    }

    /// UTF-8 bytes without a terminator.
    pub fn raw_str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    /// UTF-8 bytes followed by a zero byte.
    pub fn cstr(&mut self, value: &str) -> &mut Self {
        self.ensure(value.len() + 1);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.ensure(value.len());
        self.buf.put_slice(value);
        self
    }

    /// Back-patch the current message's length field.
    pub fn end_message(&mut self) -> &mut Self {
        let len = (self.buf.len() - self.message_start) as i32;
        self.buf[self.message_start..self.message_start + 4].copy_from_slice(&len.to_be_bytes());
        self
    }

    /// Shorthand for a message with no payload (Sync, Flush, Terminate).
    pub fn empty_message(&mut self, tag: u8) -> &mut Self {
        self.begin_message(Some(tag)).end_message()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Hand out everything written so far and start over at offset zero.
    pub fn take(&mut self) -> Bytes {
        self.message_start = 0;
        self.buf.split().freeze()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Rolling buffer of inbound bytes.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Buffer to read socket data into.
    pub fn read_target(&mut self) -> &mut BytesMut {
        if self.buf.capacity() - self.buf.len() < 1024 {
            self.buf.reserve(INITIAL_CAPACITY);
        }
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Slice off one complete frame as `(tag, body)`.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived.
    pub fn next_frame(&mut self) -> Result<Option<(u8, Bytes)>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }

        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 || len as usize > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "Invalid frame length {} for tag {:?}",
                len, self.buf[0] as char
            )));
        }

        let len = len as usize;
        if self.buf.len() < len + 1 {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(len + 1);
        let tag = frame.get_u8();
        frame.advance(4);
        Ok(Some((tag, frame.freeze())))
    }
}

// ============================================================================
// Body cursor
// ============================================================================

/// Bounds-checked reader over one message body.
#[derive(Debug)]
pub struct Cursor {
    body: Bytes,
}

impl Cursor {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.body.remaining() < n {
            return Err(Error::Protocol(format!("Truncated message reading {}", what)));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.body.remaining()
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.body.get_u8())
    }

    pub fn i16(&mut self) -> Result<i16> {
        self.need(2, "i16")?;
        Ok(self.body.get_i16())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.body.get_i32())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.body.get_u32())
    }

    pub fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n, "bytes")?;
        Ok(self.body.split_to(n))
    }

    /// The rest of the body.
    pub fn rest(&mut self) -> Bytes {
        self.body.split_off(0)
    }

    /// Zero-terminated string. Invalid UTF-8 is replaced, not rejected.
    pub fn cstr(&mut self) -> Result<String> {
        let end = self
            .body
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("Missing null terminator in string".to_string()))?;

        let s = match std::str::from_utf8(&self.body[..end]) {
            Ok(s) => s.to_owned(),
            Err(_) => String::from_utf8_lossy(&self.body[..end]).into_owned(),
        };
        self.body.advance(end + 1);
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix_counts_itself() {
        let mut w = MessageWriter::new();
        w.begin_message(Some(b'Q')).cstr("SELECT 1").end_message();
        let out = w.take();

        assert_eq!(out[0], b'Q');
        let len = i32::from_be_bytes([out[1], out[2], out[3], out[4]]) as usize;
        assert_eq!(len, out.len() - 1);
        assert_eq!(&out[5..], b"SELECT 1\0");
    }

    #[test]
    fn test_untagged_message() {
        let mut w = MessageWriter::new();
        w.begin_message(None).i32(196608).cstr("user").cstr("bob").u8(0).end_message();
        let out = w.take();
        let len = i32::from_be_bytes([out[0], out[1], out[2], out[3]]) as usize;
        assert_eq!(len, out.len());
    }

    #[test]
    fn test_take_resets_cursor() {
        let mut w = MessageWriter::new();
        w.empty_message(b'S');
        assert_eq!(w.take().len(), 5);
        assert!(w.is_empty());
        w.empty_message(b'H').empty_message(b'S');
        assert_eq!(&w.take()[..], &[b'H', 0, 0, 0, 4, b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn test_writer_grows() {
        let mut w = MessageWriter::new();
        let big = "x".repeat(INITIAL_CAPACITY * 3);
        w.begin_message(Some(b'Q')).cstr(&big).end_message();
        let out = w.take();
        assert_eq!(out.len(), 1 + 4 + big.len() + 1);
    }

    #[test]
    fn test_frames_round_trip_through_reader() {
        let mut w = MessageWriter::new();
        w.begin_message(Some(b'C')).cstr("INSERT 0 3").end_message();
        w.begin_message(Some(b'Z')).u8(b'I').end_message();
        let bytes = w.take();

        let mut reader = FrameBuffer::new();
        // Feed in two uneven halves
        reader.extend(&bytes[..7]);
        assert!(reader.next_frame().unwrap().is_none());
        reader.extend(&bytes[7..]);

        let (tag, body) = reader.next_frame().unwrap().unwrap();
        assert_eq!(tag, b'C');
        assert_eq!(Cursor::new(body).cstr().unwrap(), "INSERT 0 3");

        let (tag, body) = reader.next_frame().unwrap().unwrap();
        assert_eq!(tag, b'Z');
        assert_eq!(Cursor::new(body).u8().unwrap(), b'I');

        assert!(reader.next_frame().unwrap().is_none());
        assert!(reader.buf.is_empty());
    }

    #[test]
    fn test_rejects_bad_length() {
        let mut reader = FrameBuffer::new();
        reader.extend(&[b'Z', 0, 0, 0, 2]);
        assert!(matches!(reader.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_cursor_bounds() {
        let mut c = Cursor::new(Bytes::from_static(&[0, 1]));
        assert_eq!(c.i16().unwrap(), 1);
        assert!(c.i32().is_err());
        let mut c = Cursor::new(Bytes::from_static(b"abc"));
        assert!(c.cstr().is_err());
    }
}
