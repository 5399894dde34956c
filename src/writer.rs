use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::resp;
use crate::resp::Value;
use crate::{Error, Result};

// Flush releases the buffer back to the allocator past this point.
const MAX_BUFFER_CAP: usize = 256 * 1024;

/// A buffered RESP writer over any byte sink.
///
/// Every `write_*` call only appends to an in-memory buffer; nothing
/// reaches the sink until [`Writer::flush`], which writes the whole buffer
/// in one call. The first I/O error latches: later writes are silently
/// dropped and later flushes keep returning the error.
pub struct Writer<W> {
    wr: W,
    buf: Vec<u8>,
    err: Option<(io::ErrorKind, String)>,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(wr: W) -> Writer<W> {
        Writer {
            wr,
            buf: Vec::new(),
            err: None,
        }
    }

    fn buf_mut(&mut self) -> Option<&mut Vec<u8>> {
        if self.err.is_some() {
            None
        } else {
            Some(&mut self.buf)
        }
    }

    /// Buffers a simple string (`+...\r\n`).
    pub fn write_string(&mut self, s: &str) {
        if let Some(buf) = self.buf_mut() {
            resp::append_simple_string(buf, s);
        }
    }

    /// Buffers an error (`-...\r\n`).
    pub fn write_error(&mut self, msg: &str) {
        if let Some(buf) = self.buf_mut() {
            resp::append_error(buf, msg);
        }
    }

    /// Buffers bulk bytes.
    pub fn write_bulk(&mut self, bulk: &[u8]) {
        if let Some(buf) = self.buf_mut() {
            resp::append_bulk(buf, bulk);
        }
    }

    /// Buffers a bulk string.
    pub fn write_bulk_string(&mut self, bulk: &str) {
        if let Some(buf) = self.buf_mut() {
            resp::append_bulk_string(buf, bulk);
        }
    }

    /// Buffers a signed 64-bit integer.
    pub fn write_int(&mut self, n: i64) {
        if let Some(buf) = self.buf_mut() {
            resp::append_int(buf, n);
        }
    }

    /// Buffers an unsigned 64-bit integer.
    pub fn write_uint(&mut self, n: u64) {
        if let Some(buf) = self.buf_mut() {
            resp::append_uint(buf, n);
        }
    }

    /// Buffers an array header. The caller must follow up with the
    /// declared number of elements.
    pub fn write_array(&mut self, count: usize) {
        if let Some(buf) = self.buf_mut() {
            resp::append_array(buf, count as i64);
        }
    }

    /// Buffers a null bulk.
    pub fn write_null(&mut self) {
        if let Some(buf) = self.buf_mut() {
            resp::append_null(buf);
        }
    }

    /// Buffers raw, pre-encoded bytes.
    pub fn write_raw(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf_mut() {
            buf.extend_from_slice(data);
        }
    }

    /// Buffers any [`Value`] in its RESP rendition.
    pub fn write_any(&mut self, value: &Value) {
        if let Some(buf) = self.buf_mut() {
            resp::append_any(buf, value);
        }
    }

    /// Returns a copy of the unflushed buffer.
    pub fn buffer(&self) -> Vec<u8> {
        if self.err.is_some() {
            return Vec::new();
        }
        self.buf.clone()
    }

    /// Replaces the unflushed buffer.
    pub fn set_buffer(&mut self, raw: &[u8]) {
        if let Some(buf) = self.buf_mut() {
            buf.clear();
            buf.extend_from_slice(raw);
        }
    }

    /// Writes the buffered bytes to the sink and resets the buffer.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some((kind, msg)) = &self.err {
            return Err(Error::Io(io::Error::new(*kind, msg.clone())));
        }
        if let Err(err) = self.wr.write_all(&self.buf).await {
            self.err = Some((err.kind(), err.to_string()));
            self.buf = Vec::new();
            return Err(Error::Io(err));
        }
        if self.buf.capacity() > MAX_BUFFER_CAP {
            self.buf = Vec::new();
        } else {
            self.buf.clear();
        }
        Ok(())
    }

    // Shuts down the write side of the sink; for sockets this sends FIN.
    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.wr.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sink() -> Writer<Cursor<Vec<u8>>> {
        Writer::new(Cursor::new(Vec::new()))
    }

    fn written(wr: &Writer<Cursor<Vec<u8>>>) -> &[u8] {
        wr.wr.get_ref()
    }

    #[tokio::test]
    async fn writes_are_buffered_until_flush() {
        let mut wr = sink();
        wr.write_error("ERR bad stuff");
        assert!(written(&wr).is_empty());
        wr.flush().await.unwrap();
        assert_eq!(written(&wr), b"-ERR bad stuff\r\n");
    }

    #[tokio::test]
    async fn write_primitives_encode_exact_bytes() {
        let mut wr = sink();
        wr.write_string("HELLO");
        wr.write_int(-1234);
        wr.write_null();
        wr.write_bulk(b"HELLO\r\nPLANET");
        wr.write_bulk_string("HELLO\r\nPLANET");
        wr.write_uint(42);
        wr.flush().await.unwrap();
        assert_eq!(
            written(&wr),
            b"+HELLO\r\n:-1234\r\n$-1\r\n$13\r\nHELLO\r\nPLANET\r\n$13\r\nHELLO\r\nPLANET\r\n:42\r\n"
        );
    }

    #[tokio::test]
    async fn array_elements_follow_the_header() {
        let mut wr = sink();
        wr.write_array(3);
        wr.write_bulk_string("THIS");
        wr.write_bulk_string("THAT");
        wr.write_string("THE OTHER THING");
        wr.flush().await.unwrap();
        assert_eq!(
            written(&wr),
            b"*3\r\n$4\r\nTHIS\r\n$4\r\nTHAT\r\n+THE OTHER THING\r\n"
        );
    }

    #[tokio::test]
    async fn buffer_can_be_inspected_and_replaced() {
        let mut wr = sink();
        wr.write_string("A");
        assert_eq!(wr.buffer(), b"+A\r\n");
        wr.set_buffer(b"+B\r\n");
        wr.flush().await.unwrap();
        assert_eq!(written(&wr), b"+B\r\n");
    }

    #[tokio::test]
    async fn flush_resets_the_buffer() {
        let mut wr = sink();
        wr.write_string("ONE");
        wr.flush().await.unwrap();
        wr.write_string("TWO");
        wr.flush().await.unwrap();
        assert_eq!(written(&wr), b"+ONE\r\n+TWO\r\n");
    }
}
