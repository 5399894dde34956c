use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};

use crate::reader::{Command, Reader};
use crate::resp::Value;
use crate::server::BoxedStream;
use crate::writer::Writer;
use crate::{Error, Result};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type ConnReader = Reader<ReadHalf<BoxedStream>>;
pub(crate) type ConnWriter = Writer<WriteHalf<BoxedStream>>;

/// A client connection as seen by command handlers.
///
/// All `write_*` primitives append to the connection's write buffer; the
/// server loop flushes once per pipeline batch. A handler may instead
/// [`close`](Connection::close) the connection, or take it over entirely
/// with [`detach`](Connection::detach).
pub struct Connection {
    id: u64,
    addr: String,
    reader: Option<ConnReader>,
    writer: Option<ConnWriter>,
    context: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) pipeline: VecDeque<Command>,
    pub(crate) closed: bool,
    pub(crate) detached: bool,
    pub(crate) idle_close: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(stream: BoxedStream, addr: String) -> Connection {
        let (rd, wr) = tokio::io::split(stream);
        Connection {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            reader: Some(Reader::new(rd)),
            writer: Some(Writer::new(wr)),
            context: None,
            pipeline: VecDeque::new(),
            closed: false,
            detached: false,
            idle_close: None,
        }
    }

    /// A process-unique id for this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The remote address of the client.
    pub fn remote_addr(&self) -> &str {
        &self.addr
    }

    /// The user-defined context stored on this connection, if any.
    pub fn context(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.context.as_deref()
    }

    /// Stores a user-defined context on this connection.
    pub fn set_context(&mut self, value: impl Any + Send + Sync) {
        self.context = Some(Box::new(value));
    }

    fn writer_mut(&mut self) -> Option<&mut ConnWriter> {
        if self.closed {
            return None;
        }
        self.writer.as_mut()
    }

    /// Buffers a simple string reply.
    pub fn write_string(&mut self, s: &str) {
        if let Some(wr) = self.writer_mut() {
            wr.write_string(s);
        }
    }

    /// Buffers an error reply.
    pub fn write_error(&mut self, msg: &str) {
        if let Some(wr) = self.writer_mut() {
            wr.write_error(msg);
        }
    }

    /// Buffers a bulk reply.
    pub fn write_bulk(&mut self, bulk: &[u8]) {
        if let Some(wr) = self.writer_mut() {
            wr.write_bulk(bulk);
        }
    }

    /// Buffers a bulk string reply.
    pub fn write_bulk_string(&mut self, bulk: &str) {
        if let Some(wr) = self.writer_mut() {
            wr.write_bulk_string(bulk);
        }
    }

    /// Buffers a signed 64-bit integer reply.
    pub fn write_int(&mut self, n: i64) {
        if let Some(wr) = self.writer_mut() {
            wr.write_int(n);
        }
    }

    /// Buffers an unsigned 64-bit integer reply.
    pub fn write_uint(&mut self, n: u64) {
        if let Some(wr) = self.writer_mut() {
            wr.write_uint(n);
        }
    }

    /// Buffers an array header; the declared number of elements must
    /// follow.
    pub fn write_array(&mut self, count: usize) {
        if let Some(wr) = self.writer_mut() {
            wr.write_array(count);
        }
    }

    /// Buffers a null bulk reply.
    pub fn write_null(&mut self) {
        if let Some(wr) = self.writer_mut() {
            wr.write_null();
        }
    }

    /// Buffers raw pre-encoded bytes.
    pub fn write_raw(&mut self, data: &[u8]) {
        if let Some(wr) = self.writer_mut() {
            wr.write_raw(data);
        }
    }

    /// Buffers any [`Value`] in its RESP rendition.
    pub fn write_any(&mut self, value: &Value) {
        if let Some(wr) = self.writer_mut() {
            wr.write_any(value);
        }
    }

    /// Returns a copy of the unflushed write buffer.
    pub fn buffer(&self) -> Vec<u8> {
        self.writer.as_ref().map(|wr| wr.buffer()).unwrap_or_default()
    }

    /// Replaces the unflushed write buffer.
    pub fn set_buffer(&mut self, raw: &[u8]) {
        if let Some(wr) = self.writer_mut() {
            wr.set_buffer(raw);
        }
    }

    /// Closes the connection once the current handler returns: buffered
    /// replies are flushed, then the socket is shut down. No write issued
    /// after this call will reach the client.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Removes this connection from the server loop, transferring its
    /// socket and any queued pipeline commands to the returned handle.
    /// After the current handler returns, the server loop exits without
    /// closing the socket; the handle's owner closes it.
    ///
    /// # Panics
    ///
    /// Panics when called on a connection that was already detached.
    pub fn detach(&mut self) -> DetachedConnection {
        self.detached = true;
        let reader = self.reader.take().expect("connection already detached");
        let writer = self.writer.take().expect("connection already detached");
        DetachedConnection {
            reader,
            writer,
            cmds: std::mem::take(&mut self.pipeline),
            addr: self.addr.clone(),
            closed: false,
        }
    }

    /// Removes and returns the commands queued behind the one currently
    /// being dispatched.
    pub fn read_pipeline(&mut self) -> Vec<Command> {
        self.pipeline.drain(..).collect()
    }

    /// Returns the commands queued behind the one currently being
    /// dispatched, leaving them in place.
    pub fn peek_pipeline(&self) -> impl Iterator<Item = &Command> {
        self.pipeline.iter()
    }

    // Fetches the next pipeline batch from the wire.
    pub(crate) async fn next_pipeline(&mut self) -> Result<Vec<Command>> {
        match self.reader.as_mut() {
            Some(rd) => rd.read_pipeline().await,
            None => Err(Error::Closed),
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(wr) => wr.flush().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn shutdown_socket(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(wr) => wr.shutdown().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.closed)
            .field("detached", &self.detached)
            .finish()
    }
}

/// A connection whose ownership was transferred out of the server loop
/// with [`Connection::detach`].
///
/// Commands still queued at the moment of detachment are returned first by
/// [`read_command`](DetachedConnection::read_command), then the underlying
/// stream is read. Writes are buffered and do not auto-flush.
pub struct DetachedConnection {
    reader: ConnReader,
    writer: ConnWriter,
    cmds: VecDeque<Command>,
    addr: String,
    closed: bool,
}

impl DetachedConnection {
    /// The remote address of the client.
    pub fn remote_addr(&self) -> &str {
        &self.addr
    }

    /// Reads the next client command.
    pub async fn read_command(&mut self) -> Result<Command> {
        if self.closed {
            return Err(Error::Closed);
        }
        if let Some(cmd) = self.cmds.pop_front() {
            return Ok(cmd);
        }
        self.reader.read_command().await
    }

    /// Writes the buffered replies to the client.
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Flushes buffered replies and closes the socket. The detached
    /// handle's owner is the sole closer of a detached connection.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.writer.flush().await;
        self.writer.shutdown().await
    }

    /// Buffers a simple string reply.
    pub fn write_string(&mut self, s: &str) {
        self.writer.write_string(s);
    }

    /// Buffers an error reply.
    pub fn write_error(&mut self, msg: &str) {
        self.writer.write_error(msg);
    }

    /// Buffers a bulk reply.
    pub fn write_bulk(&mut self, bulk: &[u8]) {
        self.writer.write_bulk(bulk);
    }

    /// Buffers a bulk string reply.
    pub fn write_bulk_string(&mut self, bulk: &str) {
        self.writer.write_bulk_string(bulk);
    }

    /// Buffers a signed 64-bit integer reply.
    pub fn write_int(&mut self, n: i64) {
        self.writer.write_int(n);
    }

    /// Buffers an unsigned 64-bit integer reply.
    pub fn write_uint(&mut self, n: u64) {
        self.writer.write_uint(n);
    }

    /// Buffers an array header; the declared number of elements must
    /// follow.
    pub fn write_array(&mut self, count: usize) {
        self.writer.write_array(count);
    }

    /// Buffers a null bulk reply.
    pub fn write_null(&mut self) {
        self.writer.write_null();
    }

    /// Buffers raw pre-encoded bytes.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.writer.write_raw(data);
    }

    /// Buffers any [`Value`] in its RESP rendition.
    pub fn write_any(&mut self, value: &Value) {
        self.writer.write_any(value);
    }

    // Splits the handle for the pub/sub engine: the read side drives the
    // subscriber's command loop while the writer is shared with publishers.
    pub(crate) fn into_parts(self) -> (ConnReader, ConnWriter, VecDeque<Command>, String) {
        (self.reader, self.writer, self.cmds, self.addr)
    }
}

impl std::fmt::Debug for DetachedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedConnection")
            .field("addr", &self.addr)
            .field("closed", &self.closed)
            .finish()
    }
}
