//! A Redis-compatible (RESP) server framework.
//!
//! resplex owns the wire protocol and the connection machinery of a
//! Redis-speaking service and leaves command semantics to the embedding
//! application. The main components are:
//!
//! * `server`: accepts connections on TCP or Unix sockets (or any
//!   caller-supplied [`Listener`]) and runs the per-connection
//!   read/dispatch/flush loop. Commands are pipelined: everything parsed
//!   out of a single read is dispatched before one flush.
//!
//! * `reader`: the incremental command parser. Each command is recognized
//!   from its first byte as RESP (`*`), the length-prefixed native dialect
//!   (`$`), or a plain telnet line, and is exposed as a [`Command`] whose
//!   arguments are zero-copy slices into its raw RESP bytes.
//!
//! * `connection`: the handler-facing [`Connection`] with buffered write
//!   primitives, plus [`DetachedConnection`], a connection whose ownership
//!   has been transferred out of the server loop for long-lived push flows.
//!
//! * `pubsub`: a channel and glob-pattern subscription engine built on
//!   detached connections.

pub mod connection;
pub mod mux;
pub mod pubsub;
pub mod reader;
pub mod resp;
pub mod server;
pub mod writer;

pub use connection::{Connection, DetachedConnection};
pub use mux::{Handler, HandlerFn, ServeMux};
pub use pubsub::PubSub;
pub use reader::{parse, Command, ProtocolError, Reader};
pub use resp::{read_next_resp, Resp, RespKind, Value};
pub use server::{BoxedStream, Listener, Server, Stream};
pub use writer::Writer;

// Re-exported so downstream crates can implement `Handler` without
// depending on async-trait themselves.
pub use async_trait::async_trait;

use thiserror::Error as ThisError;

/// A specialized `Result` type for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed input on the wire. The server loop answers these with a
    /// single `-ERR ...` line before disconnecting.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// `parse` ran out of bytes before a full command was read.
    #[error("incomplete command")]
    IncompleteCommand,
    /// `parse` found bytes trailing the first command.
    #[error("too much data")]
    TooMuchData,
    /// The peer closed the stream cleanly. Reported to the `closed`
    /// callback as `None`.
    #[error("end of stream")]
    Eof,
    /// Read on a detached connection that was already closed.
    #[error("closed")]
    Closed,
    /// `Server::close` was called on a server that is not serving.
    #[error("not serving")]
    NotServing,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
