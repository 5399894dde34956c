use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::connection::Connection;
use crate::mux::Handler;
use crate::{Error, Result};

/// A bidirectional byte stream a connection can run over. Blanket-implemented
/// for everything that is `AsyncRead + AsyncWrite`, including TLS streams.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// A source of inbound connections.
///
/// TCP and Unix listeners are provided; a TLS acceptor or any other
/// transport enters the server through an implementation of this trait.
#[async_trait]
pub trait Listener: Send {
    /// Accepts the next inbound stream, returning it with the peer's
    /// address in display form.
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)>;

    /// The listener's local address, when it has one.
    fn local_addr(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok((Box::new(stream), addr.to_string()))
    }

    fn local_addr(&self) -> Option<String> {
        TcpListener::local_addr(self).ok().map(|a| a.to_string())
    }
}

#[async_trait]
impl Listener for UnixListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        let (stream, addr) = UnixListener::accept(self).await?;
        Ok((Box::new(stream), format!("{addr:?}")))
    }

    fn local_addr(&self) -> Option<String> {
        UnixListener::local_addr(self).ok().map(|a| format!("{a:?}"))
    }
}

type AcceptFn = Arc<dyn Fn(&mut Connection) -> bool + Send + Sync>;
type ClosedFn = Arc<dyn Fn(&mut Connection, Option<&Error>) + Send + Sync>;
type AcceptErrorFn = Arc<dyn Fn(&io::Error) + Send + Sync>;

// Why the per-connection loop ended.
enum Exit {
    Closed,
    Detached,
}

/// A RESP server: accepts connections and runs the read/dispatch/flush
/// loop for each, handing every parsed command to the [`Handler`].
///
/// The server is cheap to clone; clones share the listener state, so a
/// clone can [`close`](Server::close) a server another task is serving
/// with.
#[derive(Clone)]
pub struct Server {
    handler: Arc<dyn Handler>,
    accept: Option<AcceptFn>,
    closed: Option<ClosedFn>,
    accept_error: Option<AcceptErrorFn>,
    idle_close: Option<Duration>,
    shared: Arc<Shared>,
}

struct Shared {
    serving: Mutex<bool>,
    token: CancellationToken,
    connections: Mutex<HashSet<u64>>,
}

impl Server {
    /// Creates a server dispatching to `handler`.
    pub fn new(handler: impl Handler + 'static) -> Server {
        Server {
            handler: Arc::new(handler),
            accept: None,
            closed: None,
            accept_error: None,
            idle_close: None,
            shared: Arc::new(Shared {
                serving: Mutex::new(false),
                token: CancellationToken::new(),
                connections: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Sets a callback invoked once per new connection; returning `false`
    /// rejects and closes it.
    pub fn accept(mut self, f: impl Fn(&mut Connection) -> bool + Send + Sync + 'static) -> Server {
        self.accept = Some(Arc::new(f));
        self
    }

    /// Sets a callback invoked once per connection after its worker ends.
    /// The error is `None` when the client closed the stream cleanly.
    pub fn closed(
        mut self,
        f: impl Fn(&mut Connection, Option<&Error>) + Send + Sync + 'static,
    ) -> Server {
        self.closed = Some(Arc::new(f));
        self
    }

    /// Sets a callback invoked on transient accept errors. The accept
    /// loop continues regardless.
    pub fn accept_error(mut self, f: impl Fn(&io::Error) + Send + Sync + 'static) -> Server {
        self.accept_error = Some(Arc::new(f));
        self
    }

    /// Closes connections that stay idle for `dur` between pipeline
    /// reads.
    pub fn idle_close(mut self, dur: Duration) -> Server {
        self.idle_close = Some(dur);
        self
    }

    /// Binds a TCP listener on `addr` and serves it.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Binds a Unix stream listener on `path` and serves it.
    pub async fn listen_and_serve_unix(&self, path: impl AsRef<Path>) -> Result<()> {
        let listener = UnixListener::bind(path)?;
        self.serve(listener).await
    }

    /// Serves connections accepted from `listener` until
    /// [`close`](Server::close) is called.
    pub async fn serve(&self, mut listener: impl Listener) -> Result<()> {
        *self.shared.serving.lock().unwrap() = true;
        if let Some(addr) = listener.local_addr() {
            info!(%addr, "listening");
        }
        let token = self.shared.token.clone();
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = token.cancelled() => break,
            };
            match accepted {
                Err(err) => {
                    if token.is_cancelled() {
                        break;
                    }
                    error!(%err, "accept error");
                    if let Some(cb) = &self.accept_error {
                        cb(&err);
                    }
                }
                Ok((stream, addr)) => {
                    let mut conn = Connection::new(stream, addr);
                    conn.idle_close = self.idle_close;
                    self.shared.connections.lock().unwrap().insert(conn.id());
                    if let Some(accept) = &self.accept {
                        if !accept(&mut conn) {
                            self.shared.connections.lock().unwrap().remove(&conn.id());
                            let _ = conn.flush().await;
                            let _ = conn.shutdown_socket().await;
                            continue;
                        }
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle(conn).await;
                    });
                }
            }
        }
        // Cancel surviving workers; each owns its socket and drops it.
        token.cancel();
        let remaining = self.shared.connections.lock().unwrap().len();
        if remaining > 0 {
            debug!(remaining, "closing connections");
        }
        *self.shared.serving.lock().unwrap() = false;
        Ok(())
    }

    /// Stops the server: the listener shuts down and every accepted
    /// socket is closed. Errors with [`Error::NotServing`] when the
    /// server is not currently serving.
    pub fn close(&self) -> Result<()> {
        let mut serving = self.shared.serving.lock().unwrap();
        if !*serving {
            return Err(Error::NotServing);
        }
        *serving = false;
        self.shared.token.cancel();
        Ok(())
    }

    #[instrument(name = "connection", skip_all, fields(id = conn.id(), addr = %conn.remote_addr()))]
    async fn handle(&self, mut conn: Connection) {
        debug!("accepted");
        let result = self.connection_loop(&mut conn).await;
        let err = match result {
            Ok(Exit::Detached) => {
                // Socket ownership moved out with the detached handle.
                debug!("detached");
                None
            }
            Ok(Exit::Closed) => None,
            Err(Error::Eof) => None,
            Err(err) => Some(err),
        };
        if !conn.detached {
            let _ = conn.shutdown_socket().await;
        }
        self.shared.connections.lock().unwrap().remove(&conn.id());
        if let Some(err) = &err {
            debug!(%err, "closed");
        }
        if let Some(cb) = &self.closed {
            cb(&mut conn, err.as_ref());
        }
    }

    async fn connection_loop(&self, conn: &mut Connection) -> Result<Exit> {
        let token = self.shared.token.clone();
        loop {
            let fetch = async {
                match conn.idle_close {
                    Some(dur) => match timeout(dur, conn.next_pipeline()).await {
                        Ok(res) => res,
                        Err(_) => Err(Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "idle connection timed out",
                        ))),
                    },
                    None => conn.next_pipeline().await,
                }
            };
            let batch = tokio::select! {
                res = fetch => res,
                _ = token.cancelled() => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "server closed",
                    )));
                }
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    if matches!(err, Error::Protocol(_)) {
                        // Malformed requests get one error line before the
                        // disconnect; write failures no longer matter here.
                        conn.write_error(&format!("ERR {err}"));
                        let _ = conn.flush().await;
                    }
                    return Err(err);
                }
            };
            conn.pipeline = batch.into();
            while let Some(cmd) = conn.pipeline.pop_front() {
                self.handler.serve(conn, cmd).await;
            }
            if conn.detached {
                return Ok(Exit::Detached);
            }
            if conn.closed {
                let _ = conn.flush().await;
                return Ok(Exit::Closed);
            }
            conn.flush().await?;
        }
    }
}
