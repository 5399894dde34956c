use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::reader::Command;

/// Responds to parsed client commands.
///
/// Implementations may await (locks, downstream I/O); the server loop
/// dispatches one command at a time per connection, so `serve` never runs
/// concurrently with itself on the same connection.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, conn: &mut Connection, cmd: Command);
}

/// Adapter that lets a plain closure act as a [`Handler`].
///
/// ```no_run
/// use resplex::{Command, Connection, HandlerFn, Server};
///
/// let server = Server::new(HandlerFn(|conn: &mut Connection, cmd: Command| {
///     conn.write_error(&format!(
///         "ERR unknown command '{}'",
///         String::from_utf8_lossy(&cmd.args[0])
///     ));
/// }));
/// ```
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut Connection, Command) + Send + Sync,
{
    async fn serve(&self, conn: &mut Connection, cmd: Command) {
        (self.0)(conn, cmd);
    }
}

#[async_trait]
impl<T: Handler + ?Sized> Handler for Arc<T> {
    async fn serve(&self, conn: &mut Connection, cmd: Command) {
        (**self).serve(conn, cmd).await;
    }
}

/// A command multiplexer: routes each command to the handler registered
/// under its lowercase name.
#[derive(Default)]
pub struct ServeMux {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl ServeMux {
    pub fn new() -> ServeMux {
        ServeMux {
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for the given command name.
    ///
    /// # Panics
    ///
    /// Panics on an empty name or a duplicate registration; both are
    /// programmer errors.
    pub fn handle(&mut self, command: &str, handler: impl Handler + 'static) {
        if command.is_empty() {
            panic!("resplex: invalid command");
        }
        let name = command.to_lowercase();
        if self.handlers.contains_key(&name) {
            panic!("resplex: multiple registrations for '{command}'");
        }
        self.handlers.insert(name, Box::new(handler));
    }

    /// Registers a closure for the given command name.
    pub fn handle_fn(
        &mut self,
        command: &str,
        handler: impl Fn(&mut Connection, Command) + Send + Sync + 'static,
    ) {
        self.handle(command, HandlerFn(handler));
    }
}

#[async_trait]
impl Handler for ServeMux {
    async fn serve(&self, conn: &mut Connection, cmd: Command) {
        let Some(first) = cmd.args.first() else {
            // A zero-arg command (`*0\r\n`) has nothing to dispatch on.
            return;
        };
        let name = String::from_utf8_lossy(first).into_owned();
        match self.handlers.get(&name.to_lowercase()) {
            Some(handler) => handler.serve(conn, cmd).await,
            None => conn.write_error(&format!("ERR unknown command '{name}'")),
        }
    }
}
