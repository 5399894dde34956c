use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use glob_match::glob_match;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::connection::{ConnReader, ConnWriter, Connection};
use crate::reader::Command;

/// A Redis-compatible publish/subscribe engine.
///
/// The first `subscribe` for a connection detaches it from the server
/// loop and starts a per-subscriber command loop that accepts only
/// `SUBSCRIBE`, `PSUBSCRIBE`, `UNSUBSCRIBE`, `PUNSUBSCRIBE`, `PING` and
/// `QUIT`. Publishes deliver to exact-match subscribers first, then to
/// glob-pattern subscribers (`*`, `?` and `[...]` classes).
///
/// ```no_run
/// use resplex::{async_trait, Command, Connection, Handler, PubSub};
///
/// struct Broker {
///     ps: PubSub,
/// }
///
/// #[async_trait]
/// impl Handler for Broker {
///     async fn serve(&self, conn: &mut Connection, cmd: Command) {
///         match cmd.args[0].to_ascii_lowercase().as_slice() {
///             b"subscribe" => {
///                 for channel in &cmd.args[1..] {
///                     self.ps.subscribe(conn, &String::from_utf8_lossy(channel)).await;
///                 }
///             }
///             b"publish" => {
///                 let channel = String::from_utf8_lossy(&cmd.args[1]).into_owned();
///                 let message = String::from_utf8_lossy(&cmd.args[2]).into_owned();
///                 let count = self.ps.publish(&channel, &message).await;
///                 conn.write_int(count as i64);
///             }
///             _ => conn.write_error("ERR unknown command"),
///         }
///     }
/// }
/// ```
#[derive(Clone, Default)]
pub struct PubSub {
    engine: Arc<RwLock<Engine>>,
}

#[derive(Default)]
struct Engine {
    next_id: u64,
    // Ordered index: exact entries sort before pattern entries, then by
    // (channel, subscriber id), so a publish range-scans one channel's
    // subscribers. The value is the entry's subscriber back-reference.
    entries: BTreeMap<EntryKey, Arc<Subscriber>>,
    // Subscribers keyed by the id of the connection they detached from.
    subscribers: HashMap<u64, Arc<Subscriber>>,
}

// Field order is sort order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    pattern: bool,
    channel: String,
    subscriber_id: u64,
}

struct Subscriber {
    id: u64,
    conn_id: u64,
    // Guards the write half and the owned-subscription set, so publisher
    // tasks and the subscriber's own command loop never interleave a
    // multi-token reply. Always acquired with the engine lock already
    // held or not held at all, never the other way around.
    sink: Mutex<Sink>,
}

struct Sink {
    writer: ConnWriter,
    channels: HashSet<(bool, String)>,
}

impl Subscriber {
    async fn write_message(&self, pattern: Option<&str>, channel: &str, message: &str) {
        let mut sink = self.sink.lock().await;
        match pattern {
            Some(pat) => {
                sink.writer.write_array(4);
                sink.writer.write_bulk_string("pmessage");
                sink.writer.write_bulk_string(pat);
                sink.writer.write_bulk_string(channel);
                sink.writer.write_bulk_string(message);
            }
            None => {
                sink.writer.write_array(3);
                sink.writer.write_bulk_string("message");
                sink.writer.write_bulk_string(channel);
                sink.writer.write_bulk_string(message);
            }
        }
        let _ = sink.writer.flush().await;
    }

    async fn write_error(&self, msg: &str) {
        let mut sink = self.sink.lock().await;
        sink.writer.write_error(msg);
        let _ = sink.writer.flush().await;
    }
}

impl PubSub {
    pub fn new() -> PubSub {
        PubSub::default()
    }

    /// Subscribes `conn` to an exact channel. The connection is detached
    /// on its first subscription.
    pub async fn subscribe(&self, conn: &mut Connection, channel: &str) {
        self.subscribe_connection(conn, false, channel).await;
    }

    /// Subscribes `conn` to a glob pattern. The connection is detached on
    /// its first subscription.
    pub async fn psubscribe(&self, conn: &mut Connection, channel: &str) {
        self.subscribe_connection(conn, true, channel).await;
    }

    /// Publishes `message` to `channel`, returning the number of
    /// subscribers it was delivered to. Exact-match subscribers receive
    /// the message before pattern subscribers.
    pub async fn publish(&self, channel: &str, message: &str) -> usize {
        let engine = self.engine.read().await;
        let mut sent = 0;
        let pivot = EntryKey {
            pattern: false,
            channel: channel.to_string(),
            subscriber_id: 0,
        };
        for (key, subscriber) in engine.entries.range(pivot..) {
            if key.pattern || key.channel != channel {
                break;
            }
            subscriber.write_message(None, channel, message).await;
            sent += 1;
        }
        let pivot = EntryKey {
            pattern: true,
            channel: String::new(),
            subscriber_id: 0,
        };
        for (key, subscriber) in engine.entries.range(pivot..) {
            if glob_match(&key.channel, channel) {
                subscriber.write_message(Some(&key.channel), channel, message).await;
                sent += 1;
            }
        }
        sent
    }

    async fn subscribe_connection(&self, conn: &mut Connection, pattern: bool, channel: &str) {
        let mut engine = self.engine.write().await;
        let subscriber = match engine.subscribers.get(&conn.id()) {
            Some(subscriber) => subscriber.clone(),
            None => {
                engine.next_id += 1;
                let id = engine.next_id;
                let (reader, writer, leftover, addr) = conn.detach().into_parts();
                let subscriber = Arc::new(Subscriber {
                    id,
                    conn_id: conn.id(),
                    sink: Mutex::new(Sink {
                        writer,
                        channels: HashSet::new(),
                    }),
                });
                engine.subscribers.insert(conn.id(), subscriber.clone());
                debug!(%addr, id, "pubsub subscriber created");
                tokio::spawn(command_loop(
                    self.clone(),
                    subscriber.clone(),
                    reader,
                    leftover,
                    addr,
                ));
                subscriber
            }
        };
        add_subscription(&mut engine, &subscriber, pattern, channel).await;
    }

    // Removes one subscription (targeted) or all of the given kind
    // (bulk), acknowledging each removal. A bulk unsubscribe that finds
    // nothing still acknowledges once, with a null channel.
    async fn unsubscribe(&self, subscriber: &Arc<Subscriber>, pattern: bool, target: Option<&str>) {
        let mut engine = self.engine.write().await;
        let mut sink = subscriber.sink.lock().await;
        let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
        let targets: Vec<Option<String>> = match target {
            Some(channel) => {
                if sink.channels.contains(&(pattern, channel.to_string())) {
                    vec![Some(channel.to_string())]
                } else {
                    Vec::new()
                }
            }
            None => {
                let all: Vec<Option<String>> = sink
                    .channels
                    .iter()
                    .filter(|(p, _)| *p == pattern)
                    .map(|(_, c)| Some(c.clone()))
                    .collect();
                if all.is_empty() {
                    vec![None]
                } else {
                    all
                }
            }
        };
        for channel in targets {
            if let Some(channel) = &channel {
                sink.channels.remove(&(pattern, channel.clone()));
                engine.entries.remove(&EntryKey {
                    pattern,
                    channel: channel.clone(),
                    subscriber_id: subscriber.id,
                });
            }
            let remaining = sink.channels.iter().filter(|(p, _)| *p == pattern).count();
            sink.writer.write_array(3);
            sink.writer.write_bulk_string(kind);
            match &channel {
                Some(channel) => sink.writer.write_bulk_string(channel),
                None => sink.writer.write_null(),
            }
            sink.writer.write_int(remaining as i64);
        }
        let _ = sink.writer.flush().await;
    }
}

// Inserts the entry into the ordered index and the subscriber's own set,
// then acknowledges with the subscriber's current count of that kind.
// Caller holds the engine write lock.
async fn add_subscription(
    engine: &mut Engine,
    subscriber: &Arc<Subscriber>,
    pattern: bool,
    channel: &str,
) {
    engine.entries.insert(
        EntryKey {
            pattern,
            channel: channel.to_string(),
            subscriber_id: subscriber.id,
        },
        subscriber.clone(),
    );
    let mut sink = subscriber.sink.lock().await;
    sink.channels.insert((pattern, channel.to_string()));
    let count = sink.channels.iter().filter(|(p, _)| *p == pattern).count();
    sink.writer.write_array(3);
    sink.writer
        .write_bulk_string(if pattern { "psubscribe" } else { "subscribe" });
    sink.writer.write_bulk_string(channel);
    sink.writer.write_int(count as i64);
    let _ = sink.writer.flush().await;
}

// Runs on the detached connection, serving the restricted pub/sub command
// set until the client disconnects or quits.
async fn command_loop(
    ps: PubSub,
    subscriber: Arc<Subscriber>,
    mut reader: ConnReader,
    mut leftover: VecDeque<Command>,
    addr: String,
) {
    loop {
        let cmd = match leftover.pop_front() {
            Some(cmd) => cmd,
            None => match reader.read_command().await {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };
        if cmd.args.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(&cmd.args[0]).into_owned();
        match name.to_lowercase().as_str() {
            "subscribe" | "psubscribe" => {
                let pattern = name.eq_ignore_ascii_case("psubscribe");
                if cmd.args.len() < 2 {
                    subscriber
                        .write_error(&format!("ERR wrong number of arguments for '{name}'"))
                        .await;
                    continue;
                }
                for arg in &cmd.args[1..] {
                    let channel = String::from_utf8_lossy(arg).into_owned();
                    let mut engine = ps.engine.write().await;
                    add_subscription(&mut engine, &subscriber, pattern, &channel).await;
                }
            }
            "unsubscribe" | "punsubscribe" => {
                let pattern = name.eq_ignore_ascii_case("punsubscribe");
                if cmd.args.len() == 1 {
                    ps.unsubscribe(&subscriber, pattern, None).await;
                } else {
                    for arg in &cmd.args[1..] {
                        let channel = String::from_utf8_lossy(arg).into_owned();
                        ps.unsubscribe(&subscriber, pattern, Some(&channel)).await;
                    }
                }
            }
            "ping" => {
                let message = match cmd.args.len() {
                    1 => String::new(),
                    2 => String::from_utf8_lossy(&cmd.args[1]).into_owned(),
                    _ => {
                        subscriber
                            .write_error(&format!("ERR wrong number of arguments for '{name}'"))
                            .await;
                        continue;
                    }
                };
                let mut sink = subscriber.sink.lock().await;
                sink.writer.write_array(2);
                sink.writer.write_bulk_string("pong");
                sink.writer.write_bulk_string(&message);
                let _ = sink.writer.flush().await;
            }
            "quit" => {
                {
                    let mut sink = subscriber.sink.lock().await;
                    sink.writer.write_string("OK");
                    let _ = sink.writer.flush().await;
                }
                break;
            }
            _ => {
                subscriber
                    .write_error(&format!(
                        "ERR Can't execute '{name}': only (P)SUBSCRIBE / \
                         (P)UNSUBSCRIBE / PING / QUIT are allowed in this context"
                    ))
                    .await;
            }
        }
    }

    // Client is gone: drop every entry this subscriber owns, forget it,
    // and close the socket. Engine lock first, then the sink lock.
    let mut engine = ps.engine.write().await;
    let mut sink = subscriber.sink.lock().await;
    let owned: Vec<(bool, String)> = sink.channels.drain().collect();
    for (pattern, channel) in owned {
        engine.entries.remove(&EntryKey {
            pattern,
            channel,
            subscriber_id: subscriber.id,
        });
    }
    engine.subscribers.remove(&subscriber.conn_id);
    let _ = sink.writer.shutdown().await;
    debug!(%addr, "pubsub subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keys_order_exact_before_pattern() {
        let mut keys = vec![
            EntryKey {
                pattern: true,
                channel: "a*".into(),
                subscriber_id: 1,
            },
            EntryKey {
                pattern: false,
                channel: "zchan".into(),
                subscriber_id: 1,
            },
            EntryKey {
                pattern: false,
                channel: "achan".into(),
                subscriber_id: 2,
            },
            EntryKey {
                pattern: false,
                channel: "achan".into(),
                subscriber_id: 1,
            },
        ];
        keys.sort();
        assert_eq!(
            keys.iter()
                .map(|k| (k.pattern, k.channel.as_str(), k.subscriber_id))
                .collect::<Vec<_>>(),
            vec![
                (false, "achan", 1),
                (false, "achan", 2),
                (false, "zchan", 1),
                (true, "a*", 1),
            ]
        );
    }

    #[test]
    fn range_scan_from_pivot_visits_one_channel() {
        // A scan from the (exact, channel) pivot sees exactly that
        // channel's exact entries before any pattern entry.
        let mut entries: BTreeMap<EntryKey, ()> = BTreeMap::new();
        for (pattern, channel, id) in [
            (false, "achan", 1),
            (false, "bchan", 1),
            (false, "bchan", 2),
            (false, "cchan", 3),
            (true, "b*", 1),
        ] {
            entries.insert(
                EntryKey {
                    pattern,
                    channel: channel.into(),
                    subscriber_id: id,
                },
                (),
            );
        }
        let pivot = EntryKey {
            pattern: false,
            channel: "bchan".into(),
            subscriber_id: 0,
        };
        let mut seen = Vec::new();
        for (key, _) in entries.range(pivot..) {
            if key.pattern || key.channel != "bchan" {
                break;
            }
            seen.push(key.subscriber_id);
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn glob_patterns_match_redis_style() {
        assert!(glob_match("a*", "achan"));
        assert!(glob_match("?chan", "bchan"));
        assert!(glob_match("[ab]chan", "achan"));
        assert!(glob_match("[a-c]chan", "bchan"));
        assert!(!glob_match("[ab]chan", "cchan"));
        assert!(!glob_match("a*", "bchan"));
    }
}
