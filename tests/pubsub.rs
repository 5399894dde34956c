use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use resplex::{async_trait, Command, Connection, Handler, PubSub, Server};

struct Broker {
    ps: PubSub,
}

#[async_trait]
impl Handler for Broker {
    async fn serve(&self, conn: &mut Connection, cmd: Command) {
        let name = String::from_utf8_lossy(&cmd.args[0]).into_owned();
        match name.to_lowercase().as_str() {
            "publish" => {
                if cmd.args.len() != 3 {
                    conn.write_error(&format!(
                        "ERR wrong number of arguments for '{name}' command"
                    ));
                    return;
                }
                let channel = String::from_utf8_lossy(&cmd.args[1]).into_owned();
                let message = String::from_utf8_lossy(&cmd.args[2]).into_owned();
                let count = self.ps.publish(&channel, &message).await;
                conn.write_int(count as i64);
            }
            "subscribe" | "psubscribe" => {
                if cmd.args.len() < 2 {
                    conn.write_error(&format!(
                        "ERR wrong number of arguments for '{name}' command"
                    ));
                    return;
                }
                for arg in &cmd.args[1..] {
                    let channel = String::from_utf8_lossy(arg).into_owned();
                    if name.eq_ignore_ascii_case("psubscribe") {
                        self.ps.psubscribe(conn, &channel).await;
                    } else {
                        self.ps.subscribe(conn, &channel).await;
                    }
                }
            }
            _ => conn.write_error(&format!("ERR unknown command '{name}'")),
        }
    }
}

async fn start_broker() -> (String, Server) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Server::new(Broker { ps: PubSub::new() });
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    sleep(Duration::from_millis(20)).await;
    (addr, server)
}

async fn read_some(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    buf.truncate(n);
    buf
}

async fn expect_reply(stream: &mut TcpStream, req: &[u8], want: &[u8]) {
    stream.write_all(req).await.unwrap();
    let mut got = Vec::new();
    while got.len() < want.len() {
        let chunk = read_some(stream).await;
        assert!(!chunk.is_empty(), "peer closed while waiting for {want:?}");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, want);
}

#[tokio::test]
async fn subscribe_publish_delivers_exact_bytes() {
    let (addr, server) = start_broker().await;

    let mut subscriber = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut subscriber,
        b"SUBSCRIBE ch1\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n",
    )
    .await;

    let mut publisher = TcpStream::connect(&addr).await.unwrap();
    expect_reply(&mut publisher, b"PUBLISH ch1 hi\r\n", b":1\r\n").await;

    let message = read_some(&mut subscriber).await;
    assert_eq!(message, b"*3\r\n$7\r\nmessage\r\n$3\r\nch1\r\n$2\r\nhi\r\n");

    server.close().unwrap();
}

#[tokio::test]
async fn subscription_counts_track_kind_separately() {
    let (addr, server) = start_broker().await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut client,
        b"SUBSCRIBE achan\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$5\r\nachan\r\n:1\r\n",
    )
    .await;
    // A second subscribe arrives through the subscriber's own loop.
    expect_reply(
        &mut client,
        b"SUBSCRIBE bchan\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$5\r\nbchan\r\n:2\r\n",
    )
    .await;
    // Pattern subscriptions are counted independently.
    expect_reply(
        &mut client,
        b"PSUBSCRIBE a*\r\n",
        b"*3\r\n$10\r\npsubscribe\r\n$2\r\na*\r\n:1\r\n",
    )
    .await;

    server.close().unwrap();
}

#[tokio::test]
async fn pattern_subscribers_get_pmessage() {
    let (addr, server) = start_broker().await;

    let mut subscriber = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut subscriber,
        b"PSUBSCRIBE ch*\r\n",
        b"*3\r\n$10\r\npsubscribe\r\n$3\r\nch*\r\n:1\r\n",
    )
    .await;

    let mut publisher = TcpStream::connect(&addr).await.unwrap();
    expect_reply(&mut publisher, b"PUBLISH ch1 hi\r\n", b":1\r\n").await;

    let message = read_some(&mut subscriber).await;
    assert_eq!(
        message,
        b"*4\r\n$8\r\npmessage\r\n$3\r\nch*\r\n$3\r\nch1\r\n$2\r\nhi\r\n"
    );

    // A non-matching channel is not delivered and counts zero.
    expect_reply(&mut publisher, b"PUBLISH other hi\r\n", b":0\r\n").await;

    server.close().unwrap();
}

#[tokio::test]
async fn exact_subscribers_are_delivered_before_pattern_subscribers() {
    let (addr, server) = start_broker().await;

    // One connection holds both an exact and a pattern subscription that
    // match the same channel; it receives message before pmessage.
    let mut subscriber = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut subscriber,
        b"SUBSCRIBE ch1\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n",
    )
    .await;
    expect_reply(
        &mut subscriber,
        b"PSUBSCRIBE ch?\r\n",
        b"*3\r\n$10\r\npsubscribe\r\n$3\r\nch?\r\n:1\r\n",
    )
    .await;

    let mut publisher = TcpStream::connect(&addr).await.unwrap();
    expect_reply(&mut publisher, b"PUBLISH ch1 hi\r\n", b":2\r\n").await;

    let want: &[u8] = b"*3\r\n$7\r\nmessage\r\n$3\r\nch1\r\n$2\r\nhi\r\n\
                        *4\r\n$8\r\npmessage\r\n$3\r\nch?\r\n$3\r\nch1\r\n$2\r\nhi\r\n";
    let mut got = Vec::new();
    while got.len() < want.len() {
        let chunk = read_some(&mut subscriber).await;
        assert!(!chunk.is_empty());
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, want);

    server.close().unwrap();
}

#[tokio::test]
async fn unsubscribe_acknowledges_with_remaining_count() {
    let (addr, server) = start_broker().await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut client,
        b"SUBSCRIBE achan bchan\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$5\r\nachan\r\n:1\r\n\
          *3\r\n$9\r\nsubscribe\r\n$5\r\nbchan\r\n:2\r\n",
    )
    .await;
    expect_reply(
        &mut client,
        b"UNSUBSCRIBE achan\r\n",
        b"*3\r\n$11\r\nunsubscribe\r\n$5\r\nachan\r\n:1\r\n",
    )
    .await;
    // Bulk unsubscribe with nothing left of the pattern kind answers a
    // single null-channel acknowledgment.
    expect_reply(
        &mut client,
        b"PUNSUBSCRIBE\r\n",
        b"*3\r\n$12\r\npunsubscribe\r\n$-1\r\n:0\r\n",
    )
    .await;

    server.close().unwrap();
}

#[tokio::test]
async fn subscriber_loop_restricts_commands() {
    let (addr, server) = start_broker().await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut client,
        b"SUBSCRIBE ch1\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n",
    )
    .await;
    expect_reply(
        &mut client,
        b"GET foo\r\n",
        b"-ERR Can't execute 'GET': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context\r\n",
    )
    .await;

    server.close().unwrap();
}

#[tokio::test]
async fn ping_inside_subscription_replies_pong_array() {
    let (addr, server) = start_broker().await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut client,
        b"SUBSCRIBE ch1\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n",
    )
    .await;
    expect_reply(
        &mut client,
        b"PING\r\n",
        b"*2\r\n$4\r\npong\r\n$0\r\n\r\n",
    )
    .await;
    expect_reply(
        &mut client,
        b"PING hello\r\n",
        b"*2\r\n$4\r\npong\r\n$5\r\nhello\r\n",
    )
    .await;
    expect_reply(
        &mut client,
        b"PING a b\r\n",
        b"-ERR wrong number of arguments for 'PING'\r\n",
    )
    .await;

    server.close().unwrap();
}

#[tokio::test]
async fn quit_inside_subscription_closes_the_connection() {
    let (addr, server) = start_broker().await;

    let mut client = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut client,
        b"SUBSCRIBE ch1\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n",
    )
    .await;
    expect_reply(&mut client, b"QUIT\r\n", b"+OK\r\n").await;
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);

    server.close().unwrap();
}

#[tokio::test]
async fn disconnect_removes_all_subscriptions() {
    let (addr, server) = start_broker().await;

    let mut subscriber = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut subscriber,
        b"SUBSCRIBE ch1\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n",
    )
    .await;
    drop(subscriber);
    sleep(Duration::from_millis(50)).await;

    let mut publisher = TcpStream::connect(&addr).await.unwrap();
    expect_reply(&mut publisher, b"PUBLISH ch1 hi\r\n", b":0\r\n").await;

    server.close().unwrap();
}

#[tokio::test]
async fn pipelined_subscribes_reach_the_subscriber_loop() {
    let (addr, server) = start_broker().await;

    // Both SUBSCRIBE commands arrive in one read: the first detaches the
    // connection, the second is handed over with the detached pipeline.
    let mut client = TcpStream::connect(&addr).await.unwrap();
    expect_reply(
        &mut client,
        b"SUBSCRIBE achan\r\nSUBSCRIBE bchan\r\n",
        b"*3\r\n$9\r\nsubscribe\r\n$5\r\nachan\r\n:1\r\n\
          *3\r\n$9\r\nsubscribe\r\n$5\r\nbchan\r\n:2\r\n",
    )
    .await;

    server.close().unwrap();
}
