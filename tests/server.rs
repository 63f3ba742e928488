use ferrokv::commands::Command;
use ferrokv::config::{Config, MasterAddr};
use ferrokv::server::{serve, ServerContext};
use ferrokv::storage::{Store, SystemClock};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    _shutdown: watch::Sender<bool>,
}

async fn start(config: Config) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ctx = ServerContext::new(config, Arc::new(SystemClock), Store::default());
    ctx.synchronizer.start().unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve(listener, Arc::clone(&ctx), shutdown_rx));

    TestServer {
        addr,
        ctx,
        _shutdown: shutdown,
    }
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ferrokv-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn command(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
    }
    out
}

/// Writes `request` and asserts the reply bytes are exactly `expected`.
async fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).await.unwrap();
    let mut reply = vec![0u8; expected.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
        .await
        .expect("timed out waiting for reply")
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&reply),
        String::from_utf8_lossy(expected)
    );
}

#[tokio::test]
async fn set_then_get() {
    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut client, &command(&["SET", "foo", "bar"]), b"+OK\r\n").await;
    roundtrip(&mut client, &command(&["GET", "foo"]), b"$3\r\nbar\r\n").await;
    roundtrip(&mut client, &command(&["GET", "missing"]), b"$-1\r\n").await;
}

#[tokio::test]
async fn repeated_set_flag_is_a_syntax_error() {
    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(
        &mut client,
        &command(&["SET", "k", "v", "NX", "NX"]),
        b"-ERR syntax error\r\n",
    )
    .await;
    roundtrip(&mut client, &command(&["GET", "k"]), b"$-1\r\n").await;
}

#[tokio::test]
async fn pipelined_commands_reply_in_order() {
    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    let mut pipeline = command(&["SET", "a", "1"]);
    pipeline.extend(command(&["GET", "a"]));
    pipeline.extend(command(&["NOSUCH", "x"]));
    pipeline.extend(command(&["DEL", "a", "b"]));
    pipeline.extend(command(&["PING"]));

    roundtrip(
        &mut client,
        &pipeline,
        b"+OK\r\n\
          $1\r\n1\r\n\
          -ERR unknown command 'NOSUCH', with args beginning with: 'x' \r\n\
          :1\r\n\
          +PONG\r\n",
    )
    .await;
}

#[tokio::test]
async fn request_split_across_writes() {
    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    let request = command(&["ECHO", "hello"]);
    let (head, tail) = request.split_at(7);
    client.write_all(head).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    roundtrip(&mut client, tail, b"$5\r\nhello\r\n").await;
}

#[tokio::test]
async fn concurrent_clients() {
    let server = start(Config::default()).await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let key = format!("key:{}", i);
            let value = format!("value:{}", i);
            for _ in 0..20 {
                roundtrip(&mut client, &command(&["SET", key.as_str(), value.as_str()]), b"+OK\r\n").await;
                let expected = format!("${}\r\n{}\r\n", value.len(), value);
                roundtrip(&mut client, &command(&["GET", key.as_str()]), expected.as_bytes()).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let mut expected = b"*16\r\n".to_vec();
    let mut keys: Vec<String> = (0..16).map(|i| format!("key:{}", i)).collect();
    keys.sort();
    for key in &keys {
        expected.extend_from_slice(format!("${}\r\n{}\r\n", key.len(), key).as_bytes());
    }
    roundtrip(&mut client, &command(&["KEYS", "key:*"]), &expected).await;
}

#[tokio::test]
async fn concurrent_writers_to_one_key_agree() {
    let server = start(Config::default()).await;

    let mut first = TcpStream::connect(server.addr).await.unwrap();
    let mut second = TcpStream::connect(server.addr).await.unwrap();

    for _ in 0..50 {
        let set_first = command(&["SET", "shared", "v1"]);
        let set_second = command(&["SET", "shared", "v2"]);
        tokio::join!(
            roundtrip(&mut first, &set_first, b"+OK\r\n"),
            roundtrip(&mut second, &set_second, b"+OK\r\n"),
        );

        let get = command(&["GET", "shared"]);
        for client in [&mut first, &mut second] {
            client.write_all(&get).await.unwrap();
        }
        let mut seen = Vec::new();
        for client in [&mut first, &mut second] {
            let mut reply = [0u8; 8];
            timeout(Duration::from_secs(2), client.read_exact(&mut reply))
                .await
                .expect("timed out waiting for reply")
                .unwrap();
            seen.push(reply);
        }

        assert_eq!(seen[0], seen[1]);
        assert!(&seen[0] == b"$2\r\nv1\r\n" || &seen[0] == b"$2\r\nv2\r\n");
    }
}

#[tokio::test]
async fn expire_time_overflow_is_rejected() {
    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(
        &mut client,
        &command(&["SET", "k", "v", "EX", "9000000000000000"]),
        b"-ERR invalid expire time in 'set' command\r\n",
    )
    .await;
    roundtrip(&mut client, &command(&["GET", "k"]), b"$-1\r\n").await;

    roundtrip(&mut client, &command(&["SET", "k", "v"]), b"+OK\r\n").await;
    roundtrip(
        &mut client,
        &command(&["EXPIRE", "k", "9000000000000000"]),
        b"-ERR invalid expire time in 'expire' command\r\n",
    )
    .await;
    roundtrip(&mut client, &command(&["TTL", "k"]), b":-1\r\n").await;
}

#[tokio::test]
async fn keys_expire() {
    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut client, &command(&["SET", "short", "v", "PX", "50"]), b"+OK\r\n").await;
    roundtrip(&mut client, &command(&["SET", "long", "v", "EX", "100"]), b"+OK\r\n").await;
    roundtrip(&mut client, &command(&["TTL", "long"]), b":100\r\n").await;

    sleep(Duration::from_millis(120)).await;

    roundtrip(&mut client, &command(&["GET", "short"]), b"$-1\r\n").await;
    roundtrip(&mut client, &command(&["PTTL", "short"]), b":-2\r\n").await;
    roundtrip(&mut client, &command(&["GET", "long"]), b"$1\r\nv\r\n").await;
}

#[tokio::test]
async fn save_and_reload() {
    let dir = temp_dir("save-reload");
    let config = Config {
        dir: dir.clone(),
        ..Config::default()
    };

    let server = start(config.clone()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();
    roundtrip(&mut client, &command(&["SET", "kept", "yes"]), b"+OK\r\n").await;
    roundtrip(&mut client, &command(&["SET", "ttl", "yes", "EX", "1000"]), b"+OK\r\n").await;
    roundtrip(&mut client, &command(&["SAVE"]), b"+OK\r\n").await;

    let restarted = start(config).await;
    let snapshot = restarted.ctx.persistence.load().unwrap().unwrap();
    restarted
        .ctx
        .synchronizer
        .post_and_wait(vec![Command::Restore(snapshot)])
        .await
        .unwrap();

    let mut client = TcpStream::connect(restarted.addr).await.unwrap();
    roundtrip(&mut client, &command(&["GET", "kept"]), b"$3\r\nyes\r\n").await;
    roundtrip(&mut client, &command(&["TTL", "kept"]), b":-1\r\n").await;
    roundtrip(&mut client, &command(&["GET", "ttl"]), b"$3\r\nyes\r\n").await;

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn replica_rejects_client_writes() {
    // Nothing listens on the master port, so the link fails but the role stays
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master_port = unused.local_addr().unwrap().port();
    drop(unused);

    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    let port = master_port.to_string();
    roundtrip(
        &mut client,
        &command(&["REPLICAOF", "127.0.0.1", port.as_str()]),
        b"+OK\r\n",
    )
    .await;
    roundtrip(
        &mut client,
        &command(&["SET", "k", "v"]),
        b"-READONLY You can't write against a read only replica.\r\n",
    )
    .await;
    roundtrip(&mut client, &command(&["GET", "k"]), b"$-1\r\n").await;
    assert_eq!(
        server.ctx.replication.status().master,
        Some(MasterAddr {
            host: "127.0.0.1".to_string(),
            port: master_port,
        })
    );

    roundtrip(&mut client, &command(&["REPLICAOF", "NO", "ONE"]), b"+OK\r\n").await;
    roundtrip(&mut client, &command(&["SET", "k", "v"]), b"+OK\r\n").await;
}

#[tokio::test]
async fn protocol_error_closes_connection() {
    let server = start(Config::default()).await;
    let mut client = TcpStream::connect(server.addr).await.unwrap();

    client.write_all(b"*1\r\n$abc\r\n").await.unwrap();
    let mut reply = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();

    assert!(reply.starts_with(b"-ERR Protocol error: "));

    // Other clients are unaffected
    let mut other = TcpStream::connect(server.addr).await.unwrap();
    roundtrip(&mut other, &command(&["PING"]), b"+PONG\r\n").await;
}
