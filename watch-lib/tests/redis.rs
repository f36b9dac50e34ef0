//! The Redis-backed store against a minimal in-process RESP responder.
//!
//! The responder understands just enough of the protocol to script `EXEC`
//! replies: a nil array (a watched key changed), a normal reply, or none at
//! all.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use watch_lib::{Client, CommitStatus, ConnectOptions, Store, StoreError, TransactionRunner, TxError, Write};

/// How the responder answers the next `EXEC`. Without a scripted entry it
/// commits.
#[derive(Debug, Clone, Copy)]
enum Exec {
    Nil,
    Stall,
}

#[derive(Debug, Default)]
struct Script {
    exec: VecDeque<Exec>,
    ping_error: bool,
    log: Vec<Vec<String>>,
}

struct FakeRedis {
    port: u16,
    script: Arc<Mutex<Script>>,
}

impl FakeRedis {
    async fn start(script: Script) -> FakeRedis {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let script = Arc::new(Mutex::new(script));

        let shared = script.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, shared.clone()));
            }
        });

        FakeRedis { port, script }
    }

    fn options(&self) -> ConnectOptions {
        ConnectOptions {
            port: self.port,
            ..ConnectOptions::default()
        }
    }

    /// Every command received so far, excluding the connection handshake.
    fn commands(&self) -> Vec<Vec<String>> {
        self.script
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|cmd| !matches!(cmd[0].as_str(), "CLIENT" | "SELECT" | "PING"))
            .cloned()
            .collect()
    }
}

async fn serve(socket: TcpStream, script: Arc<Mutex<Script>>) {
    let (read, mut write) = socket.into_split();
    let mut read = BufReader::new(read);
    let mut queued: Option<usize> = None;

    while let Some(cmd) = read_command(&mut read).await {
        let name = cmd[0].to_ascii_uppercase();

        let reply = {
            let mut script = script.lock().unwrap();
            script.log.push(cmd);

            match (name.as_str(), queued) {
                ("EXEC", Some(n)) => {
                    queued = None;
                    match script.exec.pop_front() {
                        Some(Exec::Nil) => "*-1\r\n".to_string(),
                        Some(Exec::Stall) => String::new(),
                        None => format!("*{}\r\n{}", n, "+OK\r\n".repeat(n)),
                    }
                }
                (_, Some(n)) => {
                    queued = Some(n + 1);
                    "+QUEUED\r\n".to_string()
                }
                ("MULTI", None) => {
                    queued = Some(0);
                    "+OK\r\n".to_string()
                }
                ("PING", None) if script.ping_error => "-ERR not today\r\n".to_string(),
                ("PING", None) => "+PONG\r\n".to_string(),
                ("GET", None) => "$-1\r\n".to_string(),
                _ => "+OK\r\n".to_string(),
            }
        };

        if reply.is_empty() {
            // Keep the socket open and never answer.
            std::future::pending::<()>().await;
        }
        if write.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// One command sent as an array of bulk strings.
async fn read_command(read: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
    let mut line = String::new();
    if read.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        read.read_line(&mut line).await.ok()?;
        let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;

        let mut buf = vec![0; len + 2];
        read.read_exact(&mut buf).await.ok()?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }

    Some(args)
}

fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|key| key.to_string()).collect()
}

fn names(commands: &[Vec<String>]) -> Vec<&str> {
    commands.iter().map(|cmd| cmd[0].as_str()).collect()
}

#[tokio::test]
async fn nil_exec_reply_is_a_conflict() {
    let fake = FakeRedis::start(Script {
        exec: VecDeque::from([Exec::Nil]),
        ..Script::default()
    })
    .await;
    let pool = watch_lib::connect(fake.options()).await.unwrap();
    let mut conn = pool.get().await.unwrap();

    conn.watch(&keys(&["k"])).await.unwrap();
    let status = conn.exec(&[Write::set("k", "v")]).await.unwrap();
    assert_eq!(status, CommitStatus::Conflict);

    conn.watch(&keys(&["k"])).await.unwrap();
    let status = conn.exec(&[Write::set("k", "v")]).await.unwrap();
    assert_eq!(status, CommitStatus::Committed);

    assert_eq!(
        names(&fake.commands()),
        ["WATCH", "MULTI", "SET", "EXEC", "WATCH", "MULTI", "SET", "EXEC"]
    );
}

#[tokio::test]
async fn empty_commit_still_sends_multi_exec() {
    let fake = FakeRedis::start(Script::default()).await;
    let pool = watch_lib::connect(fake.options()).await.unwrap();
    let mut conn = pool.get().await.unwrap();

    conn.watch(&keys(&["k"])).await.unwrap();
    assert_eq!(conn.exec(&[]).await.unwrap(), CommitStatus::Committed);

    assert_eq!(
        fake.commands(),
        [
            vec!["WATCH".to_string(), "k".to_string()],
            vec!["MULTI".to_string()],
            vec!["EXEC".to_string()],
        ]
    );

    // `EXEC` released the watch, so the connection is clean again.
    drop(conn);
    assert_eq!(pool.idle_connections(), 1);
}

#[tokio::test]
async fn runner_retries_after_nil_exec() {
    let fake = FakeRedis::start(Script {
        exec: VecDeque::from([Exec::Nil]),
        ..Script::default()
    })
    .await;
    let pool = watch_lib::connect(fake.options()).await.unwrap();

    let mut client = Client::new(pool.get().await.unwrap());
    assert_eq!(client.ping(None).await.unwrap(), Bytes::from("PONG"));
    let mut conn = client.into_inner();

    let committed = TransactionRunner::new(3)
        .run(&mut conn, &keys(&["counter"]), |snapshot| {
            Ok(vec![Write::set("counter", (snapshot.int("counter")? + 1).to_string())])
        })
        .await
        .unwrap();

    assert_eq!(committed.attempts, 2);
    assert_eq!(committed.values.get("counter"), Some(&Bytes::from("1")));

    drop(conn);
    assert_eq!(pool.idle_connections(), 1);
}

#[tokio::test]
async fn canceled_commit_discards_connection() {
    let fake = FakeRedis::start(Script {
        exec: VecDeque::from([Exec::Stall]),
        ..Script::default()
    })
    .await;
    let pool = watch_lib::connect(fake.options()).await.unwrap();
    assert_eq!(pool.idle_connections(), 1);

    let mut conn = pool.get().await.unwrap();
    let res = TransactionRunner::new(3)
        .run_with_deadline(
            &mut conn,
            &keys(&["k"]),
            |_| Ok(vec![Write::set("k", "v")]),
            Duration::from_millis(200),
        )
        .await;
    assert!(matches!(res, Err(TxError::Canceled)));

    // The reply to `EXEC` is still owed; nobody else may read it.
    drop(conn);
    assert_eq!(pool.idle_connections(), 0);
}

#[tokio::test]
async fn watching_connection_is_not_reused() {
    let fake = FakeRedis::start(Script::default()).await;
    let pool = watch_lib::connect(fake.options()).await.unwrap();

    let mut conn = pool.get().await.unwrap();
    conn.watch(&keys(&["k"])).await.unwrap();
    drop(conn);
    assert_eq!(pool.idle_connections(), 0);

    let mut conn = pool.get().await.unwrap();
    conn.watch(&keys(&["k"])).await.unwrap();
    conn.unwatch().await.unwrap();
    drop(conn);
    assert_eq!(pool.idle_connections(), 1);

    pool.close();
}

#[tokio::test]
async fn failed_handshake_is_a_connection_error() {
    let fake = FakeRedis::start(Script {
        ping_error: true,
        ..Script::default()
    })
    .await;

    let err = watch_lib::connect(fake.options()).await.unwrap_err();
    assert!(err.is_connection(), "{err}");
}

#[tokio::test]
async fn refused_port_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = watch_lib::connect(ConnectOptions {
        port,
        ..ConnectOptions::default()
    })
    .await
    .unwrap_err();

    assert!(matches!(err, StoreError::Connection(_)));
}
