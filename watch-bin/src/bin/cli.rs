#![warn(clippy::pedantic)]

use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::num::ParseIntError;
use std::str;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use watch_lib::client::ScoredMember;
use watch_lib::counter::{self, DEFAULT_TASKS};
use watch_lib::pool::DEFAULT_POOL_SIZE;
use watch_lib::{
    Backoff, Client, ConnectOptions, DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT, MemoryStore, Pool, SessionSource, Store,
    TransactionRunner,
};

#[cfg(not(feature = "console"))]
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "watch-cli", version, author, about = "Run Redis transaction demonstrations")]
struct CliCommand {
    #[clap(subcommand)]
    sub_cmd: Command,

    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[clap(long)]
    password: Option<String>,

    #[clap(long, default_value_t = 0)]
    db: i64,

    #[clap(long, default_value_t = DEFAULT_POOL_SIZE)]
    pool_size: usize,

    /// Use a store inside this process instead of a server.
    /// Only `get`, `set` and `incr` support it.
    #[clap(long)]
    in_memory: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping {
        echo: Option<Bytes>,
    },
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Bytes,
        /// Time to live in milliseconds.
        #[clap(value_parser = duration_from)]
        expires: Option<Duration>,
    },
    /// `SET`, then `GET` of a present and an absent key.
    Strings,
    /// Rank languages in a sorted set.
    Zset {
        #[clap(default_value = "language_rank")]
        key: String,
    },
    /// Store a user record in a hash and read it back.
    Hash {
        #[clap(default_value = "user:2:info")]
        key: String,
    },
    /// Several `SET`s in one round trip.
    Pipeline,
    /// `INCR` and `EXPIRE` inside `MULTI`/`EXEC`.
    Tx {
        #[clap(default_value = "tx_pipeline_counter")]
        key: String,
    },
    /// Concurrent optimistic increments of one counter.
    Incr {
        #[clap(default_value = "counter3")]
        key: String,

        #[clap(long, default_value_t = DEFAULT_TASKS)]
        tasks: usize,

        /// Attempts per increment before giving up.
        #[clap(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        attempts: u32,

        /// Base delay between conflicting attempts. No delay if unset.
        #[clap(long, value_parser = duration_from)]
        backoff_ms: Option<Duration>,

        /// Bound on each increment, retries included.
        #[clap(long, value_parser = duration_from)]
        deadline_ms: Option<Duration>,
    },
}

fn duration_from(src: &str) -> Result<Duration, ParseIntError> {
    let ms = src.parse::<u64>()?;
    Ok(Duration::from_millis(ms))
}

/// `flavor = "current_thread"` is enough, the demos are I/O bound.
#[tokio::main(flavor = "current_thread")]
async fn main() -> watch_lib::Result<()> {
    set_up_logging()?;

    let cmd = CliCommand::parse();

    if cmd.in_memory {
        return run_in_memory(cmd.sub_cmd).await;
    }

    let options = ConnectOptions {
        host: cmd.host,
        port: cmd.port,
        password: cmd.password,
        db: cmd.db,
        pool_size: cmd.pool_size,
    };
    let pool_size = options.pool_size;
    let pool = Arc::new(watch_lib::connect(options).await?);
    info!(pool_size, "connect redis success");

    let res = run_remote(&pool, cmd.sub_cmd).await;

    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.close();
    }
    res
}

async fn run_remote(pool: &Arc<Pool>, sub_cmd: Command) -> watch_lib::Result<()> {
    match sub_cmd {
        Command::Ping { echo } => {
            let bytes = checkout(pool).await?.ping(echo).await?;
            print_bytes(&bytes);
        }
        Command::Get { key } => match checkout(pool).await?.get(&key).await? {
            Some(bytes) => print_bytes(&bytes),
            None => println!("(nil)"),
        },
        Command::Set { key, value, expires } => {
            let mut client = checkout(pool).await?;
            match expires {
                Some(expires) => client.set_expires(&key, value, expires).await?,
                None => client.set(&key, value).await?,
            }
            println!("OK");
        }
        Command::Strings => strings(&mut checkout(pool).await?).await?,
        Command::Zset { key } => zset(&mut checkout(pool).await?, &key).await?,
        Command::Hash { key } => hash(&mut checkout(pool).await?, &key).await?,
        Command::Pipeline => {
            checkout(pool)
                .await?
                .pipeline_set(&[
                    ("score3", Bytes::from("100")),
                    ("score4", Bytes::from("200")),
                    ("pipelined1", Bytes::from("10")),
                    ("pipelined2", Bytes::from("20")),
                ])
                .await?;
            println!("pipelined success...");
        }
        Command::Tx { key } => {
            let value = checkout(pool)
                .await?
                .incr_expire(&key, Duration::from_secs(60 * 60))
                .await?;
            println!("{value}");
        }
        Command::Incr {
            key,
            tasks,
            attempts,
            backoff_ms,
            deadline_ms,
        } => {
            let runner = runner(attempts, backoff_ms);
            watch_increment(pool.clone(), runner, &key, tasks, deadline_ms).await?;
        }
    }

    Ok(())
}

/// A client on its own pooled connection.
async fn checkout(pool: &Pool) -> watch_lib::Result<Client> {
    Ok(Client::new(pool.get().await?))
}

async fn run_in_memory(sub_cmd: Command) -> watch_lib::Result<()> {
    let store = Arc::new(MemoryStore::new());

    match sub_cmd {
        Command::Get { key } => match store.get(&key) {
            Some(bytes) => print_bytes(&bytes),
            None => println!("(nil)"),
        },
        Command::Set { key, value, expires } => {
            match expires {
                Some(expires) => store.set_expires(key, value, expires),
                None => store.set(key, value),
            }
            println!("OK");
        }
        Command::Incr {
            key,
            tasks,
            attempts,
            backoff_ms,
            deadline_ms,
        } => {
            let runner = runner(attempts, backoff_ms);
            watch_increment(store, runner, &key, tasks, deadline_ms).await?;
        }
        other => return Err(format!("{other:?} needs a server, drop --in-memory").into()),
    }

    Ok(())
}

fn runner(attempts: u32, backoff: Option<Duration>) -> TransactionRunner {
    let runner = TransactionRunner::new(attempts);
    match backoff {
        Some(base) => runner.with_backoff(Backoff::exponential(base, base * 64)),
        None => runner,
    }
}

/// Increment `key` from `tasks` tasks at once, then read it back.
async fn watch_increment<P: SessionSource>(
    source: Arc<P>,
    runner: TransactionRunner,
    key: &str,
    tasks: usize,
    deadline: Option<Duration>,
) -> watch_lib::Result<()> {
    let report = counter::increment_concurrently(source.clone(), runner, key, tasks, deadline).await?;
    for err in &report.failed {
        println!("increment err: {err}");
    }

    let mut session = source.session().await?;
    match session.get(key).await {
        Ok(Some(value)) => println!("ended with {}", String::from_utf8_lossy(&value)),
        Ok(None) => println!("ended with (nil)"),
        Err(err) => println!("ended with error: {err}"),
    }

    Ok(())
}

async fn strings(client: &mut Client) -> watch_lib::Result<()> {
    client.set("counter3", Bytes::from("0")).await?;

    match client.get("score").await? {
        Some(val) => println!("score: {}", String::from_utf8_lossy(&val)),
        None => println!("score does not exist"),
    }
    match client.get("score2").await? {
        Some(val) => println!("score2: {}", String::from_utf8_lossy(&val)),
        None => println!("score2 does not exist"),
    }

    Ok(())
}

async fn zset(client: &mut Client, key: &str) -> watch_lib::Result<()> {
    let languages: Vec<ScoredMember> = [
        ("Golang", 90.0),
        ("Java", 98.0),
        ("Python", 95.0),
        ("JavaScript", 97.0),
        ("C/C++", 99.0),
        ("Rust", 100.0),
    ]
    .into_iter()
    .map(|(member, score)| ScoredMember {
        member: member.to_string(),
        score,
    })
    .collect();

    let added = client.zadd(key, &languages).await?;
    println!("zadd {added} success.");

    let score = client.zincrby(key, 10.0, "Golang").await?;
    println!("Golang's score is {score} now.");

    // top three
    for entry in client.zrevrange_with_scores(key, 0, 2).await? {
        println!("{} {}", entry.member, entry.score);
    }

    for entry in client.zrange_by_score_with_scores(key, "97", "100").await? {
        println!("{} {}", entry.member, entry.score);
    }

    Ok(())
}

async fn hash(client: &mut Client, key: &str) -> watch_lib::Result<()> {
    client.hset(key, "name", Bytes::from("Sandy")).await?;
    client.hset(key, "age", Bytes::from("20")).await?;

    let all = client.hgetall(key).await?;
    println!("{key}: {all:?}");

    let some = client.hmget(key, &["name", "age"]).await?;
    println!("{some:?}");

    match client.hget(key, "age").await? {
        Some(age) => println!("{age}"),
        None => println!("(nil)"),
    }

    Ok(())
}

fn print_bytes(bytes: &Bytes) {
    if let Ok(string) = str::from_utf8(bytes) {
        println!("\"{string}\"");
    } else {
        println!("{bytes:?}");
    }
}

/// cargo install --locked tokio-console
///
/// build with: RUSTFLAGS="--cfg tokio_unstable" cargo build --features console
#[cfg(feature = "console")]
fn set_up_logging() -> watch_lib::Result<()> {
    console_subscriber::init();
    Ok(())
}

#[cfg(not(feature = "console"))]
fn set_up_logging() -> watch_lib::Result<()> {
    // `RUST_LOG=watch_lib=debug` shows every attempt.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::Layer::default())
        .try_init()?;
    Ok(())
}
