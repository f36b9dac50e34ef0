//! Optimistic-concurrency transactions against a remote key-value store.
//!
//! The major components are:
//! * `store`: the capability interface (`WATCH`, `GET`, conditional `EXEC`).
//! * `session`: one watch-read-commit attempt.
//! * `runner`: the bounded retry loop around sessions.
//! * `memory`: an in-process store, used by the tests and `--in-memory` runs.
//! * `pool` / `connection`: dedicated Redis connections via the `redis` crate.
//! * `client`: thin typed helpers for strings, sorted sets, hashes and pipelines.
//! * `counter`: the concurrent watch-increment demonstration.

#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

mod backoff;
pub use backoff::Backoff;

pub mod client;
pub use client::Client;

mod connection;
pub use connection::RedisConnection;

pub mod counter;

mod error;
pub use error::{StoreError, TxError};

pub mod memory;
pub use memory::{MemorySession, MemoryStore};

pub mod pool;
pub use pool::{ConnectOptions, Pool, PooledConnection, connect};

mod runner;
pub use runner::{Committed, DEFAULT_MAX_ATTEMPTS, TransactionRunner};

mod session;
pub use session::ConditionalSession;

mod snapshot;
pub use snapshot::Snapshot;

mod store;
pub use store::{CommitStatus, SessionSource, Store, Write};

/// Default port that a redis server listens on.
pub const DEFAULT_PORT: u16 = 6379;

/// simple Error for everything outside the transaction path.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;
