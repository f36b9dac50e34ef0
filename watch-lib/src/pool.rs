//! A bounded set of dedicated Redis connections.
//!
//! Every checkout gets a connection nobody else is using, because watched
//! keys are tracked per connection by the server. Connections go back to
//! the idle list on drop unless they may still carry session state.

use crate::{CommitStatus, DEFAULT_PORT, RedisConnection, SessionSource, Store, StoreError, Write};
use bytes::Bytes;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument};

/// Connection pool size used by [`ConnectOptions::default`].
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Where and how to reach the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database selected on every connection.
    pub db: i64,
    /// Maximum number of connections open at once.
    pub pool_size: usize,
}

/// Handle to the pool. Dropping it, or calling [`close`](Pool::close),
/// releases the idle connections.
#[derive(Debug)]
pub struct Pool {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    client: redis::Client,
    idle: Mutex<Vec<RedisConnection>>,
    /// One permit per connection that may be open.
    limit_connections: Arc<Semaphore>,
}

/// A connection checked out of a [`Pool`].
pub struct PooledConnection {
    /// Only `None` while being dropped.
    conn: Option<RedisConnection>,
    pool: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: 0,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl ConnectOptions {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }
}

/// Open a pool and check the store answers `PING`.
///
/// # Errors
///
/// [`StoreError::Connection`] if the server cannot be reached or rejects
/// the credentials.
#[instrument(skip_all, fields(host = %options.host, port = options.port))]
pub async fn connect(options: ConnectOptions) -> Result<Pool, StoreError> {
    let client = redis::Client::open(options.connection_info()).map_err(StoreError::connection)?;

    let pool = Pool {
        shared: Arc::new(Shared {
            client,
            idle: Mutex::new(Vec::new()),
            limit_connections: Arc::new(Semaphore::new(options.pool_size.max(1))),
        }),
    };

    let mut conn = pool.get().await?;
    let pong: String = conn
        .query(&redis::cmd("PING"))
        .await
        .map_err(StoreError::into_connection)?;
    drop(conn);
    info!(%pong, "connected");

    Ok(pool)
}

impl Pool {
    /// Check out a connection, opening a new one if none is idle. Waits while
    /// `pool_size` connections are in use.
    pub async fn get(&self) -> Result<PooledConnection, StoreError> {
        let permit = self
            .shared
            .limit_connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::connection("connection pool is closed"))?;

        let idle = self.shared.idle.lock().unwrap().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                debug!("opening a new connection");
                let conn = self
                    .shared
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(StoreError::connection)?;
                RedisConnection::new(conn)
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.shared.clone(),
            _permit: permit,
        })
    }

    /// Number of open connections waiting to be checked out.
    pub fn idle_connections(&self) -> usize {
        self.shared.idle.lock().unwrap().len()
    }

    /// Close the pool: pending and future checkouts fail, idle connections
    /// are released, and checked-out ones are released when dropped.
    pub fn close(self) {
        self.shared.limit_connections.close();
        let released = std::mem::take(&mut *self.shared.idle.lock().unwrap());
        debug!(connections = released.len(), "pool closed");
    }
}

impl SessionSource for Pool {
    type Session = PooledConnection;

    async fn session(&self) -> Result<PooledConnection, StoreError> {
        self.get().await
    }
}

impl PooledConnection {
    fn conn(&mut self) -> &mut RedisConnection {
        self.conn.as_mut().expect("connection is only taken on drop")
    }

    /// Send a single command on this connection.
    pub async fn query<T: redis::FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        self.conn().query(cmd).await
    }

    /// Send a pipeline on this connection.
    pub async fn query_pipeline<T: redis::FromRedisValue>(&mut self, pipe: &redis::Pipeline) -> Result<T, StoreError> {
        self.conn().query_pipeline(pipe).await
    }
}

impl Store for PooledConnection {
    async fn watch(&mut self, keys: &[String]) -> Result<(), StoreError> {
        self.conn().watch(keys).await
    }

    async fn get(&mut self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.conn().get(key).await
    }

    async fn exec(&mut self, writes: &[Write]) -> Result<CommitStatus, StoreError> {
        self.conn().exec(writes).await
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        self.conn().unwatch().await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if conn.is_reusable() && !self.pool.limit_connections.is_closed() {
            self.pool.idle.lock().unwrap().push(conn);
        } else {
            // Possibly mid-transaction on the server; nobody else may inherit that.
            debug!("discarding connection");
        }
    }
}
