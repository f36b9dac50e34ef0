use crate::{CommitStatus, Store, StoreError, Write};
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use std::fmt;
use tracing::{debug, instrument};

/// One dedicated connection to a Redis server.
///
/// `WATCH` state lives on the server side of a connection, so a
/// `RedisConnection` must never be shared by two sessions at once. The
/// [`Pool`](crate::Pool) hands each caller its own and only takes it back
/// when the connection is left in a clean state.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    /// `WATCH` was issued and not yet released by `EXEC` or `UNWATCH`.
    watching: bool,
    /// A request was written but its reply never read, i.e. the caller's
    /// future was dropped mid-call.
    in_flight: bool,
}

impl RedisConnection {
    pub(crate) fn new(conn: MultiplexedConnection) -> RedisConnection {
        RedisConnection {
            conn,
            watching: false,
            in_flight: false,
        }
    }

    /// Whether the connection can be handed to another caller unchanged.
    pub fn is_reusable(&self) -> bool {
        !self.watching && !self.in_flight
    }

    /// Send a single command and wait for the reply.
    pub async fn query<T: FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        self.in_flight = true;
        let res = cmd.query_async(&mut self.conn).await;
        self.in_flight = false;

        Ok(res?)
    }

    /// Send a pipeline in one round trip and wait for every reply.
    pub async fn query_pipeline<T: FromRedisValue>(&mut self, pipe: &redis::Pipeline) -> Result<T, StoreError> {
        self.in_flight = true;
        let res = pipe.query_async(&mut self.conn).await;
        self.in_flight = false;

        Ok(res?)
    }
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("watching", &self.watching)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl Store for RedisConnection {
    #[instrument(skip(self))]
    async fn watch(&mut self, keys: &[String]) -> Result<(), StoreError> {
        // `WATCH` without arguments is a syntax error.
        if keys.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("WATCH");
        cmd.arg(keys);
        let () = self.query(&cmd).await?;
        self.watching = true;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&mut self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<Vec<u8>> = self.query(&cmd).await?;
        debug!(found = value.is_some());

        Ok(value.map(Bytes::from))
    }

    /// `MULTI`, the queued writes and `EXEC`, in one round trip.
    ///
    /// A nil reply to `EXEC` is the server reporting that a watched key
    /// changed.
    #[instrument(skip(self, writes), fields(writes = writes.len()))]
    async fn exec(&mut self, writes: &[Write]) -> Result<CommitStatus, StoreError> {
        let reply: Option<()> = if writes.is_empty() {
            // An empty pipeline is answered locally without reaching the
            // server, so the watch would neither be checked nor released.
            let () = self.query(&redis::cmd("MULTI")).await?;
            self.query(&redis::cmd("EXEC")).await?
        } else {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for write in writes {
                match write {
                    Write::Set { key, value } => pipe.cmd("SET").arg(key).arg(&value[..]).ignore(),
                    Write::Delete { key } => pipe.cmd("DEL").arg(key).ignore(),
                    Write::Expire { key, ttl } => pipe
                        .cmd("PEXPIRE")
                        .arg(key)
                        .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
                        .ignore(),
                };
            }
            self.query_pipeline(&pipe).await?
        };
        self.watching = false;

        let status = match reply {
            Some(()) => CommitStatus::Committed,
            None => CommitStatus::Conflict,
        };
        debug!(?status);

        Ok(status)
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        let () = self.query(&redis::cmd("UNWATCH")).await?;
        self.watching = false;

        Ok(())
    }
}
