//! Typed helpers for the commands the demonstrations use.
//!
//! Each method builds one command (or one pipeline), sends it over a
//! dedicated pooled connection and decodes the reply. There is no logic
//! beyond that; the interesting part of the crate is the transaction runner.

use crate::{PooledConnection, Store};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// Backed by a single dedicated connection checked out of a [`Pool`](crate::Pool).
pub struct Client {
    connection: PooledConnection,
}

/// A sorted set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl Client {
    pub fn new(connection: PooledConnection) -> Client {
        Client { connection }
    }

    /// Give the connection back, e.g. to run a transaction on it.
    pub fn into_inner(self) -> PooledConnection {
        self.connection
    }

    /// Ping the server. Returns `PONG`, or `msg` if one was given.
    #[instrument(skip(self))]
    pub async fn ping(&mut self, msg: Option<Bytes>) -> crate::Result<Bytes> {
        let mut cmd = redis::cmd("PING");
        if let Some(msg) = &msg {
            cmd.arg(&msg[..]);
        }

        // `PONG` comes back as a simple string, an echo as a bulk string.
        let reply: String = self.connection.query(&cmd).await?;
        Ok(reply.into())
    }

    /// Get the value of key.
    ///
    /// # return
    ///
    /// If the key does not exist the special value `None` is returned.
    #[instrument(skip(self))]
    pub async fn get(&mut self, key: &str) -> crate::Result<Option<Bytes>> {
        Ok(self.connection.get(key).await?)
    }

    /// Set `key` to hold the given `value`.
    ///
    /// If key already holds a value, it is overwritten. Any previous time to
    /// live associated with the key is discarded.
    #[instrument(skip(self, value))]
    pub async fn set(&mut self, key: &str, value: Bytes) -> crate::Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(&value[..]);

        let () = self.connection.query(&cmd).await?;
        Ok(())
    }

    /// Set `key` to hold the given `value`. The value expires after `expiration`.
    #[instrument(skip(self, value))]
    pub async fn set_expires(&mut self, key: &str, value: Bytes, expiration: Duration) -> crate::Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(&value[..])
            .arg("PX")
            .arg(u64::try_from(expiration.as_millis())?);

        let () = self.connection.query(&cmd).await?;
        Ok(())
    }

    /// Set several keys in a single round trip.
    ///
    /// The commands are pipelined, not atomic: other clients may observe
    /// some of them applied before the others.
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub async fn pipeline_set(&mut self, entries: &[(&str, Bytes)]) -> crate::Result<()> {
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET").arg(*key).arg(&value[..]).ignore();
        }

        let () = self.connection.query_pipeline(&pipe).await?;
        Ok(())
    }

    /// `INCR` `key` and give it a time to live, inside `MULTI`/`EXEC`.
    ///
    /// Returns the incremented value.
    #[instrument(skip(self))]
    pub async fn incr_expire(&mut self, key: &str, ttl: Duration) -> crate::Result<i64> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(u64::try_from(ttl.as_millis())?)
            .ignore();

        let (value,): (i64,) = self.connection.query_pipeline(&pipe).await?;
        debug!(value);
        Ok(value)
    }

    /// Add `members` to the sorted set at `key`.
    ///
    /// Returns the number of members that were not already present.
    #[instrument(skip(self, members), fields(members = members.len()))]
    pub async fn zadd(&mut self, key: &str, members: &[ScoredMember]) -> crate::Result<u64> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for entry in members {
            cmd.arg(entry.score).arg(&entry.member);
        }

        Ok(self.connection.query(&cmd).await?)
    }

    /// Add `delta` to the score of `member`. Returns the new score.
    #[instrument(skip(self))]
    pub async fn zincrby(&mut self, key: &str, delta: f64, member: &str) -> crate::Result<f64> {
        let mut cmd = redis::cmd("ZINCRBY");
        cmd.arg(key).arg(delta).arg(member);

        Ok(self.connection.query(&cmd).await?)
    }

    /// Members ranked `start..=stop`, highest score first.
    #[instrument(skip(self))]
    pub async fn zrevrange_with_scores(&mut self, key: &str, start: isize, stop: isize) -> crate::Result<Vec<ScoredMember>> {
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(key).arg(start).arg(stop).arg("WITHSCORES");

        let reply: Vec<(String, f64)> = self.connection.query(&cmd).await?;
        Ok(into_scored(reply))
    }

    /// Members with `min <= score <= max`, lowest score first.
    ///
    /// `min` and `max` use the server's syntax, so `(97` and `+inf` work.
    #[instrument(skip(self))]
    pub async fn zrange_by_score_with_scores(&mut self, key: &str, min: &str, max: &str) -> crate::Result<Vec<ScoredMember>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max).arg("WITHSCORES");

        let reply: Vec<(String, f64)> = self.connection.query(&cmd).await?;
        Ok(into_scored(reply))
    }

    /// Set `field` of the hash at `key`. Returns `true` if the field is new.
    #[instrument(skip(self, value))]
    pub async fn hset(&mut self, key: &str, field: &str, value: Bytes) -> crate::Result<bool> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(&value[..]);

        let added: u64 = self.connection.query(&cmd).await?;
        Ok(added > 0)
    }

    /// Every field of the hash at `key`. Empty if the key does not exist.
    #[instrument(skip(self))]
    pub async fn hgetall(&mut self, key: &str) -> crate::Result<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);

        Ok(self.connection.query(&cmd).await?)
    }

    /// The given fields of the hash at `key`, `None` for missing ones.
    #[instrument(skip(self))]
    pub async fn hmget(&mut self, key: &str, fields: &[&str]) -> crate::Result<Vec<Option<String>>> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key).arg(fields);

        Ok(self.connection.query(&cmd).await?)
    }

    #[instrument(skip(self))]
    pub async fn hget(&mut self, key: &str, field: &str) -> crate::Result<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);

        Ok(self.connection.query(&cmd).await?)
    }
}

fn into_scored(reply: Vec<(String, f64)>) -> Vec<ScoredMember> {
    reply
        .into_iter()
        .map(|(member, score)| ScoredMember { member, score })
        .collect()
}
