//! The capability interface a backing store has to offer.
//!
//! A [`Store`] is one session against the store, in practice one dedicated
//! connection. Watch state belongs to the session, exactly like `WATCH` in
//! Redis belongs to the connection that issued it, so concurrent callers
//! must each obtain their own session from a [`SessionSource`].

use crate::StoreError;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

/// One mutation queued for a conditional commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Set `key` to `value`, discarding any previous time to live.
    Set { key: String, value: Bytes },
    /// Remove `key`.
    Delete { key: String },
    /// Expire `key` after `ttl`. Has no effect if the key does not exist.
    Expire { key: String, ttl: Duration },
}

/// Result of a conditional commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Every write was applied.
    Committed,
    /// A watched key changed after it was watched. Nothing was applied.
    Conflict,
}

/// A single session against the store.
pub trait Store: Send {
    /// Start tracking `keys` for modification.
    ///
    /// Watching accumulates until the next `exec` or `unwatch`.
    fn watch(&mut self, keys: &[String]) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Get the value of `key`. `None` if it does not exist.
    fn get(&mut self, key: &str) -> impl Future<Output = Result<Option<Bytes>, StoreError>> + Send;

    /// Apply `writes` atomically, but only if no watched key changed.
    ///
    /// Watching is released whatever the outcome.
    fn exec(&mut self, writes: &[Write]) -> impl Future<Output = Result<CommitStatus, StoreError>> + Send;

    /// Stop tracking every watched key.
    fn unwatch(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Hands out independent sessions to concurrent callers.
pub trait SessionSource: Send + Sync + 'static {
    type Session: Store + 'static;

    fn session(&self) -> impl Future<Output = Result<Self::Session, StoreError>> + Send;
}

impl Write {
    pub fn set(key: impl ToString, value: impl Into<Bytes>) -> Write {
        Write::Set {
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl ToString) -> Write {
        Write::Delete {
            key: key.to_string(),
        }
    }

    pub fn expire(key: impl ToString, ttl: Duration) -> Write {
        Write::Expire {
            key: key.to_string(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Write::Set { key, .. } | Write::Delete { key } | Write::Expire { key, .. } => key,
        }
    }
}
