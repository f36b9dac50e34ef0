//! Bounded optimistic retry loop.
//!
//! Every attempt watches the keys, reads them, hands the values to the
//! caller's update function and tries a conditional commit of whatever it
//! returned. A conflict throws the attempt away and starts over with a fresh
//! read; anything else ends the run.

use crate::{Backoff, CommitStatus, ConditionalSession, Snapshot, Store, TxError, Write};
use bytes::Bytes;
use std::future::Future;
use tokio::time::{self, Duration};
use tracing::{debug, instrument, warn};

/// Attempt budget used by [`TransactionRunner::default`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Drives read-modify-write updates through repeated [`ConditionalSession`]s.
///
/// The runner keeps no state between runs, so one runner can be shared by
/// any number of concurrent callers. Coordination between them happens in
/// the store, not here.
#[derive(Debug, Clone)]
pub struct TransactionRunner {
    max_attempts: u32,
    backoff: Backoff,
    /// Substituted for keys that do not exist.
    default: Bytes,
}

/// A successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// The values read by the winning attempt with its writes applied.
    pub values: Snapshot,
    /// Attempts used, including the one that committed.
    pub attempts: u32,
}

/// Attempts left for one run. Only ever counts down.
#[derive(Debug)]
struct RetryState {
    remaining: u32,
    used: u32,
}

/// Non-terminal outcome of a single attempt.
enum Attempt {
    Committed(Snapshot),
    Conflict,
}

impl TransactionRunner {
    /// A runner that gives up after `max_attempts` conflicts. A budget of
    /// zero is treated as one.
    pub fn new(max_attempts: u32) -> TransactionRunner {
        TransactionRunner {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::None,
            default: Bytes::from_static(b"0"),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> TransactionRunner {
        self.backoff = backoff;
        self
    }

    /// Value handed to the update function for keys that do not exist. `"0"`
    /// unless set.
    pub fn with_default(mut self, default: impl Into<Bytes>) -> TransactionRunner {
        self.default = default.into();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn default_value(&self) -> &Bytes {
        &self.default
    }

    /// Run `update` against `keys` until a commit goes through.
    ///
    /// # Errors
    ///
    /// * [`TxError::Store`] as soon as the store fails, without retrying.
    /// * [`TxError::Aborted`] if `update` returns an error.
    /// * [`TxError::Exhausted`] when every attempt conflicted.
    #[instrument(skip(self, store, update))]
    pub async fn run<S, F>(&self, store: &mut S, keys: &[String], mut update: F) -> Result<Committed, TxError>
    where
        S: Store,
        F: FnMut(&Snapshot) -> crate::Result<Vec<Write>> + Send,
    {
        let mut retry = RetryState::new(self.max_attempts);

        while let Some(attempt) = retry.next_attempt() {
            match self.attempt(store, keys, &mut update).await? {
                Attempt::Committed(values) => {
                    debug!(attempt, "committed");
                    return Ok(Committed {
                        values,
                        attempts: attempt,
                    });
                }
                Attempt::Conflict => {
                    debug!(attempt, "watched key changed; retrying");

                    if retry.remaining > 0 {
                        let delay = self.backoff.delay(attempt);
                        if !delay.is_zero() {
                            time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        warn!(attempts = retry.used, "retry budget exhausted");
        Err(TxError::Exhausted {
            attempts: retry.used,
        })
    }

    /// Like [`run`](Self::run), but gives up with [`TxError::Canceled`] once
    /// `cancel` completes.
    ///
    /// Whatever store call was in flight is abandoned. If that call was the
    /// commit, it may or may not have been applied; the store decides.
    pub async fn run_until<S, F, C>(
        &self,
        store: &mut S,
        keys: &[String],
        update: F,
        cancel: C,
    ) -> Result<Committed, TxError>
    where
        S: Store,
        F: FnMut(&Snapshot) -> crate::Result<Vec<Write>> + Send,
        C: Future,
    {
        tokio::select! {
            res = self.run(store, keys, update) => res,
            _ = cancel => {
                warn!("transaction canceled");
                Err(TxError::Canceled)
            }
        }
    }

    /// Like [`run`](Self::run), bounded by `deadline` for the whole call.
    pub async fn run_with_deadline<S, F>(
        &self,
        store: &mut S,
        keys: &[String],
        update: F,
        deadline: Duration,
    ) -> Result<Committed, TxError>
    where
        S: Store,
        F: FnMut(&Snapshot) -> crate::Result<Vec<Write>> + Send,
    {
        self.run_until(store, keys, update, time::sleep(deadline)).await
    }

    async fn attempt<S, F>(&self, store: &mut S, keys: &[String], update: &mut F) -> Result<Attempt, TxError>
    where
        S: Store,
        F: FnMut(&Snapshot) -> crate::Result<Vec<Write>> + Send,
    {
        let mut session = ConditionalSession::watch(store, keys).await?;

        let mut snapshot = Snapshot::with_capacity(keys.len());
        for key in keys {
            match session.read_or(key, &self.default).await {
                Ok(value) => snapshot.insert(key.clone(), value),
                Err(err) => {
                    release(session).await;
                    return Err(err.into());
                }
            }
        }

        let writes = match update(&snapshot) {
            Ok(writes) => writes,
            Err(err) => {
                release(session).await;
                return Err(TxError::Aborted(err));
            }
        };

        match session.commit(&writes).await? {
            CommitStatus::Committed => {
                for write in writes {
                    match write {
                        Write::Set { key, value } => snapshot.insert(key, value),
                        Write::Delete { key } => snapshot.remove(&key),
                        Write::Expire { .. } => {}
                    }
                }
                Ok(Attempt::Committed(snapshot))
            }
            CommitStatus::Conflict => Ok(Attempt::Conflict),
        }
    }
}

/// Drop the watch of an attempt that will not commit. Failures are only logged.
async fn release<S: Store>(session: ConditionalSession<'_, S>) {
    if let Err(cause) = session.abandon().await {
        warn!(%cause, "failed to release watched keys");
    }
}

impl Default for TransactionRunner {
    fn default() -> TransactionRunner {
        TransactionRunner::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryState {
    fn new(max_attempts: u32) -> RetryState {
        RetryState {
            remaining: max_attempts,
            used: 0,
        }
    }

    /// Number of the next attempt, or `None` once the budget is spent.
    fn next_attempt(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;
        self.used += 1;
        Some(self.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_state_counts_down_to_zero() {
        let mut retry = RetryState::new(3);

        assert_eq!(retry.next_attempt(), Some(1));
        assert_eq!(retry.next_attempt(), Some(2));
        assert_eq!(retry.next_attempt(), Some(3));
        assert_eq!(retry.next_attempt(), None);
        assert_eq!(retry.next_attempt(), None);
        assert_eq!(retry.remaining, 0);
    }

    #[test]
    fn zero_budget_still_makes_one_attempt() {
        assert_eq!(TransactionRunner::new(0).max_attempts(), 1);
    }

    #[test]
    fn defaults() {
        let runner = TransactionRunner::default();
        assert_eq!(runner.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(runner.backoff(), Backoff::None);
        assert_eq!(runner.default_value(), &Bytes::from("0"));

        let backoff = Backoff::exponential(Duration::from_millis(1), Duration::from_millis(8));
        let runner = runner.with_backoff(backoff).with_default("");
        assert_eq!(runner.backoff(), backoff);
        assert!(runner.default_value().is_empty());
    }
}
