//! Error taxonomy for conditional transactions.
//!
//! A watch conflict is not an error and does not appear here: it is a
//! [`CommitStatus`](crate::CommitStatus) handled by the runner. What does
//! appear is split so callers can tell "the store is broken" apart from
//! "contention is too high" and "we gave up waiting".

use std::fmt;

/// Failure talking to the store.
#[derive(Debug)]
pub enum StoreError {
    /// The store could not be reached at all.
    Connection(crate::Error),

    /// An I/O or protocol failure during an otherwise valid operation.
    Command(crate::Error),
}

/// Terminal failure of a [`TransactionRunner`](crate::TransactionRunner) run.
#[derive(Debug)]
pub enum TxError {
    /// The store failed. Never retried.
    Store(StoreError),

    /// Every attempt hit a watch conflict.
    Exhausted { attempts: u32 },

    /// The update function rejected the values it was given.
    Aborted(crate::Error),

    /// The caller's deadline or cancellation fired mid-run.
    Canceled,
}

impl StoreError {
    pub fn connection(err: impl Into<crate::Error>) -> StoreError {
        StoreError::Connection(err.into())
    }

    pub fn command(err: impl Into<crate::Error>) -> StoreError {
        StoreError::Command(err.into())
    }

    /// Reclassify as a connection failure, e.g. when the handshake itself failed.
    pub(crate) fn into_connection(self) -> StoreError {
        match self {
            StoreError::Command(err) => StoreError::Connection(err),
            err => err,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl TxError {
    /// `true` when raising the attempt budget or backing off could help.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, TxError::Exhausted { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TxError::Canceled)
    }

    pub fn is_store(&self) -> bool {
        matches!(self, TxError::Store(_))
    }
}

impl From<StoreError> for TxError {
    fn from(src: StoreError) -> TxError {
        TxError::Store(src)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(src: redis::RedisError) -> StoreError {
        if src.is_connection_refusal() {
            StoreError::Connection(src.into())
        } else {
            StoreError::Command(src.into())
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connection(err) => write!(f, "store unreachable; {}", err),
            StoreError::Command(err) => write!(f, "store error; {}", err),
        }
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Store(err) => write!(f, "{}", err),
            TxError::Exhausted { attempts } => {
                write!(f, "transaction reached maximum number of retries ({})", attempts)
            }
            TxError::Aborted(err) => write!(f, "transaction aborted; {}", err),
            TxError::Canceled => f.write_str("transaction canceled"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Connection(err) | StoreError::Command(err) => Some(&**err),
        }
    }
}

impl std::error::Error for TxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TxError::Store(err) => Some(err),
            TxError::Aborted(err) => Some(&**err),
            _ => None,
        }
    }
}
