use crate::{CommitStatus, Store, StoreError, Write};
use bytes::Bytes;
use tracing::{debug, instrument, warn};

/// One optimistic attempt against a [`Store`].
///
/// Created by [`ConditionalSession::watch`], which registers the keys with
/// the store. The session is consumed by [`commit`](Self::commit) or
/// [`abandon`](Self::abandon), so anything derived from its reads cannot
/// leak into a later attempt.
#[derive(Debug)]
pub struct ConditionalSession<'a, S: Store> {
    store: &'a mut S,
    watched: Vec<String>,
}

impl<'a, S: Store> ConditionalSession<'a, S> {
    /// Watch `keys` for the life of the session.
    #[instrument(skip(store))]
    pub async fn watch(store: &'a mut S, keys: &[String]) -> Result<ConditionalSession<'a, S>, StoreError> {
        if let Err(err) = store.watch(keys).await {
            // The request may have reached the store before failing.
            if let Err(cause) = store.unwatch().await {
                warn!(%cause, "failed to release watched keys");
            }
            return Err(err);
        }

        Ok(ConditionalSession {
            store,
            watched: keys.to_vec(),
        })
    }

    pub fn watched(&self) -> &[String] {
        &self.watched
    }

    /// Current value of `key`; `None` if the key does not exist.
    pub async fn read(&mut self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.store.get(key).await
    }

    /// Current value of `key`, or `default` if the key does not exist.
    pub async fn read_or(&mut self, key: &str, default: &Bytes) -> Result<Bytes, StoreError> {
        Ok(self.read(key).await?.unwrap_or_else(|| default.clone()))
    }

    /// Apply `writes` if none of the watched keys changed since [`watch`](Self::watch).
    ///
    /// `Conflict` is the expected answer when another writer got there first.
    /// A `StoreError` is handed back untouched; retrying is the caller's call.
    #[instrument(skip_all, fields(writes = writes.len()))]
    pub async fn commit(self, writes: &[Write]) -> Result<CommitStatus, StoreError> {
        let status = self.store.exec(writes).await?;
        debug!(watched = ?self.watched, ?status);

        Ok(status)
    }

    /// Give the attempt up without writing anything.
    pub async fn abandon(self) -> Result<(), StoreError> {
        self.store.unwatch().await
    }
}
