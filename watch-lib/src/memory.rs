//! In-process store with Redis-style `WATCH` semantics.
//!
//! Every mutation of a key (set, delete, expire, expiry) stamps it with a
//! new store-wide revision. A session remembers the revision of each key it
//! watches, and `exec` compares and applies under a single lock, which is
//! what makes the commit atomic.

use crate::{CommitStatus, SessionSource, Store, StoreError, Write};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task;
use tokio::time::{self, Duration, Instant};
use tracing::debug;

/// Owning handle of an in-memory store.
///
/// When this value is dropped, the background expiration task is told to
/// shut down. Sessions created from it keep working on the data.
#[derive(Debug)]
pub struct MemoryStore {
    db: Db,
}

/// A session with its own set of watched keys.
#[derive(Debug)]
pub struct MemorySession {
    db: Db,
    /// Watched keys and the revision they had when watched.
    watched: HashMap<String, u64>,
}

/// Cloning `Db` is shallow and only incurs an atomic ref count increment.
#[derive(Debug, Clone)]
struct Db {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,

    /// Notifies the background task handling entry expiration or the shutdown signal.
    background_task: Notify,
}

#[derive(Debug)]
struct State {
    entries: HashMap<String, Entry>,

    /// Revision of the latest mutation per key. Kept after a key is removed
    /// so that delete-then-recreate still counts as a change.
    revisions: HashMap<String, u64>,

    /// Last revision handed out.
    revision: u64,

    /// Tracks key TTLs, sorted by when they expire.
    expirations: BTreeSet<(Instant, String)>,

    /// Simulated round trip for every session call.
    latency: Duration,

    /// Number of upcoming `exec` calls that fail with a `StoreError`.
    failing_commits: usize,

    /// Number of upcoming session `get` calls that fail with a `StoreError`.
    failing_reads: usize,

    /// `exec` applies at once and only its reply takes `latency`.
    late_commit_replies: bool,

    /// Setting this to `true` signals to the background task to exit.
    shutdown: bool,
}

#[derive(Debug)]
struct Entry {
    data: Bytes,

    expires_at: Option<Instant>,
}

impl MemoryStore {
    /// Create an empty store and spawn its expiration task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> MemoryStore {
        MemoryStore { db: Db::new() }
    }

    /// Read `key` outside of any transaction.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.db.shared.state.lock().unwrap();
        state.purge_expired(Instant::now());
        state.entries.get(key).map(|entry| entry.data.clone())
    }

    /// Set `key` outside of any transaction. Sessions watching it will conflict.
    pub fn set(&self, key: impl ToString, value: impl Into<Bytes>) {
        self.db.apply(&[Write::set(key, value)]);
    }

    pub fn set_expires(&self, key: impl ToString, value: impl Into<Bytes>, expire: Duration) {
        let key = key.to_string();
        self.db
            .apply(&[Write::set(&key, value), Write::expire(&key, expire)]);
    }

    pub fn delete(&self, key: impl ToString) {
        self.db.apply(&[Write::delete(key)]);
    }

    /// Delay every session call by `latency`. With zero latency calls still
    /// yield to the scheduler once, so concurrent sessions interleave.
    pub fn set_latency(&self, latency: Duration) {
        self.db.shared.state.lock().unwrap().latency = latency;
    }

    /// Make the next `count` commits fail as if the store broke mid-call.
    pub fn fail_next_commits(&self, count: usize) {
        self.db.shared.state.lock().unwrap().failing_commits = count;
    }

    /// Make the next `count` session reads fail as if the store broke mid-call.
    pub fn fail_next_reads(&self, count: usize) {
        self.db.shared.state.lock().unwrap().failing_reads = count;
    }

    /// With `late` set, `exec` applies its writes as soon as it is called and
    /// only the reply is delayed by the latency. A commit canceled while
    /// waiting for that reply has still happened.
    pub fn set_late_commit_replies(&self, late: bool) {
        self.db.shared.state.lock().unwrap().late_commit_replies = late;
    }

    /// A new session, independent of every other one.
    pub fn new_session(&self) -> MemorySession {
        MemorySession {
            db: self.db.clone(),
            watched: HashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        let mut state = self.db.shared.state.lock().unwrap();
        state.shutdown = true;
        drop(state);

        self.db.shared.background_task.notify_one();
    }
}

impl SessionSource for MemoryStore {
    type Session = MemorySession;

    async fn session(&self) -> Result<MemorySession, StoreError> {
        Ok(self.new_session())
    }
}

impl MemorySession {
    /// Keys currently watched by this session.
    pub fn watched(&self) -> impl Iterator<Item = &str> {
        self.watched.keys().map(String::as_str)
    }

    /// Compare the watched revisions and apply `writes`, under one lock.
    fn commit(&mut self, writes: &[Write]) -> Result<CommitStatus, StoreError> {
        let watched = std::mem::take(&mut self.watched);

        let mut state = self.db.shared.state.lock().unwrap();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::command("injected commit failure"));
        }

        state.purge_expired(Instant::now());
        let changed = watched
            .iter()
            .any(|(key, revision)| state.revision_of(key) != *revision);
        if changed {
            return Ok(CommitStatus::Conflict);
        }

        let notify = state.apply(writes);
        drop(state);

        if notify {
            self.db.shared.background_task.notify_one();
        }

        Ok(CommitStatus::Committed)
    }

    async fn round_trip(&self) {
        let latency = self.db.shared.state.lock().unwrap().latency;

        if latency.is_zero() {
            task::yield_now().await;
        } else {
            time::sleep(latency).await;
        }
    }
}

impl Store for MemorySession {
    async fn watch(&mut self, keys: &[String]) -> Result<(), StoreError> {
        self.round_trip().await;

        let mut state = self.db.shared.state.lock().unwrap();
        state.purge_expired(Instant::now());
        for key in keys {
            let revision = state.revision_of(key);
            self.watched.entry(key.clone()).or_insert(revision);
        }

        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.round_trip().await;

        let mut state = self.db.shared.state.lock().unwrap();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(StoreError::command("injected read failure"));
        }

        state.purge_expired(Instant::now());
        Ok(state.entries.get(key).map(|entry| entry.data.clone()))
    }

    async fn exec(&mut self, writes: &[Write]) -> Result<CommitStatus, StoreError> {
        let late = self.db.shared.state.lock().unwrap().late_commit_replies;

        if late {
            let res = self.commit(writes);
            self.round_trip().await;
            res
        } else {
            self.round_trip().await;
            self.commit(writes)
        }
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        self.watched.clear();
        Ok(())
    }
}

impl Db {
    fn new() -> Db {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: HashMap::new(),
                revisions: HashMap::new(),
                revision: 0,
                expirations: BTreeSet::new(),
                latency: Duration::ZERO,
                failing_commits: 0,
                failing_reads: 0,
                late_commit_replies: false,
                shutdown: false,
            }),
            background_task: Notify::new(),
        });

        // Start the background task.
        tokio::spawn(purge_expired_tasks(shared.clone()));

        Db { shared }
    }

    fn apply(&self, writes: &[Write]) {
        let mut state = self.shared.state.lock().unwrap();
        state.purge_expired(Instant::now());
        let notify = state.apply(writes);
        drop(state);

        if notify {
            self.shared.background_task.notify_one();
        }
    }
}

impl Shared {
    /// Purge all expired keys and return the `Instant` at which the **next**
    /// key will expire. The background task will sleep until this instant.
    fn purge_expired_keys(&self) -> Option<Instant> {
        let mut state = self.state.lock().unwrap();

        if state.shutdown {
            return None;
        }

        state.purge_expired(Instant::now());
        state.next_expiration()
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }
}

impl State {
    fn next_expiration(&self) -> Option<Instant> {
        self.expirations
            .iter()
            .next()
            .map(|expiration| expiration.0)
    }

    fn revision_of(&self, key: &str) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        self.revision += 1;
        self.revisions.insert(key.to_string(), self.revision);
    }

    /// Remove every key that expired at or before `now`. Expiry is a
    /// modification as far as watchers are concerned.
    fn purge_expired(&mut self, now: Instant) {
        while let Some((when, key)) = self.expirations.first().cloned() {
            if when > now {
                return;
            }

            debug!(key, "expired");
            self.entries.remove(&key);
            self.expirations.remove(&(when, key.clone()));
            self.touch(&key);
        }
    }

    /// Apply `writes` in order. Returns `true` if the background task must
    /// be woken because the next expiration moved earlier.
    fn apply(&mut self, writes: &[Write]) -> bool {
        let mut notify = false;

        for write in writes {
            let changed = match write {
                Write::Set { key, value } => {
                    let prev = self.entries.insert(
                        key.clone(),
                        Entry {
                            data: value.clone(),
                            expires_at: None,
                        },
                    );
                    // The previous TTL no longer applies.
                    if let Some(when) = prev.and_then(|prev| prev.expires_at) {
                        self.expirations.remove(&(when, key.clone()));
                    }
                    true
                }
                Write::Delete { key } => match self.entries.remove(key) {
                    Some(prev) => {
                        if let Some(when) = prev.expires_at {
                            self.expirations.remove(&(when, key.clone()));
                        }
                        true
                    }
                    None => false,
                },
                Write::Expire { key, ttl } => {
                    let when = Instant::now() + *ttl;
                    let next = self.next_expiration();

                    match self.entries.get_mut(key) {
                        Some(entry) => {
                            if let Some(prev) = entry.expires_at.replace(when) {
                                self.expirations.remove(&(prev, key.clone()));
                            }
                            self.expirations.insert((when, key.clone()));
                            // Only wake the background task if this is now the next key to evict.
                            notify |= next.map_or(true, |next| next > when);
                            true
                        }
                        None => false,
                    }
                }
            };

            if changed {
                self.touch(write.key());
            }
        }

        notify
    }
}

/// Routine executed by the background task.
///
/// Wait to be notified. On notification, purge any expired keys from the shared
/// state handle. If `shutdown` is set, terminate the task.
async fn purge_expired_tasks(shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        // Purge all keys that are expired.
        if let Some(when) = shared.purge_expired_keys() {
            tokio::select! {
                _ = time::sleep_until(when) => {}
                _ = shared.background_task.notified() => {}
            }
        } else {
            // There are no keys expiring in the future. Wait until the task is notified.
            shared.background_task.notified().await;
        }
    }

    debug!("Purge background task shut down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_and_recreate_is_a_change() {
        let store = MemoryStore::new();
        store.set("k", "1");

        let mut session = store.new_session();
        session.watch(&["k".to_string()]).await.unwrap();
        store.delete("k");
        store.set("k", "1");

        let status = session.exec(&[Write::set("k", "2")]).await.unwrap();
        assert_eq!(status, CommitStatus::Conflict);
        assert_eq!(store.get("k"), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn exec_releases_the_watch() {
        let store = MemoryStore::new();
        let mut session = store.new_session();

        session.watch(&["k".to_string()]).await.unwrap();
        store.set("k", "other");
        assert_eq!(session.exec(&[]).await.unwrap(), CommitStatus::Conflict);
        assert_eq!(session.watched().count(), 0);

        // Nothing watched any more, so the next exec goes through.
        let status = session.exec(&[Write::set("k", "mine")]).await.unwrap();
        assert_eq!(status, CommitStatus::Committed);
        assert_eq!(store.get("k"), Some(Bytes::from("mine")));
    }

    #[tokio::test]
    async fn unwatched_keys_do_not_conflict() {
        let store = MemoryStore::new();
        let mut session = store.new_session();

        session.watch(&["a".to_string()]).await.unwrap();
        store.set("b", "x");

        let status = session.exec(&[Write::set("a", "1")]).await.unwrap();
        assert_eq!(status, CommitStatus::Committed);
    }

    #[tokio::test(start_paused = true)]
    async fn key_expires() {
        let store = MemoryStore::new();
        store.set_expires("k", "v", Duration::from_secs(1));
        assert_eq!(store.get("k"), Some(Bytes::from("v")));

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k"), None);
    }

    #[tokio::test]
    async fn set_clears_previous_ttl() {
        let store = MemoryStore::new();
        store.set_expires("k", "v", Duration::from_millis(1));
        store.set("k", "w");

        time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("k"), Some(Bytes::from("w")));
    }

    #[tokio::test]
    async fn injected_read_failure_is_a_store_error() {
        let store = MemoryStore::new();
        store.set("k", "v");
        store.fail_next_reads(1);

        let mut session = store.new_session();
        assert!(matches!(session.get("k").await, Err(StoreError::Command(_))));
        assert_eq!(session.get("k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_commits_before_answering() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_secs(1));
        store.set_late_commit_replies(true);

        let mut session = store.new_session();
        let res = time::timeout(Duration::from_millis(10), session.exec(&[Write::set("k", "v")])).await;

        assert!(res.is_err());
        assert_eq!(store.get("k"), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn injected_failure_applies_nothing() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);

        let mut session = store.new_session();
        let res = session.exec(&[Write::set("k", "v")]).await;
        assert!(matches!(res, Err(StoreError::Command(_))));
        assert_eq!(store.get("k"), None);

        let status = session.exec(&[Write::set("k", "v")]).await.unwrap();
        assert_eq!(status, CommitStatus::Committed);
    }
}
