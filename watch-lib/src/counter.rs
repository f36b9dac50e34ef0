//! Integer counters updated through the transaction runner.
//!
//! Many tasks increment the same key at once. Each one watches the key,
//! reads it (absent counts as zero), and writes back `n + 1` only if nobody
//! else wrote in between, so no increment is ever lost.

use crate::{SessionSource, Snapshot, Store, TransactionRunner, TxError, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

/// Tasks spawned by the watch demonstration.
pub const DEFAULT_TASKS: usize = 100;

/// How a batch of concurrent increments ended.
#[derive(Debug, Default)]
pub struct Report {
    /// Increments that committed.
    pub committed: usize,
    /// Increments that did not, in completion order.
    pub failed: Vec<TxError>,
}

/// Add one to the integer at `key`. Returns the value written.
///
/// `deadline`, if given, bounds the whole call including retries.
pub async fn increment<S: Store>(
    store: &mut S,
    runner: &TransactionRunner,
    key: &str,
    deadline: Option<Duration>,
) -> Result<i64, TxError> {
    let keys = [key.to_string()];
    let mut next = 0;

    let update = |snapshot: &Snapshot| -> crate::Result<Vec<Write>> {
        next = snapshot
            .int(key)?
            .checked_add(1)
            .ok_or("counter overflow")?;
        Ok(vec![Write::set(key, next.to_string())])
    };

    match deadline {
        Some(deadline) => runner.run_with_deadline(store, &keys, update, deadline).await?,
        None => runner.run(store, &keys, update).await?,
    };

    // `next` holds what the committing attempt computed.
    Ok(next)
}

/// Spawn `tasks` increments of `key`, each on its own session, and wait for
/// all of them.
///
/// # Errors
///
/// Only if a task panicked. Failed increments are collected in the report.
#[instrument(skip(source, runner))]
pub async fn increment_concurrently<P: SessionSource>(
    source: Arc<P>,
    runner: TransactionRunner,
    key: &str,
    tasks: usize,
    deadline: Option<Duration>,
) -> crate::Result<Report> {
    let mut set = JoinSet::new();

    for _ in 0..tasks {
        let source = source.clone();
        let runner = runner.clone();
        let key = key.to_string();

        set.spawn(async move {
            let mut session = source.session().await?;
            increment(&mut session, &runner, &key, deadline).await
        });
    }

    let mut report = Report::default();
    while let Some(res) = set.join_next().await {
        match res? {
            Ok(_) => report.committed += 1,
            Err(err) => {
                error!(cause = %err, "increment failed");
                report.failed.push(err);
            }
        }
    }

    info!(committed = report.committed, failed = report.failed.len(), "increments done");
    Ok(report)
}
