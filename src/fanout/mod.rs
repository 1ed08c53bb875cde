//! Cross-shard fan-out
//!
//! Runs one task per sharding connection, waits for every task, then merges
//! the per-shard results in shard order. A single failed shard fails the
//! whole call; partial results are never returned.
//!
//! Ordering and pagination are per shard: callers that pass `LIMIT`/`OFFSET`
//! get up to `limit * shards` rows, ordered within each shard only.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::group::GroupManager;
use crate::metrics::metrics;
use crate::pool::Connection;
use crate::sharding::{physical_table_name, SelectorError};

/// Work assigned to one sharding connection
#[derive(Debug, Clone)]
pub struct ShardUnit {
    pub connection: Arc<Connection>,
    /// Logical tables resident on this connection's database
    pub table_numbers: Vec<u32>,
}

impl ShardUnit {
    pub fn shard_id(&self) -> u32 {
        self.connection.shard_id()
    }

    /// Physical names of this shard's tables for an entity
    pub fn table_names(&self, entity: &str) -> Result<Vec<String>, SelectorError> {
        self.table_numbers
            .iter()
            .map(|&n| physical_table_name(entity, n))
            .collect()
    }
}

/// Fan-out errors
#[derive(Debug, thiserror::Error)]
pub enum FanOutError<E: std::error::Error + 'static> {
    #[error("Shard {shard_id} failed: {source}")]
    Shard {
        shard_id: u32,
        #[source]
        source: E,
    },

    #[error("Shard {shard_id} unit panicked")]
    Panicked { shard_id: u32 },

    #[error("Cross-shard operation cancelled")]
    Cancelled,

    #[error("Cross-shard operation exceeded its deadline")]
    DeadlineExceeded,
}

impl<E: std::error::Error + 'static> FanOutError<E> {
    fn reason(&self) -> &'static str {
        match self {
            FanOutError::Shard { .. } => "shard_error",
            FanOutError::Panicked { .. } => "panic",
            FanOutError::Cancelled => "cancelled",
            FanOutError::DeadlineExceeded => "deadline",
        }
    }
}

/// Result slot of one unit
enum Slot<T, E> {
    Pending,
    Done(Result<T, E>),
    Panicked,
}

type UnitOutput<T, E> = (usize, Option<Result<T, E>>);

/// Builder for one cross-shard operation
pub struct FanOut<'a> {
    manager: &'a GroupManager,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl<'a> FanOut<'a> {
    pub fn new(manager: &'a GroupManager) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    /// Abort every unit when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Abort every unit when the deadline passes; `None` waits indefinitely
    pub fn with_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Run `unit_fn` once per sharding connection and wait for all of them
    ///
    /// Results come back in ascending shard order. If any unit fails, the
    /// error of the lowest failing shard is returned.
    pub async fn run<T, E, F, Fut>(&self, mut unit_fn: F) -> Result<Vec<T>, FanOutError<E>>
    where
        F: FnMut(ShardUnit) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let started = Instant::now();
        let units = self.manager.shard_units();
        let shard_ids: Vec<u32> = units.iter().map(ShardUnit::shard_id).collect();

        let mut slots: Vec<Slot<T, E>> = (0..units.len()).map(|_| Slot::Pending).collect();
        let mut set: JoinSet<UnitOutput<T, E>> = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let shard_id = unit.shard_id();
            let fut = unit_fn(unit);
            set.spawn(async move {
                let unit_started = Instant::now();
                let result = AssertUnwindSafe(fut).catch_unwind().await.ok();
                debug!(
                    shard_id = shard_id,
                    elapsed_ms = unit_started.elapsed().as_millis() as u64,
                    ok = matches!(result, Some(Ok(_))),
                    "Shard unit finished"
                );
                (index, result)
            });
        }

        let interrupted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(FanOutError::Cancelled),
            _ = deadline(self.timeout) => Some(FanOutError::DeadlineExceeded),
            _ = drain(&mut set, &mut slots) => None,
        };

        if let Some(err) = interrupted {
            set.abort_all();
            warn!(
                shards = shard_ids.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                reason = err.reason(),
                "Cross-shard operation interrupted"
            );
            return Err(self.fail(err, started));
        }

        let mut results = Vec::with_capacity(slots.len());
        for (slot, shard_id) in slots.into_iter().zip(shard_ids) {
            match slot {
                Slot::Done(Ok(value)) => results.push(value),
                Slot::Done(Err(source)) => {
                    return Err(self.fail(FanOutError::Shard { shard_id, source }, started))
                }
                Slot::Pending | Slot::Panicked => {
                    return Err(self.fail(FanOutError::Panicked { shard_id }, started))
                }
            }
        }

        metrics().record_fanout("ok", started.elapsed().as_secs_f64());
        Ok(results)
    }

    /// Run per-shard row queries and concatenate the rows in shard order
    pub async fn collect<T, E, F, Fut>(&self, unit_fn: F) -> Result<Vec<T>, FanOutError<E>>
    where
        F: FnMut(ShardUnit) -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        Ok(self.run(unit_fn).await?.into_iter().flatten().collect())
    }

    /// Run per-shard counts and add them up
    pub async fn sum<E, F, Fut>(&self, unit_fn: F) -> Result<i64, FanOutError<E>>
    where
        F: FnMut(ShardUnit) -> Fut,
        Fut: Future<Output = Result<i64, E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        Ok(self.run(unit_fn).await?.into_iter().sum())
    }

    fn fail<E: std::error::Error + 'static>(
        &self,
        err: FanOutError<E>,
        started: Instant,
    ) -> FanOutError<E> {
        metrics().record_fanout(err.reason(), started.elapsed().as_secs_f64());
        err
    }
}

/// Wait for every unit, filling slots by shard position
async fn drain<T: 'static, E: 'static>(
    set: &mut JoinSet<UnitOutput<T, E>>,
    slots: &mut [Slot<T, E>],
) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Some(result))) => slots[index] = Slot::Done(result),
            Ok((index, None)) => slots[index] = Slot::Panicked,
            // unit was aborted; its slot stays pending
            Err(e) => debug!(error = %e, "Shard unit did not complete"),
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}
