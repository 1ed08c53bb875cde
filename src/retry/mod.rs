//! Bounded retry of single-shard operations
//!
//! Errors are classified through [`Transient`]. Transient errors are retried
//! with exponential backoff, capped both by attempt count and by total elapsed
//! time. Everything else is returned on the first failure.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::metrics::metrics;

/// Classification of an error as worth retrying
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// SQLSTATE / vendor codes reported for lock contention and serialization failures
///
/// - `40001` serialization failure / MySQL deadlock
/// - `40P01` PostgreSQL deadlock, `55P03` PostgreSQL lock not available
/// - `1205` / `1213` MySQL lock wait timeout / deadlock (vendor numbers)
/// - `5` / `6` SQLite BUSY / LOCKED and their extended forms
const TRANSIENT_CODES: &[&str] = &[
    "40001", "40P01", "55P03", "1205", "1213", "5", "6", "261", "262", "517",
];

const TRANSIENT_MESSAGES: &[&str] = &[
    "database is locked",
    "database table is locked",
    "lock wait timeout exceeded",
    "deadlock found",
];

impl Transient for sqlx::Error {
    fn is_transient(&self) -> bool {
        match self {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => {
                is_transient_database_error(db.code().as_deref(), db.message())
            }
            _ => false,
        }
    }
}

fn is_transient_database_error(code: Option<&str>, message: &str) -> bool {
    if code.is_some_and(|c| TRANSIENT_CODES.contains(&c)) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    TRANSIENT_MESSAGES.iter().any(|m| message.contains(m))
}

/// Retry policy: attempt cap, exponential backoff and an elapsed-time budget
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            multiplier: if config.multiplier >= 1.0 { config.multiplier } else { 1.0 },
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
        }
    }
}

impl RetryPolicy {
    /// Fixed-delay policy without an elapsed budget
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_elapsed: Duration::MAX,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Outcome of a failed retried operation
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Non-transient error, returned after the first failure
    #[error(transparent)]
    Permanent(E),

    #[error("Gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent(_) => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { source, .. } => source,
        }
    }
}

/// Run `op`, retrying transient failures according to `policy`
///
/// The operation must be safe to repeat; callers generate identifiers before
/// entering the loop.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + fmt::Display + std::error::Error + 'static,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_transient() {
            metrics().record_retry("permanent");
            return Err(RetryError::Permanent(err));
        }

        let delay = policy.delay_for(attempt);
        let over_budget = started
            .elapsed()
            .checked_add(delay)
            .map_or(true, |total| total > policy.max_elapsed);

        if attempt >= policy.max_attempts || over_budget {
            warn!(
                attempts = attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "Giving up on transient error"
            );
            metrics().record_retry("exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        warn!(
            attempt = attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient error, retrying"
        );
        metrics().record_retry("retried");
        tokio::time::sleep(delay).await;
    }
}
