//! Statement execution shared by the repositories
//!
//! Every statement goes through [`run`]: SQL logged under the
//! `shardgroup::sql` target, retried on transient errors, timed, and failures
//! mapped to [`RepoError`] with shard and table attached.

use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::Driver;
use crate::metrics::metrics;
use crate::pool::Connection;
use crate::retry::{execute_with_retry, RetryError, RetryPolicy};

use super::RepoError;

/// Target for statement logging
pub const SQL_TARGET: &str = "shardgroup::sql";

/// Run one statement against `conn` with retry
pub(crate) async fn run<T, F, Fut>(
    retry: &RetryPolicy,
    conn: &Connection,
    table: &str,
    op: &'static str,
    sql: &str,
    query: F,
) -> Result<T, RepoError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    debug!(
        target: SQL_TARGET,
        group = %conn.group(),
        shard_id = conn.shard_id(),
        table = table,
        op = op,
        sql = sql,
        "Executing statement"
    );

    let started = Instant::now();
    let result = execute_with_retry(retry, query).await;
    metrics().record_query(
        conn.group().as_str(),
        conn.shard_id(),
        op,
        started.elapsed().as_secs_f64(),
    );

    result.map_err(|e| match e {
        RetryError::Permanent(source) => {
            metrics().record_query_error("permanent");
            query_error(conn, table, source)
        }
        RetryError::Exhausted { attempts, source } => {
            metrics().record_query_error("exhausted");
            RepoError::RetriesExhausted {
                shard_id: conn.shard_id(),
                table: table.to_string(),
                attempts,
                source,
            }
        }
    })
}

pub(crate) fn query_error(conn: &Connection, table: &str, source: sqlx::Error) -> RepoError {
    RepoError::Query {
        shard_id: conn.shard_id(),
        table: table.to_string(),
        source,
    }
}

/// `INSERT` of `rows` rows; bind markers numbered from 1
pub(crate) fn insert_sql(driver: Driver, table: &str, columns: &[&str], rows: usize) -> String {
    let width = columns.len();
    let values: Vec<String> = (0..rows)
        .map(|r| format!("({})", markers(driver, r * width + 1, width)))
        .collect();
    format!(
        "INSERT INTO {table} ({}) VALUES {}",
        columns.join(", "),
        values.join(", ")
    )
}

/// `count` comma-separated bind markers starting at position `start`
pub(crate) fn markers(driver: Driver, start: usize, count: usize) -> String {
    (start..start + count)
        .map(|n| driver.bind_marker(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `SELECT {columns} FROM t1 UNION ALL SELECT {columns} FROM t2 ...`
pub(crate) fn union_all(tables: &[String], columns: &str) -> String {
    tables
        .iter()
        .map(|t| format!("SELECT {columns} FROM {t}"))
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

/// Label for a statement spanning a shard's tables
pub(crate) fn tables_label(tables: &[String]) -> String {
    match (tables.first(), tables.last()) {
        (Some(first), Some(last)) if first != last => format!("{first}..{last}"),
        (Some(first), _) => first.clone(),
        _ => String::new(),
    }
}

/// Current time at the millisecond precision it is stored with
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| sqlx::Error::Decode(format!("invalid timestamp {ms}").into()))
}
