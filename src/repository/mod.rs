//! Entity repositories
//!
//! Routed operations resolve the key to one table on one sharding database
//! and run a single statement there. List, count and join operations fan out
//! to every sharding database. Callers depend on the traits so services can
//! swap in their own implementations in tests.

mod exec;
mod news;
mod posts;
mod sample;
mod users;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fanout::{FanOut, FanOutError};
use crate::group::{GroupError, GroupManager};
use crate::model::{
    CreateNews, CreatePost, CreateUser, News, Post, UpdatePost, UpdateUser, User, UserPost,
};
use crate::retry::RetryPolicy;
use crate::sharding::SelectorError;

use exec::{query_error, run, tables_label, union_all};

pub use exec::SQL_TARGET;
pub use news::SqlNewsRepository;
pub use posts::SqlPostRepository;
pub use sample::{generate_sample_data, SampleSummary};
pub use users::SqlUserRepository;

/// Rows per `INSERT` statement in batch operations
pub const BATCH_SIZE: usize = 500;

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("Query on shard {shard_id} ({table}) failed: {source}")]
    Query {
        shard_id: u32,
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Query on shard {shard_id} ({table}) failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        shard_id: u32,
        table: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Shard {shard_id} failed: {source}")]
    Shard {
        shard_id: u32,
        #[source]
        source: Box<RepoError>,
    },

    #[error("Shard {shard_id} unit panicked")]
    ShardPanicked { shard_id: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation exceeded its deadline")]
    DeadlineExceeded,
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        match self {
            RepoError::NotFound { .. } => true,
            RepoError::Shard { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<FanOutError<RepoError>> for RepoError {
    fn from(err: FanOutError<RepoError>) -> Self {
        match err {
            FanOutError::Shard { shard_id, source } => RepoError::Shard {
                shard_id,
                source: Box::new(source),
            },
            FanOutError::Panicked { shard_id } => RepoError::ShardPanicked { shard_id },
            FanOutError::Cancelled => RepoError::Cancelled,
            FanOutError::DeadlineExceeded => RepoError::DeadlineExceeded,
        }
    }
}

/// Rows of one entity held by one sharding database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardCount {
    pub shard_id: u32,
    pub rows: i64,
}

/// Shared state of the SQL repositories
#[derive(Debug, Clone)]
pub struct RepoContext {
    manager: Arc<GroupManager>,
    retry: RetryPolicy,
    fanout_timeout: Option<Duration>,
}

impl RepoContext {
    pub fn new(manager: Arc<GroupManager>) -> Self {
        Self {
            manager,
            retry: RetryPolicy::default(),
            fanout_timeout: None,
        }
    }

    /// Context configured from the `[retry]` and `[fanout]` sections
    pub fn from_config(manager: Arc<GroupManager>, config: &Config) -> Self {
        Self::new(manager)
            .with_retry(RetryPolicy::from(&config.retry))
            .with_fanout_timeout(config.fanout.timeout())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fanout_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.fanout_timeout = timeout.into();
        self
    }

    pub fn manager(&self) -> &GroupManager {
        &self.manager
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Row count of a sharded entity on each sharding database, in shard order
    pub async fn shard_counts(
        &self,
        entity: &'static str,
        cancel: CancellationToken,
    ) -> Result<Vec<ShardCount>, RepoError> {
        let retry = self.retry.clone();
        let counts = self
            .fanout(cancel)
            .run(move |unit| {
                let retry = retry.clone();
                async move {
                    let tables = unit.table_names(entity)?;
                    let label = tables_label(&tables);
                    let sql = format!(
                        "SELECT COUNT(*) AS n FROM ({}) AS c",
                        union_all(&tables, "id")
                    );

                    let row = run(&retry, &unit.connection, &label, "count", &sql, || {
                        sqlx::query(&sql).fetch_one(unit.connection.pool())
                    })
                    .await?;

                    let rows = row
                        .try_get::<i64, _>("n")
                        .map_err(|e| query_error(&unit.connection, &label, e))?;
                    Ok::<_, RepoError>(ShardCount {
                        shard_id: unit.shard_id(),
                        rows,
                    })
                }
            })
            .await?;
        Ok(counts)
    }

    fn fanout(&self, cancel: CancellationToken) -> FanOut<'_> {
        FanOut::new(&self.manager)
            .with_cancel(cancel)
            .with_timeout(self.fanout_timeout)
    }
}

/// Users, sharded by id
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, req: CreateUser) -> Result<User, RepoError>;

    /// Create users in per-table batches; returned in request order
    async fn create_batch(&self, reqs: Vec<CreateUser>) -> Result<Vec<User>, RepoError>;

    /// Insert fully built users (ids already assigned)
    async fn insert_batch(&self, users: &[User]) -> Result<(), RepoError>;

    async fn get_by_id(&self, id: &str) -> Result<User, RepoError>;

    /// Users ordered by id within each shard; `limit`/`offset` apply per shard
    async fn list(
        &self,
        limit: u32,
        offset: u32,
        cancel: CancellationToken,
    ) -> Result<Vec<User>, RepoError>;

    async fn update(&self, id: &str, req: UpdateUser) -> Result<User, RepoError>;

    async fn delete(&self, id: &str) -> Result<(), RepoError>;

    async fn count(&self, cancel: CancellationToken) -> Result<i64, RepoError>;
}

/// Posts, sharded by the author's id
#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn create(&self, req: CreatePost) -> Result<Post, RepoError>;

    /// Insert fully built posts, grouped by their author's table
    async fn insert_batch(&self, posts: &[Post]) -> Result<(), RepoError>;

    async fn get_by_id(&self, id: &str, user_id: &str) -> Result<Post, RepoError>;

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Post>, RepoError>;

    /// Newest first within each shard; `limit`/`offset` apply per shard
    async fn list(
        &self,
        limit: u32,
        offset: u32,
        cancel: CancellationToken,
    ) -> Result<Vec<Post>, RepoError>;

    /// Posts joined with their authors, joined locally on each shard
    async fn user_posts(
        &self,
        limit: u32,
        offset: u32,
        cancel: CancellationToken,
    ) -> Result<Vec<UserPost>, RepoError>;

    async fn update(&self, id: &str, user_id: &str, req: UpdatePost) -> Result<Post, RepoError>;

    async fn delete(&self, id: &str, user_id: &str) -> Result<(), RepoError>;

    async fn count(&self, cancel: CancellationToken) -> Result<i64, RepoError>;
}

/// News, stored in the master group
#[async_trait]
pub trait NewsRepository: Send + Sync {
    async fn create(&self, req: CreateNews) -> Result<News, RepoError>;

    /// Insert in chunks of [`BATCH_SIZE`], each chunk retried on its own
    async fn insert_batch(&self, news: &[News]) -> Result<(), RepoError>;

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<News>, RepoError>;

    async fn count(&self) -> Result<i64, RepoError>;
}
