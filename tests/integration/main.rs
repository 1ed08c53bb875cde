//! Integration test entry point
//!
//! Run with: cargo test --test integration
//!
//! Every test builds its own topology of SQLite files in a temporary
//! directory: one master database plus `total_tables / tables_per_database`
//! shard databases.

mod fanout;
mod repository;
mod sharding;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use shardgroup::config::{DatabaseConfig, DatabaseGroupsConfig, ShardingGroupConfig};
use shardgroup::group::GroupManager;
use shardgroup::idgen::generate_id;
use shardgroup::model::User;
use shardgroup::repository::RepoContext;
use shardgroup::retry::RetryPolicy;

/// Tables per shard in the default test topology
pub const TABLES_PER_DATABASE: u32 = 8;
/// Logical tables in the default test topology (4 shards)
pub const TOTAL_TABLES: u32 = 32;

/// SQLite-backed groups config rooted at `dir`
pub fn sqlite_groups(
    dir: &TempDir,
    total_tables: u32,
    tables_per_database: u32,
) -> DatabaseGroupsConfig {
    let db = |file: String, id: u32| {
        let mut config =
            DatabaseConfig::sqlite(id, dir.path().join(file).to_string_lossy().into_owned());
        config.max_connections = 4;
        config.max_idle_connections = 1;
        config
    };

    DatabaseGroupsConfig {
        master: vec![db("master.sqlite".to_string(), 1)],
        sharding: ShardingGroupConfig {
            total_tables,
            tables_per_database,
            databases: (1..=total_tables / tables_per_database)
                .map(|id| db(format!("shard{id}.sqlite"), id))
                .collect(),
            tables: Vec::new(),
        },
    }
}

/// Connected 4-shard manager with the schema applied
pub async fn setup() -> (TempDir, Arc<GroupManager>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = GroupManager::connect(
        &sqlite_groups(&dir, TOTAL_TABLES, TABLES_PER_DATABASE),
        &RetryPolicy::none(),
    )
    .await
    .expect("connect groups");
    shardgroup::schema::migrate(&manager)
        .await
        .expect("migrate schema");
    (dir, Arc::new(manager))
}

pub fn context(manager: &Arc<GroupManager>) -> RepoContext {
    RepoContext::new(Arc::clone(manager)).with_retry(RetryPolicy::none())
}

/// User whose id routes to `table_number`
///
/// The routing value of an id is its last four bytes read big-endian.
pub fn user_on_table(table_number: u32, tag: &str) -> User {
    let mut bytes = *uuid::Uuid::parse_str(&generate_id())
        .expect("generated id parses")
        .as_bytes();
    bytes[12..].copy_from_slice(&table_number.to_be_bytes());
    // stored at millisecond precision
    let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).expect("valid now");
    User {
        id: uuid::Uuid::from_bytes(bytes).simple().to_string(),
        name: format!("user {tag}"),
        email: format!("{tag}@example.com"),
        created_at: now,
        updated_at: now,
    }
}

/// First table resident on shard `shard_id` of the default topology
pub fn first_table_of(shard_id: u32) -> u32 {
    (shard_id - 1) * TABLES_PER_DATABASE
}
