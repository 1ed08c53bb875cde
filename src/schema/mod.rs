//! Table DDL and migrations
//!
//! Sharded entities get one table per logical table number, created on the
//! database that owns that number. Timestamps are BIGINT unix milliseconds.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, info};

use crate::config::Driver;
use crate::fanout::{FanOut, FanOutError};
use crate::group::{GroupError, GroupManager};
use crate::model::{NEWS, POSTS, USERS};
use crate::pool::Connection;
use crate::sharding::{physical_table_name, SelectorError, TableSelector};

/// `CREATE TABLE` (and index) statements for one users table
pub fn users_table(driver: Driver, table: &str) -> Vec<String> {
    vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         id VARCHAR(32) NOT NULL PRIMARY KEY, \
         name VARCHAR(100) NOT NULL, \
         email VARCHAR(255) NOT NULL, \
         created_at BIGINT NOT NULL, \
         updated_at BIGINT NOT NULL, \
         {})",
        unique_constraint(driver, table, "email")
    )]
}

/// `CREATE TABLE` (and index) statements for one posts table
pub fn posts_table(driver: Driver, table: &str) -> Vec<String> {
    let columns = "id VARCHAR(32) NOT NULL PRIMARY KEY, \
                   user_id VARCHAR(32) NOT NULL, \
                   title VARCHAR(200) NOT NULL, \
                   content TEXT NOT NULL, \
                   created_at BIGINT NOT NULL, \
                   updated_at BIGINT NOT NULL";
    match driver {
        // MySQL has no CREATE INDEX IF NOT EXISTS
        Driver::Mysql => vec![format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns}, INDEX idx_{table}_user_id (user_id))"
        )],
        Driver::Sqlite | Driver::Postgres => vec![
            format!("CREATE TABLE IF NOT EXISTS {table} ({columns})"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_user_id ON {table} (user_id)"),
        ],
    }
}

/// `CREATE TABLE` statements for the unsharded news table
pub fn news_table(driver: Driver) -> Vec<String> {
    let columns = "id VARCHAR(32) NOT NULL PRIMARY KEY, \
                   title VARCHAR(255) NOT NULL, \
                   content TEXT NOT NULL, \
                   author_id VARCHAR(32), \
                   published_at BIGINT, \
                   created_at BIGINT NOT NULL, \
                   updated_at BIGINT NOT NULL";
    match driver {
        Driver::Mysql => vec![format!(
            "CREATE TABLE IF NOT EXISTS {NEWS} ({columns}, \
             INDEX idx_{NEWS}_author_id (author_id), \
             INDEX idx_{NEWS}_published_at (published_at))"
        )],
        Driver::Sqlite | Driver::Postgres => vec![
            format!("CREATE TABLE IF NOT EXISTS {NEWS} ({columns})"),
            format!("CREATE INDEX IF NOT EXISTS idx_{NEWS}_author_id ON {NEWS} (author_id)"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{NEWS}_published_at ON {NEWS} (published_at)"
            ),
        ],
    }
}

fn unique_constraint(driver: Driver, table: &str, column: &str) -> String {
    match driver {
        Driver::Mysql => format!("UNIQUE KEY uk_{table}_{column} ({column})"),
        Driver::Sqlite | Driver::Postgres => {
            format!("CONSTRAINT uk_{table}_{column} UNIQUE ({column})")
        }
    }
}

/// Statements creating every sharded table resident on one database
pub fn shard_statements(
    driver: Driver,
    table_numbers: &[u32],
) -> Result<Vec<String>, SelectorError> {
    let mut statements = Vec::new();
    for &n in table_numbers {
        statements.extend(users_table(driver, &physical_table_name(USERS, n)?));
        statements.extend(posts_table(driver, &physical_table_name(POSTS, n)?));
    }
    Ok(statements)
}

/// Full DDL listing for a topology, grouped by database
pub fn render(
    master: Driver,
    sharding: Driver,
    selector: &TableSelector,
) -> Result<String, SelectorError> {
    let mut out = String::new();
    let _ = writeln!(out, "-- master");
    for stmt in news_table(master) {
        let _ = writeln!(out, "{stmt};");
    }
    for db_id in 1..=selector.database_count() {
        let tables: Vec<u32> = selector.tables_for_db(db_id).collect();
        let _ = writeln!(out, "\n-- sharding database {db_id}");
        for stmt in shard_statements(sharding, &tables)? {
            let _ = writeln!(out, "{stmt};");
        }
    }
    Ok(out)
}

/// A failed DDL statement
#[derive(Debug, thiserror::Error)]
#[error("DDL failed on {group} database {shard_id}: {source}")]
pub struct StatementError {
    pub group: &'static str,
    pub shard_id: u32,
    #[source]
    pub source: sqlx::Error,
}

/// Migration errors
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error(transparent)]
    Shard(#[from] FanOutError<StatementError>),
}

async fn apply(conn: &Connection, statements: &[String]) -> Result<(), StatementError> {
    for stmt in statements {
        debug!(
            target: "shardgroup::sql",
            shard_id = conn.shard_id(),
            group = %conn.group(),
            sql = %stmt,
            "DDL"
        );
        sqlx::query(stmt)
            .execute(conn.pool())
            .await
            .map_err(|source| StatementError {
                group: conn.group().as_str(),
                shard_id: conn.shard_id(),
                source,
            })?;
    }
    Ok(())
}

/// Create every table on the databases that own it
///
/// The master table is created first, then each sharding database is
/// migrated concurrently. Safe to run repeatedly.
pub async fn migrate(manager: &GroupManager) -> Result<(), SchemaError> {
    let master = manager.master_connection()?;
    apply(&master, &news_table(master.driver())).await?;

    let mut plans = HashMap::new();
    for unit in manager.shard_units() {
        let statements = shard_statements(unit.connection.driver(), &unit.table_numbers)?;
        plans.insert(unit.shard_id(), statements);
    }

    FanOut::new(manager)
        .run(|unit| {
            let statements = plans.remove(&unit.shard_id()).unwrap_or_default();
            async move { apply(&unit.connection, &statements).await }
        })
        .await?;

    info!(
        shards = manager.all_sharding_connections().len(),
        tables_per_entity = manager.table_selector().table_count(),
        "Schema migrated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_support::sqlite_groups;
    use sqlx::Row;

    #[test]
    fn test_users_ddl_per_driver() {
        let sqlite = users_table(Driver::Sqlite, "users_003");
        assert_eq!(sqlite.len(), 1);
        assert!(sqlite[0].starts_with("CREATE TABLE IF NOT EXISTS users_003 ("));
        assert!(sqlite[0].contains("CONSTRAINT uk_users_003_email UNIQUE (email)"));

        let mysql = users_table(Driver::Mysql, "users_003");
        assert!(mysql[0].contains("UNIQUE KEY uk_users_003_email (email)"));
    }

    #[test]
    fn test_posts_ddl_index_placement() {
        assert_eq!(posts_table(Driver::Postgres, "posts_001").len(), 2);
        let mysql = posts_table(Driver::Mysql, "posts_001");
        assert_eq!(mysql.len(), 1);
        assert!(mysql[0].contains("INDEX idx_posts_001_user_id (user_id)"));
    }

    #[test]
    fn test_render_covers_every_table() {
        let selector = TableSelector::new(32, 8).unwrap();
        let ddl = render(Driver::Sqlite, Driver::Mysql, &selector).unwrap();
        assert!(ddl.contains("-- sharding database 4"));
        for n in 0..32 {
            assert!(ddl.contains(&format!("TABLE IF NOT EXISTS users_{n:03} ")));
            assert!(ddl.contains(&format!("TABLE IF NOT EXISTS posts_{n:03} ")));
        }
        assert!(ddl.contains("TABLE IF NOT EXISTS news ("));
    }

    #[tokio::test]
    async fn test_migrate_places_tables_on_owning_shard() {
        let dir = tempfile::tempdir().unwrap();
        let manager = GroupManager::connect(&sqlite_groups(&dir, 32, 8), &RetryPolicy::none())
            .await
            .unwrap();
        migrate(&manager).await.unwrap();
        // idempotent
        migrate(&manager).await.unwrap();

        let shard2 = &manager.all_sharding_connections()[1];
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name LIKE 'users_%' ORDER BY name",
        )
        .fetch_all(shard2.pool())
        .await
        .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
        assert_eq!(names.len(), 8);
        assert_eq!(names[0], "users_008");
        assert_eq!(names[7], "users_015");

        let master = manager.master_connection().unwrap();
        let news: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = 'news'",
        )
        .fetch_one(master.pool())
        .await
        .unwrap()
        .get("n");
        assert_eq!(news, 1);
        manager.close_all().await;
    }
}
