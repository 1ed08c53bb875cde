//! Helpers shared by unit tests

use tempfile::TempDir;

use crate::config::{DatabaseConfig, DatabaseGroupsConfig, ShardingGroupConfig};
use crate::group::GroupManager;
use crate::retry::RetryPolicy;

/// Groups config with one master and `total / per_db` SQLite shard files in `dir`
pub fn sqlite_groups(
    dir: &TempDir,
    total_tables: u32,
    tables_per_database: u32,
) -> DatabaseGroupsConfig {
    let db = |name: String, id: u32| {
        let path = dir.path().join(name);
        let mut config = DatabaseConfig::sqlite(id, path.to_string_lossy().into_owned());
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

/// Connected manager over fresh SQLite files, with the schema applied
pub async fn migrated_manager(dir: &TempDir) -> GroupManager {
    let manager = GroupManager::connect(&sqlite_groups(dir, 32, 8), &RetryPolicy::none())
        .await
        .unwrap();
    crate::schema::migrate(&manager).await.unwrap();
    manager
}
