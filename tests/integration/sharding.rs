//! Routing and group construction against real SQLite shards

use shardgroup::config::load_config;
use shardgroup::group::{GroupError, GroupManager};
use shardgroup::pool::GroupKind;
use shardgroup::retry::RetryPolicy;
use shardgroup::sharding::{ShardKey, TableSelector};

use crate::{first_table_of, setup, sqlite_groups, user_on_table};

#[test]
fn test_integer_keys_route_to_documented_tables() {
    let selector = TableSelector::new(32, 8).unwrap();

    let cases = [(1, "entity_001", 1), (8, "entity_008", 2), (100, "entity_004", 1)];
    for (key, table, db) in cases {
        let key = ShardKey::Int(key);
        assert_eq!(selector.table_name("entity", &key).unwrap(), table);
        assert_eq!(selector.db_id(selector.table_number(&key)).unwrap(), db);
    }
}

#[tokio::test]
async fn test_sharding_connections_in_shard_order() {
    let (_dir, manager) = setup().await;

    let shard_ids: Vec<u32> = manager
        .all_sharding_connections()
        .iter()
        .map(|c| c.shard_id())
        .collect();
    assert_eq!(shard_ids, vec![1, 2, 3, 4]);
    assert_eq!(manager.master_connection().unwrap().group(), GroupKind::Master);
    assert_eq!(manager.master().len(), 1);
}

#[tokio::test]
async fn test_uuid_keys_land_on_owning_shard() {
    let (_dir, manager) = setup().await;

    for shard_id in 1..=4 {
        let user = user_on_table(first_table_of(shard_id), &format!("s{shard_id}"));
        let key = ShardKey::parse_uuid(&user.id).unwrap();

        let (route, conn) = manager.route("users", &key).unwrap();
        assert_eq!(route.table_number, first_table_of(shard_id));
        assert_eq!(route.shard_id, shard_id);
        assert_eq!(conn.shard_id(), shard_id);
        assert_eq!(
            manager.sharding_connection_by_key(&key).unwrap().shard_id(),
            shard_id
        );
    }
}

#[tokio::test]
async fn test_every_table_maps_inside_its_database_range() {
    let (_dir, manager) = setup().await;
    let selector = manager.table_selector();

    for table_number in 0..selector.table_count() {
        let conn = manager.sharding_connection(table_number).unwrap();
        assert!(selector
            .tables_for_db(conn.shard_id())
            .contains(&table_number));
    }
    assert!(manager.sharding_connection(selector.table_count()).is_err());
}

#[tokio::test]
async fn test_connect_from_toml_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = |name: &str| dir.path().join(name).to_string_lossy().replace('\\', "/");
    let toml = format!(
        r#"
[database.groups]
master = [{{ id = 1, driver = "sqlite", dsn = "{master}" }}]

[database.groups.sharding]
total_tables = 4
tables_per_database = 2
databases = [
    {{ id = 1, driver = "sqlite", dsn = "{s1}", table_range = [0, 1] }},
    {{ id = 2, driver = "sqlite", dsn = "{s2}", table_range = [2, 3] }},
]
tables = [{{ name = "users", suffix_count = 4 }}]

[retry]
max_attempts = 2
"#,
        master = path("master.db"),
        s1 = path("s1.db"),
        s2 = path("s2.db"),
    );
    let config_path = dir.path().join("shardgroup.toml");
    std::fs::write(&config_path, toml).unwrap();

    let config = load_config(&config_path).unwrap();
    let manager = GroupManager::connect(&config.database.groups, &RetryPolicy::from(&config.retry))
        .await
        .unwrap();

    assert_eq!(manager.sharding().len(), 2);
    assert_eq!(manager.sharding_connection(3).unwrap().shard_id(), 2);
    assert!(manager.ping_all().await.iter().all(|p| p.result.is_ok()));
    manager.close_all().await;
}

#[tokio::test]
async fn test_unreachable_shard_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut groups = sqlite_groups(&dir, 32, 8);
    groups.sharding.databases[2].dsn = Some(format!(
        "sqlite://{}?mode=ro",
        dir.path().join("missing").join("shard3.sqlite").display()
    ));

    let err = GroupManager::connect(&groups, &RetryPolicy::none())
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::Connection(_)));
}

#[tokio::test]
async fn test_uneven_topology_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut groups = sqlite_groups(&dir, 32, 8);
    groups.sharding.tables_per_database = 5;

    assert!(GroupManager::connect(&groups, &RetryPolicy::none())
        .await
        .is_err());
}
